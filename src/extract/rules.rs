//! Rule-Based Extraction
//!
//! Deterministic, offline extraction driven by the knowledge-base vocabulary.
//! Text is lower-cased and scanned in passes; every span a pass consumes is
//! masked with `#` so later passes cannot reuse it:
//!
//! 1. explicit `from YYYY-MM-DD to YYYY-MM-DD` ranges
//! 2. relative periods (those after `vs` / `compared to` become comparisons)
//! 3. `top N` / `bottom N`
//! 4. vocabulary phrases, longest first: filter values, metrics, dimensions
//! 5. `by <term>` / `per <term>` grouping for words the vocabulary missed

use super::EntityExtractor;
use crate::error::{NlqError, Result};
use crate::knowledge::DomainKnowledgeBase;
use crate::model::{
    Aggregation, Comparison, Dimension, Filter, Metric, QueryEntities, SortDirection, SortOption,
    TimeRange,
};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, info};

const DEFAULT_RANK_LIMIT: i64 = 10;
const MAX_GROUP_WORDS: usize = 2;

/// Words that end a `by <term>` capture
const GROUP_STOPWORDS: &[&str] = &[
    "by", "per", "and", "or", "for", "in", "on", "with", "from", "to", "during", "over", "last",
    "this", "past", "previous", "of", "vs", "versus", "compared", "top", "bottom", "excluding", "except",
    "not", "without", "where", "since", "between", "today", "yesterday", "hour", "hours", "day",
    "days", "week", "weeks", "month", "months", "quarter", "quarters", "year", "years", "date",
];
const GROUP_FILLER: &[&str] = &["the", "each", "a"];

/// Filter values not present in any allowed-value table: (dimension, phrase, value)
const VALUE_LEXICON: &[(&str, &str, &str)] = &[
    ("country", "uk", "UK"),
    ("country", "united kingdom", "UK"),
    ("country", "germany", "Germany"),
    ("country", "german", "Germany"),
    ("game type", "table game", "Table Games"),
    ("game type", "live casino", "Live Dealer"),
];

lazy_static! {
    static ref RELATIVE_PERIODS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"\b(?:last|past)\s+90\s+days\b").unwrap(), "last_90_days"),
        (Regex::new(r"\b(?:last|past)\s+30\s+days\b").unwrap(), "last_30_days"),
        (Regex::new(r"\btoday\b").unwrap(), "today"),
        (Regex::new(r"\byesterday\b").unwrap(), "yesterday"),
        (Regex::new(r"\bthis\s+week\b").unwrap(), "this_week"),
        (Regex::new(r"\b(?:last|past|previous)\s+week\b").unwrap(), "last_week"),
        (Regex::new(r"\bthis\s+month\b").unwrap(), "this_month"),
        (Regex::new(r"\b(?:last|previous)\s+month\b").unwrap(), "last_month"),
        (Regex::new(r"\bthis\s+quarter\b").unwrap(), "this_quarter"),
        (Regex::new(r"\b(?:last|previous)\s+quarter\b").unwrap(), "last_quarter"),
        (Regex::new(r"\b(?:this\s+year|year\s+to\s+date|ytd)\b").unwrap(), "this_year"),
        (Regex::new(r"\b(?:last|previous)\s+year\b").unwrap(), "last_year"),
    ];
    static ref EXPLICIT_RANGE: Regex = Regex::new(
        r"\b(?:from|between)\s+(\d{4}-\d{2}-\d{2})\s+(?:to|and|until|through)\s+(\d{4}-\d{2}-\d{2})\b"
    )
    .unwrap();
    static ref COMPARISON_CUE: Regex =
        Regex::new(r"\b(?:vs\.?|versus|compared\s+(?:to|with)|against)\s+$").unwrap();
    static ref RANK_WITH_COUNT: Regex =
        Regex::new(r"\b(top|bottom|best|worst|highest|lowest)\s+(\d+)\b").unwrap();
    static ref RANK_BARE: Regex = Regex::new(r"\b(top|bottom)\b").unwrap();
    static ref GROUP_BY: Regex =
        Regex::new(r"\b(?:by|per)\s+([a-z][a-z0-9_]*)(?:\s+([a-z][a-z0-9_]*))?").unwrap();
    static ref NEGATION_CUE: Regex = Regex::new(
        r"\b(?:excluding|exclude|except|not|without|other\s+than)\s+(?:(?:for|in|from|on)\s+)?$"
    )
    .unwrap();
    static ref AGGREGATION_CUE: Regex = Regex::new(
        r"\b(average|avg|mean|total|sum\s+of|number\s+of|count\s+of|maximum|max|minimum|min)\s+(?:of\s+)?$"
    )
    .unwrap();
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Metric(String),
    Dimension(String),
    Value { dimension: String, value: String },
}

impl Target {
    /// Values win ties against metrics, metrics against dimensions
    fn priority(&self) -> u8 {
        match self {
            Target::Value { .. } => 0,
            Target::Metric(_) => 1,
            Target::Dimension(_) => 2,
        }
    }
}

#[derive(Debug)]
struct Phrase {
    pattern: Regex,
    length: usize,
    target: Target,
}

#[derive(Debug)]
struct Hit {
    start: usize,
    target: Target,
    negated: bool,
    aggregation: Option<Aggregation>,
}

struct Ranking {
    limit: i64,
    direction: SortDirection,
}

pub struct RuleBasedExtractor {
    phrases: Vec<Phrase>,
    default_metric: String,
}

impl RuleBasedExtractor {
    pub fn new(kb: &DomainKnowledgeBase) -> Result<Self> {
        let mut candidates: Vec<(String, Target)> = Vec::new();

        for dimension in kb.list_dimensions() {
            for allowed in &dimension.allowed_values {
                for phrase in [&allowed.key, &allowed.value] {
                    candidates.push((
                        phrase.to_lowercase(),
                        Target::Value {
                            dimension: dimension.key.clone(),
                            value: allowed.value.clone(),
                        },
                    ));
                }
            }
        }
        for (dimension, phrase, value) in VALUE_LEXICON {
            if kb.list_dimensions().iter().any(|d| d.key == *dimension) {
                candidates.push((
                    phrase.to_string(),
                    Target::Value {
                        dimension: dimension.to_string(),
                        value: value.to_string(),
                    },
                ));
            }
        }
        for metric in kb.list_metrics() {
            for phrase in std::iter::once(&metric.key).chain(metric.synonyms.iter()) {
                candidates.push((phrase.to_lowercase(), Target::Metric(metric.key.clone())));
            }
        }
        for dimension in kb.list_dimensions() {
            for phrase in std::iter::once(&dimension.key).chain(dimension.synonyms.iter()) {
                candidates.push((phrase.to_lowercase(), Target::Dimension(dimension.key.clone())));
            }
        }

        candidates.sort_by(|(a, ta), (b, tb)| {
            b.len().cmp(&a.len()).then(ta.priority().cmp(&tb.priority()))
        });

        let mut seen = HashSet::new();
        let mut phrases = Vec::new();
        for (phrase, target) in candidates {
            let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
            if phrase.is_empty() || !seen.insert(phrase.clone()) {
                continue;
            }
            let pattern = Regex::new(&phrase_pattern(&phrase)).map_err(|e| {
                NlqError::KnowledgeBase(format!("Cannot build pattern for '{}': {}", phrase, e))
            })?;
            phrases.push(Phrase {
                pattern,
                length: phrase.len(),
                target,
            });
        }
        debug!("Rule extractor built with {} vocabulary phrases", phrases.len());

        Ok(Self {
            phrases,
            default_metric: kb.default_metric().to_string(),
        })
    }

    /// Synchronous extraction; never fails.
    pub fn extract_entities(&self, text: &str) -> QueryEntities {
        let mut entities = QueryEntities::new();
        let mut masked = text.to_lowercase();
        if masked.trim().is_empty() {
            return entities;
        }

        let explicit = take_explicit_range(&mut masked);
        let (relative, comparisons) = take_periods(&mut masked);
        entities.time_range = explicit.or(relative);
        entities.comparisons = comparisons;

        let ranking = take_ranking(&mut masked);
        let mut hits = self.take_vocabulary(&mut masked);
        let groups = take_group_terms(&mut masked);

        hits.sort_by_key(|hit| hit.start);
        let mut dimensions: Vec<(usize, Dimension)> = Vec::new();
        for hit in hits {
            match hit.target {
                Target::Metric(key) => {
                    if !entities.metrics.iter().any(|m| m.name == key) {
                        let mut metric = Metric::candidate(key);
                        metric.aggregation = hit.aggregation;
                        entities.metrics.push(metric);
                    }
                }
                Target::Dimension(key) => {
                    if !dimensions.iter().any(|(_, d)| d.name == key) {
                        dimensions.push((hit.start, Dimension::candidate(key)));
                    }
                }
                Target::Value { dimension, value } => {
                    let mut filter = Filter::equals(dimension, value);
                    if hit.negated {
                        filter = filter.negated();
                    }
                    if !entities.filters.contains(&filter) {
                        entities.filters.push(filter);
                    }
                }
            }
        }
        for (start, term) in groups {
            if !dimensions.iter().any(|(_, d)| d.name == term) {
                dimensions.push((start, Dimension::candidate(term)));
            }
        }
        dimensions.sort_by_key(|(start, _)| *start);
        entities.dimensions = dimensions.into_iter().map(|(_, d)| d).collect();

        if let Some(ranking) = ranking {
            let field = entities
                .metrics
                .first()
                .map(|m| m.name.clone())
                .unwrap_or_else(|| self.default_metric.clone());
            entities.limit = Some(ranking.limit);
            entities.sort_by = Some(SortOption {
                field,
                direction: ranking.direction,
                database_field: None,
            });
        }

        info!(
            "Rule extraction: {} metrics, {} dimensions, {} filters",
            entities.metrics.len(),
            entities.dimensions.len(),
            entities.filters.len()
        );
        entities
    }

    fn take_vocabulary(&self, masked: &mut String) -> Vec<Hit> {
        let mut hits = Vec::new();
        for phrase in &self.phrases {
            if phrase.length > masked.len() {
                continue;
            }
            let spans: Vec<(usize, usize)> = phrase
                .pattern
                .find_iter(masked.as_str())
                .map(|m| (m.start(), m.end()))
                .collect();
            for (start, end) in spans {
                let prefix = &masked[..start];
                let negated = NEGATION_CUE.is_match(prefix);
                let aggregation = AGGREGATION_CUE
                    .captures(prefix)
                    .and_then(|caps| caps.get(1))
                    .and_then(|cue| aggregation_for_cue(cue.as_str()));
                mask(masked, start, end);
                hits.push(Hit {
                    start,
                    target: phrase.target.clone(),
                    negated,
                    aggregation,
                });
            }
        }
        hits
    }
}

#[async_trait]
impl EntityExtractor for RuleBasedExtractor {
    fn name(&self) -> &'static str {
        "rule"
    }

    async fn extract(&self, text: &str) -> Result<QueryEntities> {
        Ok(self.extract_entities(text))
    }
}

/// `\b` + words joined by flexible whitespace + optional plural `s` + `\b`
fn phrase_pattern(phrase: &str) -> String {
    let mut body = phrase
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    if body.len() > 3 && body.ends_with('s') && !body.ends_with("ss") {
        body.pop();
    }
    format!(r"\b{}s?\b", body)
}

fn mask(text: &mut String, start: usize, end: usize) {
    text.replace_range(start..end, &"#".repeat(end - start));
}

fn aggregation_for_cue(cue: &str) -> Option<Aggregation> {
    let cue = cue.split_whitespace().collect::<Vec<_>>().join(" ");
    match cue.as_str() {
        "average" | "avg" | "mean" => Some(Aggregation::Avg),
        "total" | "sum of" => Some(Aggregation::Sum),
        "number of" | "count of" => Some(Aggregation::Count),
        "maximum" | "max" => Some(Aggregation::Max),
        "minimum" | "min" => Some(Aggregation::Min),
        _ => None,
    }
}

fn take_explicit_range(masked: &mut String) -> Option<TimeRange> {
    let (start, end, range) = {
        let caps = EXPLICIT_RANGE.captures(masked.as_str())?;
        let whole = caps.get(0)?;
        (
            whole.start(),
            whole.end(),
            TimeRange::explicit(caps.get(1)?.as_str(), caps.get(2)?.as_str()),
        )
    };
    mask(masked, start, end);
    Some(range)
}

fn take_periods(masked: &mut String) -> (Option<TimeRange>, Vec<Comparison>) {
    let snapshot = masked.clone();
    let mut found: Vec<(usize, usize, &'static str)> = RELATIVE_PERIODS
        .iter()
        .flat_map(|(pattern, token)| {
            pattern
                .find_iter(&snapshot)
                .map(move |m| (m.start(), m.end(), *token))
        })
        .collect();
    found.sort_by_key(|(start, _, _)| *start);

    let mut range = None;
    let mut comparisons: Vec<Comparison> = Vec::new();
    for (start, end, token) in found {
        if masked[start..end].contains('#') {
            continue;
        }
        let is_comparison = COMPARISON_CUE.is_match(&masked[..start]);
        mask(masked, start, end);
        if is_comparison {
            if !comparisons.iter().any(|c| c.baseline == token) {
                comparisons.push(Comparison {
                    baseline: token.to_string(),
                });
            }
        } else if range.is_none() {
            range = Some(TimeRange::relative(token));
        }
    }
    (range, comparisons)
}

fn take_ranking(masked: &mut String) -> Option<Ranking> {
    let (start, end, word, limit) = if let Some(caps) = RANK_WITH_COUNT.captures(masked.as_str()) {
        let whole = caps.get(0)?;
        let limit = caps
            .get(2)
            .and_then(|n| n.as_str().parse::<i64>().ok())
            .unwrap_or(DEFAULT_RANK_LIMIT);
        (whole.start(), whole.end(), caps.get(1)?.as_str().to_string(), limit)
    } else {
        let found = RANK_BARE.find(masked.as_str())?;
        (found.start(), found.end(), found.as_str().to_string(), DEFAULT_RANK_LIMIT)
    };
    mask(masked, start, end);

    let direction = match word.as_str() {
        "bottom" | "worst" | "lowest" => SortDirection::Asc,
        _ => SortDirection::Desc,
    };
    Some(Ranking { limit, direction })
}

fn take_group_terms(masked: &mut String) -> Vec<(usize, String)> {
    let snapshot = masked.clone();
    let mut terms = Vec::new();
    for caps in GROUP_BY.captures_iter(&snapshot) {
        let words: Vec<regex::Match> = [caps.get(1), caps.get(2)]
            .into_iter()
            .flatten()
            .skip_while(|w| GROUP_FILLER.contains(&w.as_str()))
            .take_while(|w| !GROUP_STOPWORDS.contains(&w.as_str()))
            .take(MAX_GROUP_WORDS)
            .collect();
        let (Some(first), Some(last)) = (words.first(), words.last()) else {
            continue;
        };
        let term = words.iter().map(|w| w.as_str()).collect::<Vec<_>>().join(" ");
        let (start, end) = (first.start(), last.end());
        mask(masked, start, end);
        terms.push((start, term));
    }
    terms
}
