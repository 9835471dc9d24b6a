//! Domain Knowledge Base
//!
//! Static business vocabulary → physical schema mapping. Built once from a
//! `KnowledgeDefinition` and read-only afterwards, so it can be shared across
//! concurrent requests behind an `Arc` without locking.
//!
//! Lookup order for a term:
//! 1. exact key (case-insensitive)
//! 2. synonym
//! 3. best fuzzy score against every entry name, accepted above the threshold

pub mod definition;
pub mod gaming;
pub mod similarity;
pub mod time;

pub use definition::{
    AllowedValue, DimensionDefinition, JoinRule, JoinType, KnowledgeDefinition, MetricDefinition,
    SchemaDefinition,
};
pub use time::{Clock, RelativePeriod};

use crate::config::MatchingConfig;
use crate::error::Result;
use crate::feedback::{FeedbackQueue, MappingFeedback};
use crate::model::TimeRange;
use similarity::{normalize_term, similarity, tie_breaker, EXACT_SCORE};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// A dictionary entry together with the score that selected it
#[derive(Debug, Clone, Copy)]
pub struct TermMatch<'a, T> {
    pub entry: &'a T,
    pub score: f64,
}

/// Common view over metric and dimension entries
pub trait VocabularyEntry {
    fn key(&self) -> &str;
    fn name(&self) -> &str;
    fn synonyms(&self) -> &[String];
}

impl VocabularyEntry for MetricDefinition {
    fn key(&self) -> &str {
        &self.key
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn synonyms(&self) -> &[String] {
        &self.synonyms
    }
}

impl VocabularyEntry for DimensionDefinition {
    fn key(&self) -> &str {
        &self.key
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn synonyms(&self) -> &[String] {
        &self.synonyms
    }
}

/// Entries plus key and synonym indexes into them
#[derive(Debug, Clone)]
struct Vocabulary<T> {
    entries: Vec<T>,
    by_key: HashMap<String, usize>,
    by_synonym: HashMap<String, usize>,
}

impl<T: VocabularyEntry> Vocabulary<T> {
    fn build(entries: Vec<T>) -> Self {
        let mut by_key = HashMap::new();
        let mut by_synonym = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_key.entry(normalize_term(entry.key())).or_insert(idx);
            for synonym in entry.synonyms() {
                by_synonym.entry(normalize_term(synonym)).or_insert(idx);
            }
        }
        Self {
            entries,
            by_key,
            by_synonym,
        }
    }

    fn lookup(&self, term: &str, accept_threshold: f64) -> Option<TermMatch<'_, T>> {
        let normalized = normalize_term(term);
        if normalized.is_empty() {
            return None;
        }

        if let Some(&idx) = self.by_key.get(&normalized).or_else(|| self.by_synonym.get(&normalized)) {
            return Some(TermMatch {
                entry: &self.entries[idx],
                score: EXACT_SCORE,
            });
        }

        // First entry wins on equal scores
        let mut best: Option<TermMatch<'_, T>> = None;
        for entry in &self.entries {
            let score = similarity(&normalized, entry.name());
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(TermMatch { entry, score });
            }
        }

        match best {
            Some(found) if found.score > accept_threshold => {
                debug!("Fuzzy matched '{}' to '{}' ({:.2})", term, found.entry.name(), found.score);
                Some(found)
            }
            _ => None,
        }
    }

    /// Up to `limit` names scoring above `threshold` against `term`, best first
    fn suggestions(&self, term: &str, threshold: f64, limit: usize) -> Vec<String> {
        let mut scored: Vec<(f64, f64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| {
                let score = similarity(term, entry.key());
                (score > threshold).then(|| (score, tie_breaker(term, entry.key()), idx))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
                .then(a.2.cmp(&b.2))
        });

        scored
            .into_iter()
            .take(limit)
            .map(|(_, _, idx)| self.entries[idx].name().to_string())
            .collect()
    }

    /// `limit` names ordered by key
    fn stable_names(&self, limit: usize) -> Vec<String> {
        let mut ordered: Vec<&T> = self.entries.iter().collect();
        ordered.sort_by(|a, b| a.key().to_lowercase().cmp(&b.key().to_lowercase()));
        ordered
            .into_iter()
            .take(limit)
            .map(|e| e.name().to_string())
            .collect()
    }
}

pub struct DomainKnowledgeBase {
    metrics: Vocabulary<MetricDefinition>,
    dimensions: Vocabulary<DimensionDefinition>,
    schema: SchemaDefinition,
    default_metric: String,
    starter_metrics: Vec<String>,
    matching: MatchingConfig,
    clock: Clock,
    feedback: FeedbackQueue,
}

impl DomainKnowledgeBase {
    /// Validate and index a definition.
    pub fn new(definition: KnowledgeDefinition) -> Result<Self> {
        definition.validate()?;
        Ok(Self::index(definition))
    }

    /// The built-in gaming dictionary
    pub fn gaming() -> Self {
        Self::index(gaming::definition())
    }

    fn index(definition: KnowledgeDefinition) -> Self {
        Self {
            metrics: Vocabulary::build(definition.metrics),
            dimensions: Vocabulary::build(definition.dimensions),
            schema: definition.schema,
            default_metric: definition.default_metric,
            starter_metrics: definition.starter_metrics,
            matching: MatchingConfig::default(),
            clock: Clock::System,
            feedback: FeedbackQueue::disabled(),
        }
    }

    pub fn with_matching(mut self, matching: MatchingConfig) -> Self {
        self.matching = matching;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackQueue) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn map_metric(&self, term: &str) -> Option<TermMatch<'_, MetricDefinition>> {
        let found = self.metrics.lookup(term, self.matching.accept_threshold);
        if found.is_none() {
            warn!("No metric mapping for '{}'", term);
        }
        found
    }

    pub fn map_dimension(&self, term: &str) -> Option<TermMatch<'_, DimensionDefinition>> {
        let found = self.dimensions.lookup(term, self.matching.accept_threshold);
        if found.is_none() {
            warn!("No dimension mapping for '{}'", term);
        }
        found
    }

    pub fn list_metrics(&self) -> &[MetricDefinition] {
        &self.metrics.entries
    }

    pub fn list_dimensions(&self) -> &[DimensionDefinition] {
        &self.dimensions.entries
    }

    pub fn resolve_time_range(&self, range: Option<&TimeRange>) -> TimeRange {
        time::resolve_time_range(range, &self.clock)
    }

    /// Fire-and-forget; never blocks and never fails.
    pub fn record_feedback(&self, term: &str, mapped_to: &str, correct: bool, correction: Option<&str>) {
        self.feedback
            .record(MappingFeedback::new(term, mapped_to, correct, correction));
    }

    pub fn metric_suggestions(&self, term: &str, limit: usize) -> Vec<String> {
        self.metrics
            .suggestions(term, self.matching.suggestion_threshold, limit)
    }

    pub fn dimension_suggestions(&self, term: &str, limit: usize) -> Vec<String> {
        self.dimensions
            .suggestions(term, self.matching.suggestion_threshold, limit)
    }

    pub fn stable_metric_names(&self, limit: usize) -> Vec<String> {
        self.metrics.stable_names(limit)
    }

    pub fn stable_dimension_names(&self, limit: usize) -> Vec<String> {
        self.dimensions.stable_names(limit)
    }

    pub fn starter_metrics(&self) -> &[String] {
        &self.starter_metrics
    }

    pub fn default_metric(&self) -> &str {
        &self.default_metric
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    pub fn matching(&self) -> &MatchingConfig {
        &self.matching
    }

    /// Canonical value for `value` when it matches an allowed key or value.
    /// `None` when the dimension has no closed value set or nothing matches.
    pub fn normalize_value(&self, dimension: &DimensionDefinition, value: &str) -> Option<String> {
        let wanted = normalize_term(value);
        dimension
            .allowed_values
            .iter()
            .find(|allowed| {
                normalize_term(&allowed.key) == wanted || normalize_term(&allowed.value) == wanted
            })
            .map(|allowed| allowed.value.clone())
    }
}
