//! LLM-backed extraction over an OpenAI-compatible chat completion API.

use super::EntityExtractor;
use crate::config::LlmConfig;
use crate::error::{NlqError, Result};
use crate::knowledge::DomainKnowledgeBase;
use crate::model::{
    Aggregation, Comparison, Dimension, Filter, FilterOperator, Metric, QueryEntities,
    SortDirection, SortOption, TimeRange,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Shape the model is asked to answer with. Every field is optional so a
/// partially filled answer still yields a candidate.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawExtraction {
    metrics: Vec<RawMetric>,
    dimensions: Vec<String>,
    filters: Vec<RawFilter>,
    time_range: Option<RawTimeRange>,
    comparisons: Vec<String>,
    sort: Option<RawSort>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMetric {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        aggregation: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    dimension: String,
    #[serde(default)]
    operator: Option<String>,
    value: serde_json::Value,
    #[serde(default)]
    negated: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTimeRange {
    start: Option<String>,
    end: Option<String>,
    relative_period: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSort {
    field: String,
    #[serde(default)]
    direction: Option<String>,
}

pub struct LlmExtractor {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    vocabulary: String,
}

impl LlmExtractor {
    pub fn new(config: &LlmConfig, kb: &DomainKnowledgeBase) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            NlqError::Validation("OPENAI_API_KEY is required for the llm extractor".to_string())
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            vocabulary: describe_vocabulary(kb),
        })
    }

    fn build_prompt(&self, question: &str) -> String {
        format!(
            r#"You extract analytics query entities from a user question.

Known vocabulary:
{}

Relative periods: today, yesterday, this_week, last_week, this_month, last_month,
last_30_days, last_90_days, this_quarter, last_quarter, this_year, last_year.

User question: "{}"

Return JSON in this exact format (use the user's own words for unknown terms):
{{
  "metrics": [{{"name": "deposits", "aggregation": null}}],
  "dimensions": ["country"],
  "filters": [{{"dimension": "country", "operator": "equals", "value": "UK", "negated": false}}],
  "time_range": {{"relative_period": "last_week", "start": null, "end": null}},
  "comparisons": [],
  "sort": null,
  "limit": null
}}

Only return the JSON, no other text."#,
            self.vocabulary, question
        )
    }

    async fn call_llm(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are a precise JSON-only responder. Always return valid JSON, no other text."},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
            "max_tokens": 1000
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::Extraction(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(NlqError::Extraction(format!(
                "LLM API returned {}: {}",
                status, detail
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NlqError::Extraction(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| NlqError::Extraction("No content in LLM response".to_string()))?;

        Ok(content.to_string())
    }
}

#[async_trait]
impl EntityExtractor for LlmExtractor {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn extract(&self, text: &str) -> Result<QueryEntities> {
        if text.trim().is_empty() {
            return Ok(QueryEntities::new());
        }
        let prompt = self.build_prompt(text);
        let content = self.call_llm(&prompt).await?;
        debug!("LLM extraction answer: {}", content);
        let entities = parse_response(&content)?;
        info!(
            "LLM extraction: {} metrics, {} dimensions, {} filters",
            entities.metrics.len(),
            entities.dimensions.len(),
            entities.filters.len()
        );
        Ok(entities)
    }
}

fn describe_vocabulary(kb: &DomainKnowledgeBase) -> String {
    let mut lines = Vec::new();
    for metric in kb.list_metrics() {
        lines.push(format!(
            "- metric {} (aliases: {})",
            metric.key,
            metric.synonyms.join(", ")
        ));
    }
    for dimension in kb.list_dimensions() {
        let mut line = format!(
            "- dimension {} (aliases: {})",
            dimension.key,
            dimension.synonyms.join(", ")
        );
        if !dimension.allowed_values.is_empty() {
            let values: Vec<&str> = dimension
                .allowed_values
                .iter()
                .map(|v| v.value.as_str())
                .collect();
            line.push_str(&format!(" values: {}", values.join(", ")));
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Drop a surrounding ```json fence if the model added one
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(value_text)
            .collect::<Vec<_>>()
            .join(","),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn parse_response(content: &str) -> Result<QueryEntities> {
    let raw: RawExtraction = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| NlqError::Extraction(format!("Failed to parse extraction JSON: {}", e)))?;

    let mut entities = QueryEntities::new();

    for metric in raw.metrics {
        let (name, aggregation) = match metric {
            RawMetric::Name(name) => (name, None),
            RawMetric::Detailed { name, aggregation } => (name, aggregation),
        };
        if name.trim().is_empty() {
            continue;
        }
        let mut candidate = Metric::candidate(name.trim());
        candidate.aggregation = aggregation.and_then(|a| a.parse::<Aggregation>().ok());
        entities.metrics.push(candidate);
    }

    entities.dimensions = raw
        .dimensions
        .into_iter()
        .filter(|d| !d.trim().is_empty())
        .map(|d| Dimension::candidate(d.trim()))
        .collect();

    for filter in raw.filters {
        let operator = match filter.operator.as_deref() {
            Some(op) => op.parse().unwrap_or_else(|_| {
                warn!("Unknown filter operator '{}', using equals", op);
                FilterOperator::Equals
            }),
            None => FilterOperator::Equals,
        };
        entities.filters.push(Filter {
            dimension: filter.dimension,
            operator,
            value: value_text(&filter.value),
            is_negated: filter.negated,
            database_field: None,
        });
    }

    entities.time_range = raw.time_range.and_then(|t| {
        if t.start.is_none() && t.end.is_none() && t.relative_period.is_none() {
            None
        } else {
            Some(TimeRange {
                start: t.start,
                end: t.end,
                granularity: None,
                relative_period: t.relative_period,
            })
        }
    });

    entities.comparisons = raw
        .comparisons
        .into_iter()
        .map(|baseline| Comparison { baseline })
        .collect();

    entities.sort_by = raw.sort.map(|sort| SortOption {
        field: sort.field,
        direction: sort
            .direction
            .as_deref()
            .map(SortDirection::parse_lenient)
            .unwrap_or_default(),
        database_field: None,
    });
    entities.limit = raw.limit;

    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_fenced_answer() {
        let content = r#"```json
{"metrics": [{"name": "deposits", "aggregation": "avg"}], "dimensions": ["country"],
 "filters": [{"dimension": "country", "operator": "equals", "value": "UK"}],
 "time_range": {"relative_period": "last_week"}, "limit": 5,
 "sort": {"field": "deposits", "direction": "ASC"}}
```"#;
        let entities = parse_response(content).unwrap();
        assert_eq!(entities.metrics[0].name, "deposits");
        assert_eq!(entities.metrics[0].aggregation, Some(Aggregation::Avg));
        assert_eq!(entities.dimensions[0].name, "country");
        assert_eq!(entities.filters[0].value, "UK");
        assert_eq!(entities.limit, Some(5));
        assert_eq!(entities.sort_by.unwrap().direction, SortDirection::Asc);
    }

    #[test]
    fn test_lenient_fields() {
        let content = r#"{"metrics": ["revenue", ""], "filters": [
            {"dimension": "country", "operator": "one of", "value": ["UK", "Germany"], "negated": true}
        ], "time_range": {}}"#;
        let entities = parse_response(content).unwrap();
        assert_eq!(entities.metrics.len(), 1);
        assert!(entities.metrics[0].aggregation.is_none());
        assert_eq!(entities.filters[0].operator, FilterOperator::Equals);
        assert_eq!(entities.filters[0].value, "UK,Germany");
        assert!(entities.filters[0].is_negated);
        assert!(entities.time_range.is_none());
    }

    #[test]
    fn test_unknown_aggregation_is_dropped() {
        let entities =
            parse_response(r#"{"metrics": [{"name": "rtp", "aggregation": "median"}]}"#).unwrap();
        assert!(entities.metrics[0].aggregation.is_none());
    }

    #[test]
    fn test_garbage_is_extraction_error() {
        assert!(matches!(
            parse_response("I could not understand"),
            Err(NlqError::Extraction(_))
        ));
    }

    #[test]
    fn test_requires_api_key() {
        let config = LlmConfig::default();
        let result = LlmExtractor::new(&config, &DomainKnowledgeBase::gaming());
        assert!(matches!(result, Err(NlqError::Validation(_))));
    }
}
