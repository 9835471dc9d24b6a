//! Knowledge Base Definition
//!
//! The declarative dictionary a `DomainKnowledgeBase` is built from: metric
//! and dimension entries plus the physical schema (base table, date column and
//! join rules). Definitions can be loaded from JSON and are validated before
//! use.

use crate::error::{NlqError, Result};
use crate::model::Aggregation;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Lower-case lookup key, e.g. `active players`
    pub key: String,
    /// Display name, e.g. `Active Players`
    pub name: String,
    /// `Table.Column`
    pub database_field: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    pub default_aggregation: Aggregation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowedValue {
    /// What users type, e.g. `table games`
    pub key: String,
    /// Value stored in the column, e.g. `Table Games`
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDefinition {
    pub key: String,
    pub name: String,
    pub database_field: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Closed value set; empty means any value is accepted
    #[serde(default)]
    pub allowed_values: Vec<AllowedValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
}

impl Default for JoinType {
    fn default() -> Self {
        JoinType::Inner
    }
}

impl JoinType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// How a table hangs off the base table or another joined table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRule {
    pub table: String,
    /// Table that must already be joined (or be the base table)
    pub from_table: String,
    /// Join condition, e.g. `Transactions.PlayerId = Players.PlayerId`
    pub on: String,
    #[serde(default)]
    pub join_type: JoinType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub base_table: String,
    /// Column the time range filters on
    pub date_column: String,
    #[serde(default)]
    pub joins: Vec<JoinRule>,
}

impl SchemaDefinition {
    pub fn join_for(&self, table: &str) -> Option<&JoinRule> {
        self.joins.iter().find(|j| j.table.eq_ignore_ascii_case(table))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDefinition {
    pub metrics: Vec<MetricDefinition>,
    pub dimensions: Vec<DimensionDefinition>,
    pub schema: SchemaDefinition,
    /// Metric key inferred when a question names none
    pub default_metric: String,
    /// Suggestions offered when no metric was given
    #[serde(default)]
    pub starter_metrics: Vec<String>,
}

/// Table prefix of a `Table.Column` field
pub fn table_of(field: &str) -> Option<&str> {
    field
        .split_once('.')
        .map(|(table, _)| table.trim())
        .filter(|table| !table.is_empty())
}

fn is_qualified_field(field: &str) -> bool {
    match field.split_once('.') {
        Some((table, column)) => !table.trim().is_empty() && !column.trim().is_empty(),
        None => false,
    }
}

impl KnowledgeDefinition {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let definition: KnowledgeDefinition = serde_json::from_str(raw)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(|e| {
            NlqError::KnowledgeBase(format!("Failed to load {}: {}", path.display(), e))
        })
    }

    /// Check structural rules. Synonym collisions only warn: the first entry wins.
    pub fn validate(&self) -> Result<()> {
        if self.metrics.is_empty() {
            return Err(NlqError::KnowledgeBase("At least one metric is required".to_string()));
        }

        let mut metric_keys = HashSet::new();
        for metric in &self.metrics {
            check_entry("metric", &metric.key, &metric.name, &metric.database_field)?;
            if !metric_keys.insert(metric.key.to_lowercase()) {
                return Err(NlqError::KnowledgeBase(format!("Duplicate metric key '{}'", metric.key)));
            }
        }

        let mut dimension_keys = HashSet::new();
        for dimension in &self.dimensions {
            check_entry("dimension", &dimension.key, &dimension.name, &dimension.database_field)?;
            if !dimension_keys.insert(dimension.key.to_lowercase()) {
                return Err(NlqError::KnowledgeBase(format!(
                    "Duplicate dimension key '{}'",
                    dimension.key
                )));
            }
        }

        if !metric_keys.contains(&self.default_metric.to_lowercase()) {
            return Err(NlqError::KnowledgeBase(format!(
                "Default metric '{}' is not a known metric",
                self.default_metric
            )));
        }

        self.validate_schema()?;
        self.warn_synonym_collisions();
        Ok(())
    }

    fn validate_schema(&self) -> Result<()> {
        let schema = &self.schema;
        if schema.base_table.trim().is_empty() {
            return Err(NlqError::KnowledgeBase("Base table must not be empty".to_string()));
        }
        if !is_qualified_field(&schema.date_column) {
            return Err(NlqError::KnowledgeBase(format!(
                "Date column '{}' must be Table.Column",
                schema.date_column
            )));
        }

        let mut joined: HashSet<String> = HashSet::new();
        for join in &schema.joins {
            let table = join.table.to_lowercase();
            if table == schema.base_table.to_lowercase() || !joined.insert(table) {
                return Err(NlqError::KnowledgeBase(format!(
                    "Table '{}' has more than one join rule",
                    join.table
                )));
            }
        }

        for join in &schema.joins {
            let from = join.from_table.to_lowercase();
            if from != schema.base_table.to_lowercase() && !joined.contains(&from) {
                return Err(NlqError::KnowledgeBase(format!(
                    "Join for '{}' hangs off unknown table '{}'",
                    join.table, join.from_table
                )));
            }
        }
        Ok(())
    }

    fn warn_synonym_collisions(&self) {
        let mut seen: HashMap<String, String> = HashMap::new();
        let metric_terms = self
            .metrics
            .iter()
            .flat_map(|m| m.synonyms.iter().map(move |s| (s, &m.key)));
        for (synonym, key) in metric_terms {
            if let Some(previous) = seen.insert(synonym.to_lowercase(), key.clone()) {
                if &previous != key {
                    warn!("Metric synonym '{}' used by both '{}' and '{}'", synonym, previous, key);
                }
            }
        }

        seen.clear();
        let dimension_terms = self
            .dimensions
            .iter()
            .flat_map(|d| d.synonyms.iter().map(move |s| (s, &d.key)));
        for (synonym, key) in dimension_terms {
            if let Some(previous) = seen.insert(synonym.to_lowercase(), key.clone()) {
                if &previous != key {
                    warn!("Dimension synonym '{}' used by both '{}' and '{}'", synonym, previous, key);
                }
            }
        }
    }
}

fn check_entry(kind: &str, key: &str, name: &str, field: &str) -> Result<()> {
    if key.trim().is_empty() || name.trim().is_empty() {
        return Err(NlqError::KnowledgeBase(format!("A {} has an empty key or name", kind)));
    }
    if !is_qualified_field(field) {
        return Err(NlqError::KnowledgeBase(format!(
            "{} '{}' field '{}' must be Table.Column",
            kind, key, field
        )));
    }
    Ok(())
}
