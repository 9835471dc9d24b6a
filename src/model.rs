//! Query Entity Model
//!
//! Request-scoped value types that flow through extraction, resolution,
//! clarification and compilation. A `QueryEntities` is created fresh per
//! extraction and every round produces a new version of it; nothing here is
//! shared across requests.

use crate::error::NlqError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Aggregation function applied to a metric's database field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    #[serde(alias = "count_distinct")]
    DistinctCount,
    Min,
    Max,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Count => "count",
            Aggregation::DistinctCount => "distinct_count",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }

    /// Wrap a field in this aggregation, e.g. `SUM(Payments.DepositAmount)`
    pub fn apply(&self, field: &str) -> String {
        match self {
            Aggregation::DistinctCount => format!("COUNT(DISTINCT {})", field),
            other => format!("{}({})", other.as_str().to_uppercase(), field),
        }
    }
}

impl FromStr for Aggregation {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(' ', "_").as_str() {
            "sum" | "total" => Ok(Aggregation::Sum),
            "avg" | "average" | "mean" => Ok(Aggregation::Avg),
            "count" => Ok(Aggregation::Count),
            "distinct_count" | "count_distinct" => Ok(Aggregation::DistinctCount),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            other => Err(NlqError::Validation(format!("Unknown aggregation: {}", other))),
        }
    }
}

/// Reporting granularity attached to a resolved time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start date (`YYYY-MM-DD` once resolved)
    #[serde(default)]
    pub start: Option<String>,
    /// Inclusive end date
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub granularity: Option<Granularity>,
    /// Relative token such as `last_week`
    #[serde(default)]
    pub relative_period: Option<String>,
}

impl TimeRange {
    pub fn relative(period: impl Into<String>) -> Self {
        Self {
            relative_period: Some(period.into()),
            ..Self::default()
        }
    }

    pub fn explicit(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// The user's term
    pub name: String,
    #[serde(default)]
    pub database_field: Option<String>,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    #[serde(default)]
    pub match_confidence: f64,
    #[serde(default)]
    pub is_unresolved: bool,
}

impl Metric {
    pub fn candidate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database_field: None,
            aggregation: None,
            match_confidence: 0.0,
            is_unresolved: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(default)]
    pub database_field: Option<String>,
    #[serde(default)]
    pub match_confidence: f64,
    #[serde(default)]
    pub is_unresolved: bool,
}

impl Dimension {
    pub fn candidate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database_field: None,
            match_confidence: 0.0,
            is_unresolved: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    GreaterThan,
    LessThan,
    Contains,
    In,
}

impl Default for FilterOperator {
    fn default() -> Self {
        FilterOperator::Equals
    }
}

impl FromStr for FilterOperator {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "equals" | "eq" | "=" | "==" => Ok(FilterOperator::Equals),
            "greater_than" | "gt" | ">" => Ok(FilterOperator::GreaterThan),
            "less_than" | "lt" | "<" => Ok(FilterOperator::LessThan),
            "contains" | "like" => Ok(FilterOperator::Contains),
            "in" => Ok(FilterOperator::In),
            other => Err(NlqError::Validation(format!("Unknown filter operator: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Dimension name as the user phrased it
    pub dimension: String,
    #[serde(default)]
    pub operator: FilterOperator,
    pub value: String,
    #[serde(default)]
    pub is_negated: bool,
    #[serde(default)]
    pub database_field: Option<String>,
}

impl Filter {
    pub fn equals(dimension: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            operator: FilterOperator::Equals,
            value: value.into(),
            is_negated: false,
            database_field: None,
        }
    }

    pub fn negated(mut self) -> Self {
        self.is_negated = true;
        self
    }

    /// Individual values: comma-separated for `in`, the whole value otherwise
    pub fn values(&self) -> Vec<&str> {
        match self.operator {
            FilterOperator::In => self
                .value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .collect(),
            _ => vec![self.value.as_str()],
        }
    }
}

/// A request to compare the main range against another period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Relative period token of the baseline, e.g. `last_year`
    pub baseline: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    /// Only the literal `asc` sorts ascending; anything else is descending.
    pub fn parse_lenient(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("asc") {
            SortDirection::Asc
        } else {
            SortDirection::Desc
        }
    }
}

impl Serialize for SortDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        })
    }
}

impl<'de> Deserialize<'de> for SortDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SortDirection::parse_lenient(&raw))
    }
}

impl Default for SortDirection {
    fn default() -> Self {
        SortDirection::Desc
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortOption {
    /// Metric or dimension name, or a raw field
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub database_field: Option<String>,
}

impl SortOption {
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
            database_field: None,
        }
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
            database_field: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    MissingRequired,
    Ambiguous,
    Unknown,
    InvalidValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    /// The metric list as a whole
    Metrics,
    Metric,
    Dimension,
    Filter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConflict {
    pub conflict_type: ConflictType,
    pub entity_type: EntityType,
    #[serde(default)]
    pub original_term: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub message: String,
}

impl EntityConflict {
    /// Wire identifier for this conflict, `None` for type pairs no prompt exists for
    pub fn conflict_id(&self) -> Option<ConflictId> {
        let term = self.original_term.clone().unwrap_or_default();
        let kind = match (self.conflict_type, self.entity_type) {
            (ConflictType::MissingRequired, EntityType::Metrics) => {
                return Some(ConflictId::new(ConflictKind::MissingMetric, MISSING_METRIC_LITERAL));
            }
            (ConflictType::Ambiguous, EntityType::Metric) => ConflictKind::AmbiguousMetric,
            (ConflictType::Unknown, EntityType::Metric) => ConflictKind::UnknownMetric,
            (ConflictType::Ambiguous, EntityType::Dimension) => ConflictKind::AmbiguousDimension,
            (ConflictType::Unknown, EntityType::Dimension) => ConflictKind::UnknownDimension,
            (ConflictType::InvalidValue, EntityType::Filter) => ConflictKind::InvalidFilterValue,
            _ => return None,
        };
        Some(ConflictId::new(kind, term))
    }
}

/// Literal carried by `MissingMetric` conflict ids in place of a term
pub const MISSING_METRIC_LITERAL: &str = "required";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    MissingMetric,
    AmbiguousMetric,
    UnknownMetric,
    AmbiguousDimension,
    UnknownDimension,
    InvalidFilterValue,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::MissingMetric => "MissingMetric",
            ConflictKind::AmbiguousMetric => "AmbiguousMetric",
            ConflictKind::UnknownMetric => "UnknownMetric",
            ConflictKind::AmbiguousDimension => "AmbiguousDimension",
            ConflictKind::UnknownDimension => "UnknownDimension",
            ConflictKind::InvalidFilterValue => "InvalidFilterValue",
        }
    }
}

impl FromStr for ConflictKind {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MissingMetric" => Ok(ConflictKind::MissingMetric),
            "AmbiguousMetric" => Ok(ConflictKind::AmbiguousMetric),
            "UnknownMetric" => Ok(ConflictKind::UnknownMetric),
            "AmbiguousDimension" => Ok(ConflictKind::AmbiguousDimension),
            "UnknownDimension" => Ok(ConflictKind::UnknownDimension),
            "InvalidFilterValue" => Ok(ConflictKind::InvalidFilterValue),
            other => Err(NlqError::Validation(format!("Unknown conflict type: {}", other))),
        }
    }
}

/// `"{ConflictType}|{OriginalTermOrLiteral}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConflictId {
    pub kind: ConflictKind,
    pub term: String,
}

impl ConflictId {
    pub fn new(kind: ConflictKind, term: impl Into<String>) -> Self {
        Self {
            kind,
            term: term.into(),
        }
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.kind.as_str(), self.term)
    }
}

impl FromStr for ConflictId {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split once: the term itself may contain '|'
        let (kind, term) = s
            .split_once('|')
            .ok_or_else(|| NlqError::Validation(format!("Malformed conflict id: {}", s)))?;
        Ok(ConflictId::new(kind.parse()?, term))
    }
}

impl Serialize for ConflictId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConflictId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    Selection,
    Text,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationPrompt {
    pub prompt_type: PromptType,
    pub question: String,
    pub options: Vec<String>,
    pub conflict_id: ConflictId,
}

/// The entity set for one question
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryEntities {
    pub time_range: Option<TimeRange>,
    pub metrics: Vec<Metric>,
    pub dimensions: Vec<Dimension>,
    pub filters: Vec<Filter>,
    pub comparisons: Vec<Comparison>,
    pub sort_by: Option<SortOption>,
    pub limit: Option<i64>,
    pub overall_confidence: f64,
    pub conflicts: Vec<EntityConflict>,
    /// Clarification rounds already applied to this entity set
    pub clarification_round: u32,
}

impl QueryEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// No conflicts and every metric/dimension carries a database field
    pub fn is_compile_eligible(&self) -> bool {
        self.conflicts.is_empty()
            && self.metrics.iter().all(|m| m.database_field.is_some())
            && self.dimensions.iter().all(|d| d.database_field.is_some())
    }

    pub fn find_dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Strip everything resolution derives, leaving only the raw candidate.
    pub fn into_candidate(mut self) -> Self {
        for metric in &mut self.metrics {
            metric.database_field = None;
            metric.match_confidence = 0.0;
            metric.is_unresolved = false;
        }
        for dimension in &mut self.dimensions {
            dimension.database_field = None;
            dimension.match_confidence = 0.0;
            dimension.is_unresolved = false;
        }
        for filter in &mut self.filters {
            filter.database_field = None;
        }
        if let Some(sort) = self.sort_by.as_mut() {
            sort.database_field = None;
        }
        self.overall_confidence = 0.0;
        self.conflicts.clear();
        self.clarification_round = 0;
        self
    }
}
