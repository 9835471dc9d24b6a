//! Conflict Detection
//!
//! Flags the parts of a resolved entity set that need user input before SQL
//! can be produced. Every rule runs; conflicts accumulate in rule order
//! (missing metrics, metrics, dimensions, filters) and in list order within a
//! rule.

use crate::knowledge::DomainKnowledgeBase;
use crate::model::{ConflictType, EntityConflict, EntityType, Filter, QueryEntities};
use std::sync::Arc;
use tracing::debug;

const AMBIGUOUS_SUGGESTIONS: usize = 3;
const UNKNOWN_SUGGESTIONS: usize = 5;

pub struct ConflictDetector {
    kb: Arc<DomainKnowledgeBase>,
}

impl ConflictDetector {
    pub fn new(kb: Arc<DomainKnowledgeBase>) -> Self {
        Self { kb }
    }

    pub fn detect(&self, entities: &QueryEntities) -> Vec<EntityConflict> {
        let mut conflicts = Vec::new();
        let threshold = self.kb.matching().ambiguity_threshold;

        if entities.metrics.is_empty() {
            conflicts.push(EntityConflict {
                conflict_type: ConflictType::MissingRequired,
                entity_type: EntityType::Metrics,
                original_term: None,
                suggestions: self.kb.starter_metrics().to_vec(),
                message: "At least one metric is required".to_string(),
            });
        }

        for metric in &entities.metrics {
            if metric.is_unresolved {
                conflicts.push(EntityConflict {
                    conflict_type: ConflictType::Unknown,
                    entity_type: EntityType::Metric,
                    original_term: Some(metric.name.clone()),
                    suggestions: self.kb.stable_metric_names(UNKNOWN_SUGGESTIONS),
                    message: format!("The metric '{}' is not recognized", metric.name),
                });
            } else if is_ambiguous(metric.match_confidence, threshold) {
                conflicts.push(EntityConflict {
                    conflict_type: ConflictType::Ambiguous,
                    entity_type: EntityType::Metric,
                    original_term: Some(metric.name.clone()),
                    suggestions: self.kb.metric_suggestions(&metric.name, AMBIGUOUS_SUGGESTIONS),
                    message: format!("The metric '{}' is ambiguous", metric.name),
                });
            }
        }

        for dimension in &entities.dimensions {
            if dimension.is_unresolved {
                conflicts.push(EntityConflict {
                    conflict_type: ConflictType::Unknown,
                    entity_type: EntityType::Dimension,
                    original_term: Some(dimension.name.clone()),
                    suggestions: self.kb.stable_dimension_names(UNKNOWN_SUGGESTIONS),
                    message: format!("The dimension '{}' is not recognized", dimension.name),
                });
            } else if is_ambiguous(dimension.match_confidence, threshold) {
                conflicts.push(EntityConflict {
                    conflict_type: ConflictType::Ambiguous,
                    entity_type: EntityType::Dimension,
                    original_term: Some(dimension.name.clone()),
                    suggestions: self
                        .kb
                        .dimension_suggestions(&dimension.name, AMBIGUOUS_SUGGESTIONS),
                    message: format!("The dimension '{}' is ambiguous", dimension.name),
                });
            }
        }

        for filter in &entities.filters {
            if let Some(conflict) = self.invalid_value(filter) {
                conflicts.push(conflict);
            }
        }

        if !conflicts.is_empty() {
            debug!("Detected {} conflicts", conflicts.len());
        }
        conflicts
    }

    fn invalid_value(&self, filter: &Filter) -> Option<EntityConflict> {
        if !is_invalid_value(&self.kb, filter) {
            return None;
        }
        let dimension = self.kb.map_dimension(&filter.dimension)?.entry;
        Some(EntityConflict {
            conflict_type: ConflictType::InvalidValue,
            entity_type: EntityType::Filter,
            original_term: Some(filter.value.clone()),
            suggestions: dimension
                .allowed_values
                .iter()
                .map(|v| v.value.clone())
                .collect(),
            message: format!(
                "The value '{}' is not valid for {}",
                filter.value, dimension.name
            ),
        })
    }
}

/// The filter's dimension has a closed value set and the value (or, for
/// `in`, any listed value) matches none of it
pub fn is_invalid_value(kb: &DomainKnowledgeBase, filter: &Filter) -> bool {
    let Some(found) = kb.map_dimension(&filter.dimension) else {
        return false;
    };
    let dimension = found.entry;
    if dimension.allowed_values.is_empty() {
        return false;
    }
    let values = filter.values();
    values.is_empty()
        || values
            .iter()
            .any(|value| kb.normalize_value(dimension, value).is_none())
}

/// Mapped, but with a score under the ambiguity threshold
pub fn is_ambiguous(confidence: f64, threshold: f64) -> bool {
    confidence > 0.0 && confidence < threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dimension, Metric};

    fn detector() -> ConflictDetector {
        ConflictDetector::new(Arc::new(DomainKnowledgeBase::gaming()))
    }

    fn resolved_metric(name: &str, confidence: f64) -> Metric {
        let mut metric = Metric::candidate(name);
        metric.database_field = Some("Transactions.Amount".to_string());
        metric.match_confidence = confidence;
        metric
    }

    #[test]
    fn test_missing_metrics_uses_starter_suggestions() {
        let conflicts = detector().detect(&QueryEntities::new());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::MissingRequired);
        assert_eq!(
            conflicts[0].suggestions,
            vec!["revenue", "deposits", "active players"]
        );
    }

    #[test]
    fn test_rules_accumulate_in_order() {
        let mut entities = QueryEntities::new();
        let mut unknown = Metric::candidate("xyzzy123");
        unknown.is_unresolved = true;
        entities.metrics = vec![resolved_metric("deposit", 0.5), unknown];
        let mut dimension = Dimension::candidate("colour");
        dimension.is_unresolved = true;
        entities.dimensions = vec![dimension];
        entities.filters = vec![Filter::equals("game type", "arcade")];

        let kinds: Vec<_> = detector()
            .detect(&entities)
            .iter()
            .map(|c| (c.conflict_type, c.entity_type))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ConflictType::Ambiguous, EntityType::Metric),
                (ConflictType::Unknown, EntityType::Metric),
                (ConflictType::Unknown, EntityType::Dimension),
                (ConflictType::InvalidValue, EntityType::Filter),
            ]
        );
    }

    #[test]
    fn test_exact_and_zero_confidence_are_not_ambiguous() {
        assert!(!is_ambiguous(1.0, 0.7));
        assert!(!is_ambiguous(0.0, 0.7));
        assert!(is_ambiguous(0.69, 0.7));
    }

    #[test]
    fn test_invalid_value_lists_all_canonical_values() {
        let mut entities = QueryEntities::new();
        entities.metrics = vec![resolved_metric("revenue", 1.0)];
        entities.filters = vec![Filter::equals("game type", "arcade")];

        let conflicts = detector().detect(&entities);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].original_term.as_deref(), Some("arcade"));
        assert_eq!(
            conflicts[0].suggestions,
            vec!["Slots", "Table Games", "Live Dealer", "Poker", "Bingo", "Scratch Cards"]
        );
    }

    #[test]
    fn test_open_value_dimensions_accept_anything() {
        let mut entities = QueryEntities::new();
        entities.metrics = vec![resolved_metric("revenue", 1.0)];
        entities.filters = vec![
            Filter::equals("country", "Narnia"),
            Filter::equals("colour", "red"),
        ];
        assert!(detector().detect(&entities).is_empty());
    }
}
