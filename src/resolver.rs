//! Entity Resolution
//!
//! Maps a candidate entity set onto the knowledge base, fills in implied
//! pieces, and attaches conflicts and an overall confidence. The pipeline is a
//! total function and idempotent: resolving an already-resolved set yields the
//! same fields and scores.

use crate::conflict::ConflictDetector;
use crate::knowledge::DomainKnowledgeBase;
use crate::model::{Dimension, Filter, Metric, QueryEntities, SortOption};
use std::sync::Arc;
use tracing::{debug, info};

pub struct EntityResolver {
    kb: Arc<DomainKnowledgeBase>,
    detector: ConflictDetector,
}

impl EntityResolver {
    pub fn new(kb: Arc<DomainKnowledgeBase>) -> Self {
        Self {
            detector: ConflictDetector::new(kb.clone()),
            kb,
        }
    }

    pub fn knowledge_base(&self) -> &Arc<DomainKnowledgeBase> {
        &self.kb
    }

    pub fn resolve(&self, candidate: &QueryEntities, original_text: &str) -> QueryEntities {
        debug!("Resolving entities for: {}", original_text);
        let mut entities = candidate.clone();

        // 1. time
        entities.time_range = Some(self.kb.resolve_time_range(candidate.time_range.as_ref()));

        // 2. metrics and dimensions
        for metric in &mut entities.metrics {
            self.map_metric(metric);
        }
        for dimension in &mut entities.dimensions {
            self.map_dimension(dimension);
        }

        // 3. filters
        for filter in &mut entities.filters {
            self.map_filter(filter);
        }

        // 4. implied pieces
        self.infer_missing(&mut entities);

        // 5-6. conflicts and confidence
        entities.conflicts = self.detector.detect(&entities);
        entities.overall_confidence = overall_confidence(&entities);

        info!(
            "Resolved {} metrics, {} dimensions, {} filters ({} conflicts, confidence {:.2})",
            entities.metrics.len(),
            entities.dimensions.len(),
            entities.filters.len(),
            entities.conflicts.len(),
            entities.overall_confidence
        );
        entities
    }

    /// Re-run conflict detection and confidence on an already mapped set.
    pub fn recheck(&self, entities: &mut QueryEntities) {
        entities.conflicts = self.detector.detect(entities);
        entities.overall_confidence = overall_confidence(entities);
    }

    /// Map by name. A user-supplied aggregation is kept.
    pub fn map_metric(&self, metric: &mut Metric) {
        match self.kb.map_metric(&metric.name) {
            Some(found) => {
                metric.database_field = Some(found.entry.database_field.clone());
                metric.aggregation = metric.aggregation.or(Some(found.entry.default_aggregation));
                metric.match_confidence = found.score;
                metric.is_unresolved = false;
            }
            None => {
                metric.database_field = None;
                metric.match_confidence = 0.0;
                metric.is_unresolved = true;
            }
        }
    }

    pub fn map_dimension(&self, dimension: &mut Dimension) {
        match self.kb.map_dimension(&dimension.name) {
            Some(found) => {
                dimension.database_field = Some(found.entry.database_field.clone());
                dimension.match_confidence = found.score;
                dimension.is_unresolved = false;
            }
            None => {
                dimension.database_field = None;
                dimension.match_confidence = 0.0;
                dimension.is_unresolved = true;
            }
        }
    }

    /// Attach the dimension's field and canonicalize the value when the
    /// dimension has a closed value set. Unmatched values are left as typed.
    pub fn map_filter(&self, filter: &mut Filter) {
        let Some(found) = self.kb.map_dimension(&filter.dimension) else {
            filter.database_field = None;
            return;
        };
        let dimension = found.entry;
        filter.database_field = Some(dimension.database_field.clone());
        if dimension.allowed_values.is_empty() {
            return;
        }

        let canonical: Option<Vec<String>> = filter
            .values()
            .iter()
            .map(|value| self.kb.normalize_value(dimension, value))
            .collect();
        if let Some(values) = canonical {
            if !values.is_empty() {
                filter.value = values.join(",");
            }
        }
    }

    fn infer_missing(&self, entities: &mut QueryEntities) {
        if entities.metrics.is_empty() {
            let mut metric = Metric::candidate(self.kb.default_metric());
            self.map_metric(&mut metric);
            info!("No metric given, defaulting to '{}'", metric.name);
            entities.metrics.push(metric);
        }

        if entities.sort_by.is_none() && entities.limit.map_or(false, |limit| limit > 0) {
            if let Some(first) = entities.metrics.first() {
                entities.sort_by = Some(SortOption::descending(first.name.clone()));
            }
        }

        let mut implied = Vec::new();
        for filter in &entities.filters {
            let known = entities
                .dimensions
                .iter()
                .chain(implied.iter())
                .any(|d: &Dimension| d.name.eq_ignore_ascii_case(&filter.dimension));
            if !known {
                let mut dimension = Dimension::candidate(filter.dimension.clone());
                self.map_dimension(&mut dimension);
                implied.push(dimension);
            }
        }
        if !implied.is_empty() {
            debug!("Added {} dimensions implied by filters", implied.len());
            entities.dimensions.extend(implied);
        }
    }
}

/// Mean metric confidence averaged with mean dimension confidence; an empty
/// list counts as 1.0.
pub fn overall_confidence(entities: &QueryEntities) -> f64 {
    fn mean(values: impl Iterator<Item = f64>) -> f64 {
        let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        if count == 0 {
            1.0
        } else {
            sum / count as f64
        }
    }
    let metrics = mean(entities.metrics.iter().map(|m| m.match_confidence));
    let dimensions = mean(entities.dimensions.iter().map(|d| d.match_confidence));
    (metrics + dimensions) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingConfig;
    use crate::knowledge::Clock;
    use crate::model::{Aggregation, ConflictType, EntityType, SortDirection, TimeRange};
    use chrono::{TimeZone, Utc};

    fn resolver() -> EntityResolver {
        let clock = Clock::Fixed(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap());
        EntityResolver::new(Arc::new(DomainKnowledgeBase::gaming().with_clock(clock)))
    }

    fn candidate(metrics: &[&str], dimensions: &[&str]) -> QueryEntities {
        let mut entities = QueryEntities::new();
        entities.metrics = metrics.iter().map(|m| Metric::candidate(*m)).collect();
        entities.dimensions = dimensions.iter().map(|d| Dimension::candidate(*d)).collect();
        entities
    }

    #[test]
    fn test_unknown_metric_is_unresolved_with_five_suggestions() {
        let resolved = resolver().resolve(&candidate(&["xyzzy123"], &[]), "xyzzy123");
        let metric = &resolved.metrics[0];
        assert!(metric.is_unresolved);
        assert_eq!(metric.match_confidence, 0.0);
        assert!(metric.database_field.is_none());
        assert_eq!(resolved.conflicts.len(), 1);
        assert_eq!(resolved.conflicts[0].conflict_type, ConflictType::Unknown);
        assert_eq!(resolved.conflicts[0].entity_type, EntityType::Metric);
        assert_eq!(resolved.conflicts[0].suggestions.len(), 5);
    }

    #[test]
    fn test_synonym_resolves_without_conflict() {
        let resolved = resolver().resolve(&candidate(&["avg bet"], &[]), "avg bet");
        let metric = &resolved.metrics[0];
        assert_eq!(metric.match_confidence, 1.0);
        assert_eq!(metric.database_field.as_deref(), Some("GameActivity.BetAmount"));
        assert_eq!(metric.aggregation, Some(Aggregation::Avg));
        assert!(resolved.conflicts.is_empty());
        assert_eq!(resolved.overall_confidence, 1.0);
    }

    #[test]
    fn test_user_aggregation_is_kept() {
        let mut entities = candidate(&["deposits"], &[]);
        entities.metrics[0].aggregation = Some(Aggregation::Max);
        let resolved = resolver().resolve(&entities, "max deposits");
        assert_eq!(resolved.metrics[0].aggregation, Some(Aggregation::Max));
    }

    #[test]
    fn test_fuzzy_score_flags_ambiguity_under_stricter_threshold() {
        let clock = Clock::Fixed(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap());
        let kb = DomainKnowledgeBase::gaming()
            .with_clock(clock)
            .with_matching(MatchingConfig {
                ambiguity_threshold: 0.85,
                ..MatchingConfig::default()
            });
        let resolved = EntityResolver::new(Arc::new(kb)).resolve(&candidate(&["deposit"], &[]), "");
        assert_eq!(resolved.metrics[0].match_confidence, 0.8);
        assert_eq!(resolved.conflicts.len(), 1);
        assert_eq!(resolved.conflicts[0].conflict_type, ConflictType::Ambiguous);
        assert_eq!(resolved.conflicts[0].suggestions[0], "Deposits");
    }

    #[test]
    fn test_defaults_metric_and_sort() {
        let mut entities = QueryEntities::new();
        entities.limit = Some(5);
        let resolved = resolver().resolve(&entities, "top 5");
        assert_eq!(resolved.metrics[0].name, "revenue");
        assert_eq!(resolved.metrics[0].database_field.as_deref(), Some("Transactions.Amount"));
        let sort = resolved.sort_by.unwrap();
        assert_eq!(sort.field, "revenue");
        assert_eq!(sort.direction, SortDirection::Desc);
        assert!(resolved.conflicts.is_empty());
    }

    #[test]
    fn test_filter_value_normalized_and_dimension_synthesized() {
        let mut entities = candidate(&["wagering"], &[]);
        entities.filters = vec![Filter::equals("Game Type", "table games")];
        let resolved = resolver().resolve(&entities, "");
        assert_eq!(resolved.filters[0].value, "Table Games");
        assert_eq!(resolved.filters[0].database_field.as_deref(), Some("Games.GameType"));
        assert_eq!(resolved.dimensions.len(), 1);
        assert_eq!(resolved.dimensions[0].database_field.as_deref(), Some("Games.GameType"));
    }

    #[test]
    fn test_time_range_defaults_when_absent() {
        let resolved = resolver().resolve(&candidate(&["revenue"], &[]), "");
        let range = resolved.time_range.unwrap();
        assert_eq!(range.start.as_deref(), Some("2026-09-16"));
        assert_eq!(range.end.as_deref(), Some("2026-10-16"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut entities = candidate(&["deposit", "players"], &["brand", "mystery"]);
        entities.filters = vec![Filter::equals("device", "MOBILE")];
        entities.time_range = Some(TimeRange::relative("last_week"));
        entities.limit = Some(3);

        let resolver = resolver();
        let once = resolver.resolve(&entities, "");
        let twice = resolver.resolve(&once, "");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_overall_confidence_averages_lists() {
        let mut entities = candidate(&["deposit"], &["xyzzy"]);
        entities.metrics[0].match_confidence = 0.8;
        assert!((overall_confidence(&entities) - 0.4).abs() < 1e-9);
    }
}
