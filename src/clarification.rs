//! Clarification Engine
//!
//! Turns conflicts into prompts and folds user answers back into the entity
//! set. The engine keeps no state between rounds: the caller holds the
//! in-flight `QueryEntities` (which carries its round counter) and replays it
//! together with the answers.
//!
//! ```text
//! Resolved <--- detect() == [] --- AwaitingClarification
//!                                     |          ^
//!                            answers  v          | conflicts remain
//!                                  apply_responses + detect
//! ```

use crate::conflict::{is_ambiguous, is_invalid_value};
use crate::knowledge::DomainKnowledgeBase;
use crate::model::{
    ClarificationPrompt, ConflictId, ConflictKind, EntityConflict, Metric, PromptType,
    QueryEntities,
};
use crate::resolver::EntityResolver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClarificationState {
    Resolved,
    AwaitingClarification {
        conflicts: Vec<EntityConflict>,
        prompts: Vec<ClarificationPrompt>,
        /// Rounds already applied
        round: u32,
    },
}

impl ClarificationState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ClarificationState::Resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationResponse {
    pub needs_clarification: bool,
    pub conflicts: Vec<EntityConflict>,
    pub prompts: Vec<ClarificationPrompt>,
}

pub struct ClarificationEngine {
    kb: Arc<DomainKnowledgeBase>,
    resolver: EntityResolver,
}

impl ClarificationEngine {
    pub fn new(kb: Arc<DomainKnowledgeBase>) -> Self {
        Self {
            resolver: EntityResolver::new(kb.clone()),
            kb,
        }
    }

    pub fn evaluate(&self, entities: &QueryEntities) -> ClarificationState {
        if entities.conflicts.is_empty() {
            ClarificationState::Resolved
        } else {
            ClarificationState::AwaitingClarification {
                conflicts: entities.conflicts.clone(),
                prompts: self.build_prompts(&entities.conflicts),
                round: entities.clarification_round,
            }
        }
    }

    pub fn request_clarification(&self, entities: &QueryEntities) -> ClarificationResponse {
        ClarificationResponse {
            needs_clarification: !entities.conflicts.is_empty(),
            conflicts: entities.conflicts.clone(),
            prompts: self.build_prompts(&entities.conflicts),
        }
    }

    /// One selection prompt per conflict
    pub fn build_prompts(&self, conflicts: &[EntityConflict]) -> Vec<ClarificationPrompt> {
        conflicts
            .iter()
            .filter_map(|conflict| {
                let conflict_id = conflict.conflict_id()?;
                Some(ClarificationPrompt {
                    prompt_type: PromptType::Selection,
                    question: question_for(&conflict_id),
                    options: conflict.suggestions.clone(),
                    conflict_id,
                })
            })
            .collect()
    }

    /// Apply answers keyed by wire conflict id. Conflicts are cleared on the
    /// result; callers must re-run detection before treating it as final.
    pub fn apply_responses(
        &self,
        entities: &QueryEntities,
        responses: &HashMap<String, String>,
    ) -> QueryEntities {
        let mut updated = entities.clone();

        let mut ordered: Vec<(&String, &String)> = responses.iter().collect();
        ordered.sort();

        for (raw_id, answer) in ordered {
            let answer = answer.trim();
            if answer.is_empty() {
                warn!("Empty answer for '{}' ignored", raw_id);
                continue;
            }
            let id: ConflictId = match raw_id.parse() {
                Ok(id) => id,
                Err(e) => {
                    warn!("Ignoring response: {}", e);
                    continue;
                }
            };

            let applied = match id.kind {
                ConflictKind::MissingMetric => self.add_metric(&mut updated, answer),
                ConflictKind::AmbiguousMetric | ConflictKind::UnknownMetric => {
                    self.replace_metric(&mut updated, &id, answer)
                }
                ConflictKind::AmbiguousDimension | ConflictKind::UnknownDimension => {
                    self.replace_dimension(&mut updated, &id, answer)
                }
                ConflictKind::InvalidFilterValue => {
                    self.replace_filter_value(&mut updated, &id.term, answer)
                }
            };

            if applied {
                info!("Clarified '{}' as '{}'", id, answer);
                // a missing metric has no user term to learn from
                if id.kind != ConflictKind::MissingMetric {
                    self.kb.record_feedback(&id.term, answer, true, None);
                }
            } else {
                warn!("No entity matched clarification '{}'", id);
            }
        }

        updated.conflicts.clear();
        updated.clarification_round = updated.clarification_round.saturating_add(1);
        updated
    }

    fn add_metric(&self, entities: &mut QueryEntities, answer: &str) -> bool {
        if entities
            .metrics
            .iter()
            .any(|m| m.name.eq_ignore_ascii_case(answer))
        {
            return true;
        }
        let mut metric = Metric::candidate(answer);
        self.resolver.map_metric(&mut metric);
        entities.metrics.push(metric);
        true
    }

    fn replace_metric(&self, entities: &mut QueryEntities, id: &ConflictId, answer: &str) -> bool {
        let threshold = self.kb.matching().ambiguity_threshold;
        let unknown = id.kind == ConflictKind::UnknownMetric;
        let Some(metric) = entities.metrics.iter_mut().find(|m| {
            m.name == id.term
                && if unknown {
                    m.is_unresolved
                } else {
                    !m.is_unresolved && is_ambiguous(m.match_confidence, threshold)
                }
        }) else {
            return false;
        };

        let old_name = std::mem::replace(&mut metric.name, answer.to_string());
        // the previous entry's default no longer applies
        metric.aggregation = None;
        self.resolver.map_metric(metric);

        if let Some(sort) = entities.sort_by.as_mut() {
            if sort.field == old_name {
                sort.field = answer.to_string();
                sort.database_field = None;
            }
        }
        true
    }

    fn replace_dimension(
        &self,
        entities: &mut QueryEntities,
        id: &ConflictId,
        answer: &str,
    ) -> bool {
        let threshold = self.kb.matching().ambiguity_threshold;
        let unknown = id.kind == ConflictKind::UnknownDimension;
        let Some(dimension) = entities.dimensions.iter_mut().find(|d| {
            d.name == id.term
                && if unknown {
                    d.is_unresolved
                } else {
                    !d.is_unresolved && is_ambiguous(d.match_confidence, threshold)
                }
        }) else {
            return false;
        };

        let old_name = std::mem::replace(&mut dimension.name, answer.to_string());
        self.resolver.map_dimension(dimension);

        for filter in &mut entities.filters {
            if filter.dimension.eq_ignore_ascii_case(&old_name) {
                filter.dimension = answer.to_string();
                self.resolver.map_filter(filter);
            }
        }
        if let Some(sort) = entities.sort_by.as_mut() {
            if sort.field == old_name {
                sort.field = answer.to_string();
                sort.database_field = None;
            }
        }
        true
    }

    /// Only filters that detection would flag are rewritten; a valid filter
    /// sharing the literal is left alone.
    fn replace_filter_value(&self, entities: &mut QueryEntities, old_value: &str, answer: &str) -> bool {
        let mut applied = false;
        for filter in &mut entities.filters {
            if filter.value == old_value && is_invalid_value(&self.kb, filter) {
                filter.value = answer.to_string();
                self.resolver.map_filter(filter);
                applied = true;
            }
        }
        applied
    }
}

fn question_for(id: &ConflictId) -> String {
    match id.kind {
        ConflictKind::MissingMetric => "Which metric would you like to see?".to_string(),
        ConflictKind::AmbiguousMetric => format!(
            "Did you mean one of these metrics when you specified '{}'?",
            id.term
        ),
        ConflictKind::UnknownMetric => format!(
            "The metric '{}' is not recognized. Which of these metrics would you like to use instead?",
            id.term
        ),
        ConflictKind::AmbiguousDimension => format!(
            "Did you mean one of these dimensions when you specified '{}'?",
            id.term
        ),
        ConflictKind::UnknownDimension => format!(
            "The dimension '{}' is not recognized. Which of these dimensions would you like to use instead?",
            id.term
        ),
        ConflictKind::InvalidFilterValue => format!(
            "The value '{}' is not valid. Please select a valid value:",
            id.term
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingConfig;
    use crate::conflict::ConflictDetector;
    use crate::model::{Dimension, Filter};

    fn setup() -> (ClarificationEngine, EntityResolver) {
        let kb = Arc::new(DomainKnowledgeBase::gaming());
        (ClarificationEngine::new(kb.clone()), EntityResolver::new(kb))
    }

    fn responses(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_prompts_carry_conflict_ids() {
        let (engine, resolver) = setup();
        let mut candidate = QueryEntities::new();
        candidate.metrics = vec![Metric::candidate("xyzzy123")];
        candidate.filters = vec![Filter::equals("game type", "arcade")];
        let resolved = resolver.resolve(&candidate, "");

        let response = engine.request_clarification(&resolved);
        assert!(response.needs_clarification);
        let ids: Vec<String> = response
            .prompts
            .iter()
            .map(|p| p.conflict_id.to_string())
            .collect();
        assert_eq!(ids, vec!["UnknownMetric|xyzzy123", "InvalidFilterValue|arcade"]);
        assert_eq!(
            response.prompts[0].question,
            "The metric 'xyzzy123' is not recognized. Which of these metrics would you like to use instead?"
        );
        assert!(response.prompts.iter().all(|p| p.prompt_type == PromptType::Selection));
    }

    #[test]
    fn test_unknown_metric_replaced() {
        let (engine, resolver) = setup();
        let mut candidate = QueryEntities::new();
        candidate.metrics = vec![Metric::candidate("xyzzy123")];
        let resolved = resolver.resolve(&candidate, "");

        let updated =
            engine.apply_responses(&resolved, &responses(&[("UnknownMetric|xyzzy123", "revenue")]));
        let metric = &updated.metrics[0];
        assert_eq!(metric.name, "revenue");
        assert_eq!(metric.database_field.as_deref(), Some("Transactions.Amount"));
        assert!(!metric.is_unresolved);
        assert!(updated.conflicts.is_empty());
        assert_eq!(updated.clarification_round, 1);
    }

    #[test]
    fn test_only_the_flagged_duplicate_is_replaced() {
        let (engine, resolver) = setup();
        let mut resolved_twin = Metric::candidate("deposits");
        resolver.map_metric(&mut resolved_twin);
        let mut unresolved_twin = Metric::candidate("deposits");
        unresolved_twin.is_unresolved = true;

        let mut entities = QueryEntities::new();
        entities.metrics = vec![resolved_twin.clone(), unresolved_twin];

        let updated =
            engine.apply_responses(&entities, &responses(&[("UnknownMetric|deposits", "ggr")]));
        assert_eq!(updated.metrics[0], resolved_twin);
        assert_eq!(updated.metrics[1].name, "ggr");
    }

    #[test]
    fn test_dimension_replacement_cascades_to_filters() {
        let (engine, resolver) = setup();
        let mut candidate = QueryEntities::new();
        candidate.metrics = vec![Metric::candidate("revenue")];
        candidate.dimensions = vec![Dimension::candidate("kind")];
        candidate.filters = vec![Filter::equals("kind", "slots")];
        let resolved = resolver.resolve(&candidate, "");

        let updated =
            engine.apply_responses(&resolved, &responses(&[("UnknownDimension|kind", "game type")]));
        assert_eq!(updated.dimensions[0].database_field.as_deref(), Some("Games.GameType"));
        assert_eq!(updated.filters[0].dimension, "game type");
        assert_eq!(updated.filters[0].value, "Slots");
        assert_eq!(updated.filters[0].database_field.as_deref(), Some("Games.GameType"));
    }

    #[test]
    fn test_invalid_filter_value_replaced_and_normalized() {
        let (engine, resolver) = setup();
        let mut candidate = QueryEntities::new();
        candidate.metrics = vec![Metric::candidate("revenue")];
        candidate.filters = vec![Filter::equals("game type", "arcade")];
        let resolved = resolver.resolve(&candidate, "");

        let mut updated =
            engine.apply_responses(&resolved, &responses(&[("InvalidFilterValue|arcade", "bingo")]));
        assert_eq!(updated.filters[0].value, "Bingo");
        resolver.recheck(&mut updated);
        assert!(engine.evaluate(&updated).is_resolved());
    }

    #[test]
    fn test_valid_filter_sharing_the_literal_is_untouched() {
        let (engine, resolver) = setup();
        let mut candidate = QueryEntities::new();
        candidate.metrics = vec![Metric::candidate("revenue")];
        candidate.filters = vec![
            Filter::equals("game", "arcade"),
            Filter::equals("game type", "arcade"),
        ];
        let resolved = resolver.resolve(&candidate, "");
        assert_eq!(resolved.conflicts.len(), 1);

        let mut updated =
            engine.apply_responses(&resolved, &responses(&[("InvalidFilterValue|arcade", "slots")]));
        assert_eq!(updated.filters[0].value, "arcade");
        assert_eq!(updated.filters[0].database_field.as_deref(), Some("Games.GameName"));
        assert_eq!(updated.filters[1].value, "Slots");
        resolver.recheck(&mut updated);
        assert!(engine.evaluate(&updated).is_resolved());
    }

    fn strict_setup() -> (ClarificationEngine, EntityResolver) {
        let kb = Arc::new(DomainKnowledgeBase::gaming().with_matching(MatchingConfig {
            ambiguity_threshold: 0.85,
            ..MatchingConfig::default()
        }));
        (ClarificationEngine::new(kb.clone()), EntityResolver::new(kb))
    }

    #[test]
    fn test_ambiguous_metric_answer_replaces_only_the_fuzzy_match() {
        let (engine, resolver) = strict_setup();
        let mut exact = Metric::candidate("deposit");
        exact.database_field = Some("Payments.DepositAmount".to_string());
        exact.match_confidence = 1.0;
        let mut fuzzy = Metric::candidate("deposit");
        resolver.map_metric(&mut fuzzy);
        assert_eq!(fuzzy.match_confidence, 0.8);

        let mut entities = QueryEntities::new();
        entities.metrics = vec![exact.clone(), fuzzy];
        let conflicts = ConflictDetector::new(engine.kb.clone()).detect(&entities);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_id().unwrap().to_string(), "AmbiguousMetric|deposit");

        let updated =
            engine.apply_responses(&entities, &responses(&[("AmbiguousMetric|deposit", "ggr")]));
        assert_eq!(updated.metrics[0], exact);
        assert_eq!(updated.metrics[1].name, "ggr");
        assert_eq!(
            updated.metrics[1].database_field.as_deref(),
            Some("Games.GrossGamingRevenue")
        );
        assert_eq!(updated.metrics[1].match_confidence, 1.0);
    }

    #[test]
    fn test_ambiguous_dimension_answer_replaces_only_the_fuzzy_match() {
        let (engine, resolver) = strict_setup();
        let mut exact = Dimension::candidate("providers");
        exact.database_field = Some("Games.ProviderName".to_string());
        exact.match_confidence = 1.0;
        let mut fuzzy = Dimension::candidate("providers");
        resolver.map_dimension(&mut fuzzy);
        assert_eq!(fuzzy.match_confidence, 0.8);

        let mut entities = QueryEntities::new();
        entities.metrics = vec![Metric::candidate("revenue")];
        resolver.map_metric(&mut entities.metrics[0]);
        entities.dimensions = vec![exact.clone(), fuzzy];

        let updated = engine.apply_responses(
            &entities,
            &responses(&[("AmbiguousDimension|providers", "provider")]),
        );
        assert_eq!(updated.dimensions[0], exact);
        assert_eq!(updated.dimensions[1].name, "provider");
        assert_eq!(updated.dimensions[1].match_confidence, 1.0);
        assert!(ConflictDetector::new(engine.kb.clone()).detect(&updated).is_empty());
    }

    #[test]
    fn test_round_counter_saturates() {
        let (engine, _) = setup();
        let mut entities = QueryEntities::new();
        entities.clarification_round = u32::MAX;
        let updated = engine.apply_responses(
            &entities,
            &responses(&[("MissingMetric|required", "deposits")]),
        );
        assert_eq!(updated.clarification_round, u32::MAX);
        assert_eq!(updated.metrics[0].name, "deposits");
    }

    #[test]
    fn test_missing_metric_added_once() {
        let (engine, _) = setup();
        let entities = QueryEntities::new();
        let updated = engine.apply_responses(
            &entities,
            &responses(&[("MissingMetric|required", "deposits")]),
        );
        assert_eq!(updated.metrics.len(), 1);
        let again = engine.apply_responses(
            &updated,
            &responses(&[("MissingMetric|required", "Deposits")]),
        );
        assert_eq!(again.metrics.len(), 1);
    }

    #[test]
    fn test_malformed_ids_are_ignored() {
        let (engine, _) = setup();
        let entities = QueryEntities::new();
        let updated = engine.apply_responses(
            &entities,
            &responses(&[("Whatever|x", "revenue"), ("no-pipe", "revenue")]),
        );
        assert!(updated.metrics.is_empty());
        assert_eq!(updated.clarification_round, 1);
    }

    #[test]
    fn test_unmappable_answer_stays_unresolved() {
        let (engine, resolver) = setup();
        let mut candidate = QueryEntities::new();
        candidate.metrics = vec![Metric::candidate("xyzzy123")];
        let resolved = resolver.resolve(&candidate, "");

        let mut updated =
            engine.apply_responses(&resolved, &responses(&[("UnknownMetric|xyzzy123", "plugh")]));
        assert!(updated.metrics[0].is_unresolved);
        resolver.recheck(&mut updated);
        match engine.evaluate(&updated) {
            ClarificationState::AwaitingClarification { prompts, round, .. } => {
                assert_eq!(prompts[0].conflict_id.to_string(), "UnknownMetric|plugh");
                assert_eq!(round, 1);
            }
            ClarificationState::Resolved => panic!("expected another round"),
        }
    }
}
