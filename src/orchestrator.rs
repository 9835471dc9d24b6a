//! Query Orchestrator
//!
//! Extract → Resolve → (clarify) → Compile. Every failure inside the pipeline
//! is turned into a failed `QueryResult`; nothing escapes to the caller.

use crate::clarification::{ClarificationEngine, ClarificationResponse};
use crate::compiler::{CompiledQuery, QueryCompiler};
use crate::config::{EngineConfig, ExtractorKind};
use crate::error::{NlqError, Result};
use crate::extract::{EntityExtractor, LlmExtractor, RuleBasedExtractor};
use crate::knowledge::DomainKnowledgeBase;
use crate::model::QueryEntities;
use crate::resolver::EntityResolver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub request_id: Uuid,
    pub is_successful: bool,
    pub needs_clarification: bool,
    pub entities: QueryEntities,
    pub clarification: Option<ClarificationResponse>,
    pub sql: Option<String>,
    pub parameterized: Option<CompiledQuery>,
    pub error_message: Option<String>,
}

impl QueryResult {
    fn failure(entities: QueryEntities, message: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            is_successful: false,
            needs_clarification: false,
            entities,
            clarification: None,
            sql: None,
            parameterized: None,
            error_message: Some(message.into()),
        }
    }
}

pub struct QueryOrchestrator {
    extractor: Box<dyn EntityExtractor>,
    fallback: RuleBasedExtractor,
    extraction_timeout: Duration,
    max_rounds: u32,
    resolver: EntityResolver,
    clarifier: ClarificationEngine,
    compiler: QueryCompiler,
}

impl QueryOrchestrator {
    /// Build the pipeline with the extractor named in `config`. An LLM
    /// extractor that cannot be constructed degrades to rule-based extraction.
    pub fn new(config: &EngineConfig, kb: Arc<DomainKnowledgeBase>) -> Result<Self> {
        let extractor: Box<dyn EntityExtractor> = match config.extractor {
            ExtractorKind::Rule => Box::new(RuleBasedExtractor::new(&kb)?),
            ExtractorKind::Llm => match LlmExtractor::new(&config.llm, &kb) {
                Ok(llm) => Box::new(llm),
                Err(e) => {
                    warn!("LLM extractor unavailable ({}), using rule-based extraction", e);
                    Box::new(RuleBasedExtractor::new(&kb)?)
                }
            },
        };
        Self::with_extractor(config, kb, extractor)
    }

    pub fn with_extractor(
        config: &EngineConfig,
        kb: Arc<DomainKnowledgeBase>,
        extractor: Box<dyn EntityExtractor>,
    ) -> Result<Self> {
        info!("Query orchestrator using '{}' extractor", extractor.name());
        Ok(Self {
            extractor,
            fallback: RuleBasedExtractor::new(&kb)?,
            extraction_timeout: config.extraction_timeout(),
            max_rounds: config.max_clarification_rounds,
            resolver: EntityResolver::new(kb.clone()),
            clarifier: ClarificationEngine::new(kb.clone()),
            compiler: QueryCompiler::new(kb),
        })
    }

    pub fn extractor_name(&self) -> &'static str {
        self.extractor.name()
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub async fn process(&self, text: &str) -> QueryResult {
        if text.trim().is_empty() {
            return QueryResult::failure(
                QueryEntities::new(),
                NlqError::Validation("Question text is required".to_string()).to_string(),
            );
        }

        info!("Processing question: {}", text);
        let candidate = self.extract(text).await.into_candidate();
        let entities = self.resolver.resolve(&candidate, text);
        self.finish(entities)
    }

    /// Fold answers (keyed by wire conflict id) into a previously returned
    /// entity set and run the pipeline tail again.
    pub fn apply_clarification(
        &self,
        entities: QueryEntities,
        responses: &HashMap<String, String>,
    ) -> QueryResult {
        if responses.is_empty() {
            return QueryResult::failure(
                entities,
                NlqError::Validation("At least one clarification response is required".to_string())
                    .to_string(),
            );
        }

        let mut updated = self.clarifier.apply_responses(&entities, responses);
        self.resolver.recheck(&mut updated);

        if updated.has_conflicts() && updated.clarification_round >= self.max_rounds {
            warn!(
                "Giving up after {} clarification rounds with {} conflicts left",
                updated.clarification_round,
                updated.conflicts.len()
            );
            let message = format!(
                "Could not resolve the question after {} clarification rounds",
                updated.clarification_round
            );
            return QueryResult::failure(updated, message);
        }

        self.finish(updated)
    }

    /// Configured extractor under a deadline; rule-based extraction on
    /// timeout or error.
    async fn extract(&self, text: &str) -> QueryEntities {
        match tokio::time::timeout(self.extraction_timeout, self.extractor.extract(text)).await {
            Ok(Ok(entities)) => return entities,
            Ok(Err(e)) => warn!("{} extraction failed: {}", self.extractor.name(), e),
            Err(_) => warn!(
                "{} extraction timed out after {:?}",
                self.extractor.name(),
                self.extraction_timeout
            ),
        }
        self.fallback.extract_entities(text)
    }

    fn finish(&self, entities: QueryEntities) -> QueryResult {
        if entities.has_conflicts() {
            let clarification = self.clarifier.request_clarification(&entities);
            info!(
                "Clarification needed: {} prompts (round {})",
                clarification.prompts.len(),
                entities.clarification_round
            );
            return QueryResult {
                request_id: Uuid::new_v4(),
                is_successful: true,
                needs_clarification: true,
                entities,
                clarification: Some(clarification),
                sql: None,
                parameterized: None,
                error_message: None,
            };
        }

        match self.compile(&entities) {
            Ok((sql, parameterized)) => QueryResult {
                request_id: Uuid::new_v4(),
                is_successful: true,
                needs_clarification: false,
                entities,
                clarification: None,
                sql: Some(sql),
                parameterized: Some(parameterized),
                error_message: None,
            },
            Err(e) => {
                error!("Compilation failed: {}", e);
                QueryResult::failure(entities, e.to_string())
            }
        }
    }

    fn compile(&self, entities: &QueryEntities) -> Result<(String, CompiledQuery)> {
        let sql = self.compiler.compile(entities)?;
        let parameterized = self.compiler.compile_parameterized(entities)?;
        Ok((sql, parameterized))
    }
}
