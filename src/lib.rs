//! nlq-engine: natural-language analytics questions to SQL.
//!
//! Pipeline: extract a candidate entity set from the question, resolve it
//! against the domain knowledge base, ask the user about anything ambiguous,
//! then compile the conflict-free result into a SELECT statement.

pub mod clarification;
pub mod compiler;
pub mod config;
pub mod conflict;
pub mod error;
pub mod extract;
pub mod feedback;
pub mod knowledge;
pub mod model;
pub mod orchestrator;
pub mod resolver;

pub use clarification::{ClarificationEngine, ClarificationResponse, ClarificationState};
pub use compiler::{CompiledQuery, QueryCompiler};
pub use config::{EngineConfig, ExtractorKind};
pub use conflict::ConflictDetector;
pub use error::{NlqError, Result};
pub use extract::{EntityExtractor, LlmExtractor, RuleBasedExtractor};
pub use feedback::{FeedbackQueue, FeedbackStore, SqliteFeedbackStore, TracingFeedbackStore};
pub use knowledge::DomainKnowledgeBase;
pub use model::QueryEntities;
pub use orchestrator::{QueryOrchestrator, QueryResult};
pub use resolver::EntityResolver;
