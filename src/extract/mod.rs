//! Entity Extraction
//!
//! Turns question text into a raw candidate `QueryEntities`. Nothing here maps
//! terms to database fields; that is the resolver's job.

pub mod llm;
pub mod rules;

pub use llm::LlmExtractor;
pub use rules::RuleBasedExtractor;

use crate::error::Result;
use crate::model::QueryEntities;
use async_trait::async_trait;

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    /// Short label used in logs
    fn name(&self) -> &'static str;

    /// Extract a candidate entity set. Collections are always present, even
    /// for blank input.
    async fn extract(&self, text: &str) -> Result<QueryEntities>;
}
