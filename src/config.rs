//! Engine Configuration
//!
//! Settings are read from the process environment (after loading `.env`) and
//! can be overridden by the CLI.

use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EXTRACTION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_CLARIFICATION_ROUNDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// Deterministic offline extraction
    Rule,
    /// OpenAI-compatible chat completion
    Llm,
}

impl FromStr for ExtractorKind {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rule" | "rules" | "rule_based" | "heuristic" => Ok(ExtractorKind::Rule),
            "llm" | "openai" => Ok(ExtractorKind::Llm),
            other => Err(NlqError::Validation(format!(
                "Unknown extractor '{}', expected 'rule' or 'llm'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Numeric thresholds used by term matching and conflict detection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// A fuzzy score must exceed this to count as a match
    pub accept_threshold: f64,
    /// Mapped items scoring below this are flagged ambiguous
    pub ambiguity_threshold: f64,
    /// Minimum score for a name to be offered as a suggestion
    pub suggestion_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.7,
            ambiguity_threshold: 0.7,
            suggestion_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub extractor: ExtractorKind,
    pub llm: LlmConfig,
    /// Milliseconds allowed for the configured extractor before falling back
    pub extraction_timeout_ms: u64,
    pub max_clarification_rounds: u32,
    pub knowledge_base_path: Option<PathBuf>,
    pub feedback_db_path: Option<PathBuf>,
    pub matching: MatchingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            extractor: ExtractorKind::Rule,
            llm: LlmConfig::default(),
            extraction_timeout_ms: DEFAULT_EXTRACTION_TIMEOUT_MS,
            max_clarification_rounds: DEFAULT_MAX_CLARIFICATION_ROUNDS,
            knowledge_base_path: None,
            feedback_db_path: None,
            matching: MatchingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load `.env` (if present) and read the `NLQ_*` / `OPENAI_*` variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("OPENAI_API_KEY");
        let extractor = match get("NLQ_EXTRACTOR") {
            Some(raw) => raw.parse()?,
            None if api_key.is_some() => ExtractorKind::Llm,
            None => ExtractorKind::Rule,
        };

        let extraction_timeout_ms = match get("NLQ_EXTRACTION_TIMEOUT_MS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                NlqError::Validation(format!("NLQ_EXTRACTION_TIMEOUT_MS is not a number: {}", raw))
            })?,
            None => DEFAULT_EXTRACTION_TIMEOUT_MS,
        };

        let max_clarification_rounds = match get("NLQ_MAX_CLARIFICATION_ROUNDS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                NlqError::Validation(format!(
                    "NLQ_MAX_CLARIFICATION_ROUNDS is not a number: {}",
                    raw
                ))
            })?,
            None => DEFAULT_MAX_CLARIFICATION_ROUNDS,
        };

        let defaults = MatchingConfig::default();
        let matching = MatchingConfig {
            accept_threshold: threshold(get("NLQ_ACCEPT_THRESHOLD"), "NLQ_ACCEPT_THRESHOLD")?
                .unwrap_or(defaults.accept_threshold),
            ambiguity_threshold: threshold(
                get("NLQ_AMBIGUITY_THRESHOLD"),
                "NLQ_AMBIGUITY_THRESHOLD",
            )?
            .unwrap_or(defaults.ambiguity_threshold),
            suggestion_threshold: threshold(
                get("NLQ_SUGGESTION_THRESHOLD"),
                "NLQ_SUGGESTION_THRESHOLD",
            )?
            .unwrap_or(defaults.suggestion_threshold),
        };

        Ok(Self {
            extractor,
            llm: LlmConfig {
                api_key,
                model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            },
            extraction_timeout_ms,
            max_clarification_rounds,
            knowledge_base_path: get("NLQ_KNOWLEDGE_BASE").map(PathBuf::from),
            feedback_db_path: get("NLQ_FEEDBACK_DB").map(PathBuf::from),
            matching,
        })
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }
}

/// A score threshold in `[0, 1]`
pub fn parse_threshold(raw: &str, name: &str) -> Result<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| NlqError::Validation(format!("{} is not a number: {}", name, raw)))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(NlqError::Validation(format!(
            "{} must be between 0 and 1, got {}",
            name, value
        )));
    }
    Ok(value)
}

fn threshold(raw: Option<String>, name: &str) -> Result<Option<f64>> {
    raw.map(|raw| parse_threshold(&raw, name)).transpose()
}
