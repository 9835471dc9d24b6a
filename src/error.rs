use thiserror::Error;

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Knowledge base error: {0}")]
    KnowledgeBase(String),

    #[error("Feedback error: {0}")]
    Feedback(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for NlqError {
    fn from(err: rusqlite::Error) -> Self {
        NlqError::Feedback(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NlqError>;
