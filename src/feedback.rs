//! Mapping Feedback
//!
//! Records whether a term→entry mapping was correct so the dictionary can be
//! improved later. Recording only enqueues: a dedicated worker thread drains
//! the queue into a `FeedbackStore`, so a slow or failing store never touches
//! the request path.
//!
//! Stores:
//! - `TracingFeedbackStore`: logs each record
//! - `SqliteFeedbackStore`: persists records in a `mapping_feedback` table

use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFeedback {
    /// Term the user originally wrote
    pub term: String,
    /// What it ended up mapped to
    pub mapped_to: String,
    pub correct: bool,
    #[serde(default)]
    pub correction: Option<String>,
    /// RFC3339 timestamp
    pub recorded_at: String,
}

impl MappingFeedback {
    pub fn new(term: &str, mapped_to: &str, correct: bool, correction: Option<&str>) -> Self {
        Self {
            term: term.to_string(),
            mapped_to: mapped_to.to_string(),
            correct,
            correction: correction.map(str::to_string),
            recorded_at: Utc::now().to_rfc3339(),
        }
    }
}

pub trait FeedbackStore: Send {
    fn store(&mut self, feedback: &MappingFeedback) -> Result<()>;
}

impl FeedbackStore for Box<dyn FeedbackStore> {
    fn store(&mut self, feedback: &MappingFeedback) -> Result<()> {
        (**self).store(feedback)
    }
}

/// Writes feedback to the log only
#[derive(Debug, Default)]
pub struct TracingFeedbackStore;

impl FeedbackStore for TracingFeedbackStore {
    fn store(&mut self, feedback: &MappingFeedback) -> Result<()> {
        info!(
            term = %feedback.term,
            mapped_to = %feedback.mapped_to,
            correct = feedback.correct,
            "Mapping feedback"
        );
        Ok(())
    }
}

pub struct SqliteFeedbackStore {
    db: Connection,
}

impl SqliteFeedbackStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            db: Connection::open(path)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            db: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS mapping_feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                term TEXT NOT NULL,
                mapped_to TEXT NOT NULL,
                correct INTEGER NOT NULL,
                correction TEXT,
                recorded_at TEXT NOT NULL
            )
            "#,
            [],
        )?;
        self.db.execute(
            "CREATE INDEX IF NOT EXISTS idx_mapping_feedback_term ON mapping_feedback(term)",
            [],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<i64> {
        let count = self
            .db
            .query_row("SELECT COUNT(*) FROM mapping_feedback", [], |row| row.get(0))?;
        Ok(count)
    }

    /// All feedback recorded for `term`, oldest first
    pub fn for_term(&self, term: &str) -> Result<Vec<MappingFeedback>> {
        let mut stmt = self.db.prepare(
            "SELECT term, mapped_to, correct, correction, recorded_at
             FROM mapping_feedback WHERE lower(term) = lower(?1) ORDER BY id",
        )?;
        let rows = stmt.query_map(params![term], |row| {
            Ok(MappingFeedback {
                term: row.get(0)?,
                mapped_to: row.get(1)?,
                correct: row.get::<_, i64>(2)? != 0,
                correction: row.get(3)?,
                recorded_at: row.get(4)?,
            })
        })?;

        let mut feedback = Vec::new();
        for row in rows {
            feedback.push(row?);
        }
        Ok(feedback)
    }
}

impl FeedbackStore for SqliteFeedbackStore {
    fn store(&mut self, feedback: &MappingFeedback) -> Result<()> {
        self.db.execute(
            "INSERT INTO mapping_feedback (term, mapped_to, correct, correction, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                feedback.term,
                feedback.mapped_to,
                feedback.correct as i64,
                feedback.correction,
                feedback.recorded_at,
            ],
        )?;
        debug!("Stored feedback for '{}'", feedback.term);
        Ok(())
    }
}

/// Sending half of the feedback pipeline. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct FeedbackQueue {
    sender: Option<mpsc::UnboundedSender<MappingFeedback>>,
}

impl FeedbackQueue {
    /// A queue that drops everything
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Start a worker thread draining into `store`.
    pub fn spawn<S>(store: S) -> (Self, FeedbackWorker<S>)
    where
        S: FeedbackStore + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<MappingFeedback>();
        let handle = std::thread::spawn(move || {
            let mut store = store;
            while let Some(feedback) = receiver.blocking_recv() {
                if let Err(e) = store.store(&feedback) {
                    warn!("Failed to store feedback for '{}': {}", feedback.term, e);
                }
            }
            store
        });
        (
            Self {
                sender: Some(sender),
            },
            FeedbackWorker { handle },
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Enqueue without waiting. A closed or disabled queue is ignored.
    pub fn record(&self, feedback: MappingFeedback) {
        if let Some(sender) = &self.sender {
            if sender.send(feedback).is_err() {
                debug!("Feedback worker has stopped, dropping record");
            }
        }
    }
}

/// Handle on the worker thread; finishing returns the store once every
/// queue clone has been dropped.
pub struct FeedbackWorker<S> {
    handle: JoinHandle<S>,
}

impl<S> FeedbackWorker<S> {
    pub fn finish(self) -> Option<S> {
        match self.handle.join() {
            Ok(store) => Some(store),
            Err(_) => {
                warn!("Feedback worker panicked");
                None
            }
        }
    }
}
