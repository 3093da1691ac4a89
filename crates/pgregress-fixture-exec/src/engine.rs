//! Call contract between the harness and a SQL engine.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One self-contained unit of work sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatement {
    /// SQL text with comments stripped and variables interpolated.
    pub sql: String,
    /// Inline `COPY ... FROM stdin` data, if the statement carries any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_payload: Option<String>,
}

impl EngineStatement {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            copy_payload: None,
        }
    }

    #[must_use]
    pub fn with_copy_payload(mut self, payload: impl Into<String>) -> Self {
        self.copy_payload = Some(payload.into());
        self
    }
}

/// Harness-side view of the session a statement runs in.
///
/// The engine remains the source of truth; this is passed along so adapters that
/// multiplex sessions (or log them) can see the role and settings the harness
/// believes are active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Effective role (`current_user`).
    pub role: String,
    /// GUC overrides in effect, transaction-local values already applied.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Whether a transaction block is open.
    #[serde(default)]
    pub in_transaction: bool,
}

/// Row set returned by the engine, already rendered as text.
///
/// `None` cells are SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRows {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Option<String>>>,
}

impl EngineRows {
    /// Result of a command that produced no rows.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }
}

/// Error reported by the engine for a statement. The message is never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct EngineError {
    /// SQLSTATE, when the engine reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl EngineError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Why an engine call did not produce rows.
///
/// Only [`EngineFailure::Statement`] is a domain-level result; every other variant
/// means the connection can no longer be trusted.
#[derive(Debug, Error)]
pub enum EngineFailure {
    #[error(transparent)]
    Statement(EngineError),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Connect(String),
}

/// A live connection to the engine under test.
pub trait SqlEngine: Send {
    /// Execute exactly one statement in the given session context.
    fn exec(
        &mut self,
        statement: &EngineStatement,
        ctx: &SessionContext,
    ) -> Result<EngineRows, EngineFailure>;
}

/// Opens isolated connections. Shared across worker threads.
pub trait EngineFactory: Sync {
    fn connect(&self) -> Result<Box<dyn SqlEngine>, EngineFailure>;
}
