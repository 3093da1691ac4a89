//! Harness error taxonomy.
//!
//! Engine errors for individual statements are not here: they are ordinary
//! outcomes handed to the verifier. Assertion failures are verdicts. What remains
//! are the two run-terminating families: broken fixtures and broken infrastructure.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// A fixture cannot be run as declared. Fatal to the run, never a test result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixtureError {
    #[error("regression file has an empty name")]
    EmptyName,
    #[error("duplicate regression file `{0}`")]
    DuplicateFile(String),
    #[error("registry is sealed, cannot register `{0}`")]
    RegistrySealed(String),
    #[error("{file}[{index}]: statement sets both results and error_string")]
    MalformedStatement { file: String, index: usize },
    #[error("unknown regression file `{0}`")]
    UnknownFile(String),
    #[error("`{file}` depends on unknown regression file `{dependency}`")]
    UnknownDependency { file: String, dependency: String },
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("{file}[{index}]: unresolved variable `:{name}`")]
    UnresolvedVariable {
        file: String,
        index: usize,
        name: String,
    },
    #[error("{file}[{index}]: unexpected text after COPY data terminator")]
    TrailingCopyData { file: String, index: usize },
    #[error("invalid fixture {path}: {message}")]
    InvalidFixture { path: String, message: String },
}

/// What went wrong below the SQL layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum InfrastructureKind {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("engine adapter panicked: {0}")]
    AdapterPanic(String),
}

/// The harness could not get an answer from the engine. Aborts the run and is
/// reported apart from assertion failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureError {
    pub file: String,
    /// Statement being executed, `None` when the failure happened while connecting.
    pub statement_index: Option<usize>,
    pub kind: InfrastructureKind,
}

impl fmt::Display for InfrastructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.statement_index {
            Some(index) => write!(f, "{}[{}]: {}", self.file, index, self.kind),
            None => write!(f, "{}: {}", self.file, self.kind),
        }
    }
}

impl std::error::Error for InfrastructureError {}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    #[error("infrastructure failure: {0}")]
    Infrastructure(#[from] InfrastructureError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// True when the failure is the harness's fault rather than the fixtures'.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure(_) | Self::Io(_))
    }
}
