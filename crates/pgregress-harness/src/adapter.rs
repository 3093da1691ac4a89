//! Execution engine adapter.
//!
//! Sends one normalized statement to the engine in the session's context and sorts
//! the answer into an outcome (rows or a statement error) or an infrastructure
//! failure that ends the run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use pgregress_fixture_exec::{
    EngineError, EngineFactory, EngineFailure, EngineRows, EngineStatement, SqlEngine,
};

use crate::error::{InfrastructureError, InfrastructureKind};
use crate::normalize::NormalizedStatement;
use crate::session::{Session, StatementKind, classify};

/// What the engine said about a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Rows(EngineRows),
    Error(EngineError),
}

impl ExecutionOutcome {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Error(err) => err.code.as_deref(),
            Self::Rows(_) => None,
        }
    }
}

/// An executed statement with its timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: ExecutionOutcome,
    pub duration: Duration,
    /// Answered by the harness without contacting the engine.
    pub short_circuited: bool,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One engine connection, used by a single run group.
pub struct EngineAdapter {
    engine: Box<dyn SqlEngine>,
}

impl EngineAdapter {
    /// Open a connection for a run group. `file` names the first file to run on it.
    pub fn connect(factory: &dyn EngineFactory, file: &str) -> Result<Self, InfrastructureError> {
        let connected = catch_unwind(AssertUnwindSafe(|| factory.connect()));
        let kind = match connected {
            Ok(Ok(engine)) => return Ok(Self { engine }),
            Ok(Err(failure)) => InfrastructureKind::ConnectFailed(failure.to_string()),
            Err(payload) => InfrastructureKind::AdapterPanic(panic_message(payload.as_ref())),
        };
        Err(InfrastructureError {
            file: file.to_string(),
            statement_index: None,
            kind,
        })
    }

    #[must_use]
    pub fn new(engine: Box<dyn SqlEngine>) -> Self {
        Self { engine }
    }

    /// Execute one statement and update the session's mirrors from the result.
    pub fn execute(
        &mut self,
        session: &mut Session,
        statement: &NormalizedStatement,
        index: usize,
    ) -> Result<Execution, InfrastructureError> {
        let kind = classify(&statement.sql);
        let started = Instant::now();
        if let Some(err) = session.gate(&kind) {
            return Ok(Execution {
                outcome: ExecutionOutcome::Error(err),
                duration: started.elapsed(),
                short_circuited: true,
            });
        }

        let outcome = self.send(session, &statement.to_engine(), index)?;
        session.observe(&kind, !outcome.is_error());
        Ok(Execution {
            outcome,
            duration: started.elapsed(),
            short_circuited: false,
        })
    }

    /// Roll back whatever transaction the session has open.
    pub fn rollback(
        &mut self,
        session: &mut Session,
        index: usize,
    ) -> Result<ExecutionOutcome, InfrastructureError> {
        let outcome = self.send(session, &EngineStatement::new("ROLLBACK"), index)?;
        session.observe(&StatementKind::Rollback { chain: false }, true);
        Ok(outcome)
    }

    fn send(
        &mut self,
        session: &Session,
        statement: &EngineStatement,
        index: usize,
    ) -> Result<ExecutionOutcome, InfrastructureError> {
        let ctx = session.context();
        let engine = &mut self.engine;
        let result = catch_unwind(AssertUnwindSafe(|| engine.exec(statement, &ctx)));
        let kind = match result {
            Ok(Ok(rows)) => return Ok(ExecutionOutcome::Rows(rows)),
            Ok(Err(EngineFailure::Statement(err))) => return Ok(ExecutionOutcome::Error(err)),
            Ok(Err(EngineFailure::ConnectionLost(reason))) => {
                InfrastructureKind::ConnectionLost(reason)
            }
            Ok(Err(EngineFailure::Timeout(after))) => {
                InfrastructureKind::Timeout(format!("no answer after {after:?}"))
            }
            Ok(Err(EngineFailure::Connect(reason))) => InfrastructureKind::ConnectFailed(reason),
            Err(payload) => InfrastructureKind::AdapterPanic(panic_message(payload.as_ref())),
        };
        Err(InfrastructureError {
            file: session.file().to_string(),
            statement_index: Some(index),
            kind,
        })
    }
}
