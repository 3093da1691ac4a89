//! Engine execution adapters shared by the pgregress harness tooling.
//!
//! This crate is the seam between the harness and the SQL engine under test. The
//! harness only ever talks to a [`SqlEngine`] obtained from an [`EngineFactory`]:
//! - [`ScriptedEngine`]: deterministic transcript replay for tests and offline runs
//! - [`ProcessEngine`]: drives an external engine bridge over JSON lines

pub mod engine;
pub mod process;
pub mod scripted;

pub use engine::{
    EngineError, EngineFactory, EngineFailure, EngineRows, EngineStatement, SessionContext,
    SqlEngine,
};
pub use process::{ProcessEngine, ProcessFactory};
pub use scripted::{
    EngineScript, ExecutedStatement, ScriptResponse, ScriptRule, ScriptedEngine, ScriptedFactory,
};
