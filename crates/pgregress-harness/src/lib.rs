//! Regression harness for PostgreSQL-style SQL regression fixtures.
//!
//! This crate provides:
//! - Fixture registry: named regression files with their statements and dependencies
//! - Dependency scheduling: topological run order, cycle detection, parallel run groups
//! - Statement normalization: psql meta-commands, variables, COPY payloads, comments
//! - Session tracking: role, GUC and transaction-state bookkeeping per file run
//! - Verification: row/error expectations compared against engine output
//! - Report generation: human-readable + machine-readable regression reports

#![forbid(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod diff;
pub mod error;
pub mod fixtures;
pub mod normalize;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod structured_log;
pub mod verify;

pub use config::{ErrorMatchPolicy, HarnessConfig, RunFilter};
pub use error::{FixtureError, HarnessError, InfrastructureError};
pub use fixtures::{Cell, RegressionFile, RegressionFileStatement};
pub use registry::FixtureRegistry;
pub use report::{ReportComparison, RunReport};
pub use runner::{CollectingHandle, TestHandle, TestRunner};
pub use verify::{StatementResult, Verdict};
