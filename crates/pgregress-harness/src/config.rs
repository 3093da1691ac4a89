//! Harness configuration.
//!
//! Loaded from an optional JSON file, then overridden by `PGREGRESS_*` environment
//! variables, then by CLI flags. Every field has a default so an empty object is a
//! valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fixtures::RegressionFile;
use crate::normalize::Variables;

pub const ENV_ERROR_MATCH: &str = "PGREGRESS_ERROR_MATCH";
pub const ENV_PARALLEL: &str = "PGREGRESS_PARALLEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
}

/// How an expected error string is compared with the engine's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMatchPolicy {
    /// The engine message contains the expected text.
    #[default]
    Contains,
    /// The engine message equals the expected text.
    Exact,
}

impl ErrorMatchPolicy {
    #[must_use]
    pub fn matches(self, expected: &str, actual: &str) -> bool {
        match self {
            Self::Contains => actual.contains(expected),
            Self::Exact => actual == expected,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Exact => "exact",
        }
    }
}

impl FromStr for ErrorMatchPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contains" | "substring" => Ok(Self::Contains),
            "exact" | "equals" => Ok(Self::Exact),
            _ => Err(ConfigError::InvalidValue {
                key: "error_match".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Selects which requested files are actually run and reported.
///
/// Name patterns are exact names or a prefix ending in `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
}

impl RunFilter {
    #[must_use]
    pub fn admits(&self, file: &RegressionFile) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| name_matches(p, &file.name)) {
            return false;
        }
        if self.exclude.iter().any(|p| name_matches(p, &file.name)) {
            return false;
        }
        if !self.include_tags.is_empty() && !file.tags.iter().any(|t| self.include_tags.contains(t))
        {
            return false;
        }
        !file.tags.iter().any(|t| self.exclude_tags.contains(t))
    }
}

fn name_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub error_match: ErrorMatchPolicy,
    pub filter: RunFilter,
    /// psql variables bound before every file run (e.g. `libdir`).
    pub variables: BTreeMap<String, String>,
    /// Environment seen by `\getenv`, consulted before the process environment.
    pub env: BTreeMap<String, String>,
    /// Let `\getenv` fall back to the process environment.
    pub inherit_process_env: bool,
    /// Session user every file run starts as.
    pub default_role: String,
    /// Run independent groups of files concurrently.
    pub parallel: bool,
    /// Per-statement timeout handed to engine adapters that support one.
    pub statement_timeout_ms: Option<u64>,
    /// Roll back a transaction a file leaves open before the next file starts.
    pub rollback_open_transactions: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            error_match: ErrorMatchPolicy::default(),
            filter: RunFilter::default(),
            variables: BTreeMap::new(),
            env: BTreeMap::new(),
            inherit_process_env: true,
            default_role: "postgres".to_string(),
            parallel: true,
            statement_timeout_ms: None,
            rollback_open_transactions: true,
        }
    }
}

impl HarnessConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `PGREGRESS_*` overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `PGREGRESS_*` overrides from an arbitrary lookup.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_ERROR_MATCH) {
            self.error_match = value.parse()?;
        }
        if let Some(value) = lookup(ENV_PARALLEL) {
            self.parallel = parse_bool(ENV_PARALLEL, &value)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    /// Variable bindings a fresh session starts with.
    #[must_use]
    pub fn initial_variables(&self) -> Variables {
        Variables::new(
            self.variables.clone(),
            self.env.clone(),
            self.inherit_process_env,
        )
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
