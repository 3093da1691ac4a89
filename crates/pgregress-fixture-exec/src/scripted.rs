//! Transcript-replay engine.
//!
//! Responses are looked up from an [`EngineScript`]: an ordered list of rules keyed by
//! SQL text (whitespace-insensitive, trailing `;` ignored). Every call is appended to a
//! journal shared by all connections of a factory, so tests can assert which
//! statements actually reached the engine.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::{
    EngineError, EngineFactory, EngineFailure, EngineRows, EngineStatement, SessionContext,
    SqlEngine,
};

/// What the scripted engine does for a matched statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptResponse {
    Rows(EngineRows),
    Error(EngineError),
    Disconnect,
    Timeout,
    Panic(String),
}

impl ScriptResponse {
    /// Shorthand for a single-column result.
    #[must_use]
    pub fn column(name: &str, values: &[Option<&str>]) -> Self {
        Self::Rows(EngineRows::new(
            vec![name.to_string()],
            values
                .iter()
                .map(|v| vec![v.map(str::to_string)])
                .collect(),
        ))
    }

    #[must_use]
    pub fn error(message: &str) -> Self {
        Self::Error(EngineError::new(message))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRule {
    pub sql: String,
    /// Match any statement starting with `sql` instead of the whole text.
    #[serde(default)]
    pub prefix: bool,
    pub response: ScriptResponse,
}

/// Ordered response rules. First match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineScript {
    #[serde(default)]
    pub rules: Vec<ScriptRule>,
    /// Response for unmatched statements; an empty command result when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ScriptResponse>,
}

impl EngineScript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on(mut self, sql: &str, response: ScriptResponse) -> Self {
        self.rules.push(ScriptRule {
            sql: sql.to_string(),
            prefix: false,
            response,
        });
        self
    }

    #[must_use]
    pub fn on_prefix(mut self, sql: &str, response: ScriptResponse) -> Self {
        self.rules.push(ScriptRule {
            sql: sql.to_string(),
            prefix: true,
            response,
        });
        self
    }

    #[must_use]
    pub fn with_default(mut self, response: ScriptResponse) -> Self {
        self.default = Some(response);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&content)?)
    }

    /// Resolve the response for a statement.
    #[must_use]
    pub fn respond(&self, sql: &str) -> ScriptResponse {
        let wanted = canonical_sql(sql);
        self.rules
            .iter()
            .find(|rule| {
                let key = canonical_sql(&rule.sql);
                if rule.prefix {
                    wanted.starts_with(&key)
                } else {
                    wanted == key
                }
            })
            .map(|rule| rule.response.clone())
            .or_else(|| self.default.clone())
            .unwrap_or_else(|| ScriptResponse::Rows(EngineRows::empty()))
    }
}

fn canonical_sql(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_end_matches(';').trim_end().to_string()
}

/// One call observed by a scripted engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedStatement {
    pub connection: usize,
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_payload: Option<String>,
    pub role: String,
}

type Journal = Arc<Mutex<Vec<ExecutedStatement>>>;

pub struct ScriptedEngine {
    script: Arc<EngineScript>,
    journal: Journal,
    connection: usize,
}

impl ScriptedEngine {
    /// Standalone engine with a private journal.
    #[must_use]
    pub fn new(script: EngineScript) -> Self {
        Self {
            script: Arc::new(script),
            journal: Arc::default(),
            connection: 0,
        }
    }

    #[must_use]
    pub fn journal(&self) -> Vec<ExecutedStatement> {
        self.journal.lock().clone()
    }
}

impl SqlEngine for ScriptedEngine {
    fn exec(
        &mut self,
        statement: &EngineStatement,
        ctx: &SessionContext,
    ) -> Result<EngineRows, EngineFailure> {
        self.journal.lock().push(ExecutedStatement {
            connection: self.connection,
            sql: statement.sql.clone(),
            copy_payload: statement.copy_payload.clone(),
            role: ctx.role.clone(),
        });
        match self.script.respond(&statement.sql) {
            ScriptResponse::Rows(rows) => Ok(rows),
            ScriptResponse::Error(err) => Err(EngineFailure::Statement(err)),
            ScriptResponse::Disconnect => Err(EngineFailure::ConnectionLost(
                "server closed the connection unexpectedly".to_string(),
            )),
            ScriptResponse::Timeout => Err(EngineFailure::Timeout(Duration::ZERO)),
            ScriptResponse::Panic(message) => panic!("{message}"),
        }
    }
}

/// Hands out scripted connections that share one script and one journal.
pub struct ScriptedFactory {
    script: Arc<EngineScript>,
    journal: Journal,
    connections: AtomicUsize,
}

impl ScriptedFactory {
    #[must_use]
    pub fn new(script: EngineScript) -> Self {
        Self {
            script: Arc::new(script),
            journal: Arc::default(),
            connections: AtomicUsize::new(0),
        }
    }

    /// Every statement executed so far, across all connections, in arrival order.
    #[must_use]
    pub fn journal(&self) -> Vec<ExecutedStatement> {
        self.journal.lock().clone()
    }

    /// Executed SQL text only.
    #[must_use]
    pub fn executed_sql(&self) -> Vec<String> {
        self.journal.lock().iter().map(|e| e.sql.clone()).collect()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl EngineFactory for ScriptedFactory {
    fn connect(&self) -> Result<Box<dyn SqlEngine>, EngineFailure> {
        let connection = self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            script: Arc::clone(&self.script),
            journal: Arc::clone(&self.journal),
            connection,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SessionContext {
        SessionContext {
            role: "postgres".to_string(),
            ..SessionContext::default()
        }
    }

    #[test]
    fn matches_ignoring_whitespace_and_semicolon() {
        let script = EngineScript::new().on(
            "select  1;",
            ScriptResponse::column("?column?", &[Some("1")]),
        );
        let mut engine = ScriptedEngine::new(script);
        let rows = engine
            .exec(&EngineStatement::new("select 1"), &ctx())
            .unwrap();
        assert_eq!(rows.rows, vec![vec![Some("1".to_string())]]);
    }

    #[test]
    fn prefix_rule_and_default() {
        let script = EngineScript::new()
            .on_prefix("drop domain", ScriptResponse::error("cannot drop type"))
            .with_default(ScriptResponse::column("x", &[None]));
        let mut engine = ScriptedEngine::new(script);
        let err = engine
            .exec(&EngineStatement::new("drop domain d cascade"), &ctx())
            .unwrap_err();
        assert!(matches!(err, EngineFailure::Statement(e) if e.message == "cannot drop type"));
        let rows = engine
            .exec(&EngineStatement::new("select x"), &ctx())
            .unwrap();
        assert_eq!(rows.rows, vec![vec![None]]);
    }

    #[test]
    fn factory_connections_share_journal() {
        let factory = ScriptedFactory::new(EngineScript::new());
        let mut a = factory.connect().unwrap();
        let mut b = factory.connect().unwrap();
        a.exec(&EngineStatement::new("create table t()"), &ctx())
            .unwrap();
        b.exec(&EngineStatement::new("select 1"), &ctx()).unwrap();
        let journal = factory.journal();
        assert_eq!(factory.connections(), 2);
        assert_eq!(journal[0].connection, 0);
        assert_eq!(journal[1].connection, 1);
        assert_eq!(factory.executed_sql(), vec!["create table t()", "select 1"]);
    }

    #[test]
    fn script_parses_from_json() {
        let script = EngineScript::from_json(
            r#"{
                "rules": [
                    {"sql": "select 1", "response": {"rows": {"columns": ["a"], "rows": [["1"]]}}},
                    {"sql": "bad", "prefix": true, "response": {"error": {"code": "42601", "message": "syntax error"}}},
                    {"sql": "bye", "response": "disconnect"}
                ]
            }"#,
        )
        .expect("valid script json");
        assert_eq!(script.rules.len(), 3);
        assert_eq!(script.respond("bye"), ScriptResponse::Disconnect);
        assert!(matches!(
            script.respond("bad sql"),
            ScriptResponse::Error(e) if e.code.as_deref() == Some("42601")
        ));
    }
}
