//! Per-file session and transaction bookkeeping.
//!
//! The engine owns the real session. The harness mirrors the parts it needs to
//! behave like a psql client: the active role and settings passed with every call,
//! the transaction state that decides whether a statement may be sent at all, and
//! the psql variables used for interpolation. Mirrors are only updated once the
//! engine has accepted the statement.

use std::collections::BTreeMap;

use pgregress_fixture_exec::{EngineError, EngineRows, SessionContext};
use serde::Serialize;

use crate::normalize::Variables;

pub const ABORTED_TRANSACTION_MESSAGE: &str =
    "current transaction is aborted, commands ignored until end of transaction block";
pub const ABORTED_TRANSACTION_SQLSTATE: &str = "25P02";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[default]
    Idle,
    InTransaction,
    AbortedTransaction,
}

impl TransactionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InTransaction => "in_transaction",
            Self::AbortedTransaction => "aborted_transaction",
        }
    }
}

/// What a statement does to session state, as far as the harness cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Begin,
    Commit { chain: bool },
    Rollback { chain: bool },
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    PrepareTransaction,
    SetRole(String),
    ResetRole,
    SetSessionAuthorization(String),
    ResetSessionAuthorization,
    SetSetting {
        name: String,
        value: String,
        local: bool,
    },
    ResetSetting(String),
    ResetAll,
    Other,
}

impl StatementKind {
    /// Statements still accepted inside an aborted transaction.
    #[must_use]
    pub fn ends_aborted_transaction(&self) -> bool {
        matches!(
            self,
            Self::Commit { .. }
                | Self::Rollback { .. }
                | Self::RollbackToSavepoint(_)
                | Self::PrepareTransaction
        )
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            let inner = &value[1..value.len() - 1];
            let doubled = format!("{quote}{quote}");
            return inner.replace(&doubled, &quote.to_string());
        }
    }
    value.to_string()
}

/// Role names fold to lower case unless quoted.
fn role_name(value: &str) -> String {
    let value = value.trim();
    if value.starts_with('"') {
        unquote(value)
    } else {
        unquote(value).to_ascii_lowercase()
    }
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let text = text.trim_start();
    let head = text.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &text[keyword.len()..];
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest)
}

fn has_chain(words: &[String]) -> bool {
    words.windows(2).any(|w| w[0] == "and" && w[1] == "chain")
}

fn savepoint_name(words: &[String]) -> String {
    words
        .iter()
        .rev()
        .find(|w| !matches!(w.as_str(), "savepoint" | "to" | "work" | "transaction"))
        .cloned()
        .unwrap_or_default()
}

/// Classify comment-free SQL.
#[must_use]
pub fn classify(sql: &str) -> StatementKind {
    let sql = sql.trim().trim_end_matches(';').trim_end();
    let words: Vec<String> = sql
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .collect();
    let word = |i: usize| words.get(i).map_or("", String::as_str);

    match word(0) {
        "begin" => StatementKind::Begin,
        "start" if word(1) == "transaction" => StatementKind::Begin,
        "commit" | "end" if word(1) != "prepared" => StatementKind::Commit {
            chain: has_chain(&words),
        },
        "rollback" | "abort" if word(1) == "prepared" => StatementKind::Other,
        "rollback" | "abort" if words.iter().any(|w| w == "to") => {
            StatementKind::RollbackToSavepoint(savepoint_name(&words))
        }
        "rollback" | "abort" => StatementKind::Rollback {
            chain: has_chain(&words),
        },
        "savepoint" => StatementKind::Savepoint(word(1).to_string()),
        "release" => StatementKind::ReleaseSavepoint(savepoint_name(&words)),
        "prepare" if word(1) == "transaction" => StatementKind::PrepareTransaction,
        "set" => classify_set(&sql[3..]),
        "reset" => match (word(1), word(2)) {
            ("role", _) => StatementKind::ResetRole,
            ("session", "authorization") => StatementKind::ResetSessionAuthorization,
            ("all", _) => StatementKind::ResetAll,
            (name, _) if !name.is_empty() => StatementKind::ResetSetting(name.to_string()),
            _ => StatementKind::Other,
        },
        _ => StatementKind::Other,
    }
}

fn classify_set(rest: &str) -> StatementKind {
    let (rest, local) = match strip_keyword(rest, "local") {
        Some(after) => (after, true),
        None => (strip_keyword(rest, "session").unwrap_or(rest), false),
    };

    if let Some(value) = strip_keyword(rest, "role") {
        let role = role_name(value);
        return if role == "none" {
            StatementKind::ResetRole
        } else {
            StatementKind::SetRole(role)
        };
    }
    if let Some(value) = strip_keyword(rest, "authorization") {
        let user = role_name(value);
        return if user == "default" {
            StatementKind::ResetSessionAuthorization
        } else {
            StatementKind::SetSessionAuthorization(user)
        };
    }
    if strip_keyword(rest, "transaction").is_some() || strip_keyword(rest, "constraints").is_some()
    {
        return StatementKind::Other;
    }
    if let Some(value) = strip_keyword(rest, "time")
        .and_then(|after| strip_keyword(after, "zone"))
    {
        return setting("timezone", value, local);
    }

    let rest = rest.trim_start();
    let split = rest
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(rest.len());
    let name = rest[..split].to_ascii_lowercase();
    if name.is_empty() {
        return StatementKind::Other;
    }
    let tail = rest[split..].trim_start();
    let value = match tail.strip_prefix('=') {
        Some(value) => value,
        None => strip_keyword(tail, "to").unwrap_or(tail),
    };
    setting(&name, value, local)
}

fn setting(name: &str, value: &str, local: bool) -> StatementKind {
    let value = value.trim();
    if value.eq_ignore_ascii_case("default") {
        return StatementKind::ResetSetting(name.to_string());
    }
    StatementKind::SetSetting {
        name: name.to_string(),
        value: unquote(value),
        local,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    session_user: String,
    role: Option<String>,
    settings: BTreeMap<String, String>,
    local_settings: BTreeMap<String, String>,
}

/// Mirror of one connection's session state, carried across the files that run on
/// that connection in order. psql variables belong to the current file and are
/// replaced by [`Session::start_file`]. Never shared between connections.
#[derive(Debug, Clone)]
pub struct Session {
    file: String,
    default_role: String,
    session_user: String,
    role: Option<String>,
    settings: BTreeMap<String, String>,
    local_settings: BTreeMap<String, String>,
    state: TransactionState,
    transaction_start: Option<Snapshot>,
    savepoints: Vec<(String, Snapshot)>,
    variables: Variables,
}

impl Session {
    #[must_use]
    pub fn new(
        file: impl Into<String>,
        default_role: impl Into<String>,
        variables: Variables,
    ) -> Self {
        let default_role = default_role.into();
        Self {
            file: file.into(),
            session_user: default_role.clone(),
            default_role,
            role: None,
            settings: BTreeMap::new(),
            local_settings: BTreeMap::new(),
            state: TransactionState::Idle,
            transaction_start: None,
            savepoints: Vec::new(),
            variables,
        }
    }

    /// Move on to the next file on the same connection. Role, settings and
    /// transaction state stay as the engine left them.
    pub fn start_file(&mut self, file: impl Into<String>, variables: Variables) {
        self.file = file.into();
        self.variables = variables;
    }

    #[must_use]
    pub fn file(&self) -> &str {
        &self.file
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Effective role: the `SET ROLE` target, else the session user.
    #[must_use]
    pub fn current_role(&self) -> &str {
        self.role.as_deref().unwrap_or(&self.session_user)
    }

    #[must_use]
    pub fn session_user(&self) -> &str {
        &self.session_user
    }

    /// Settings in effect, `SET LOCAL` overrides applied.
    #[must_use]
    pub fn settings(&self) -> BTreeMap<String, String> {
        let mut merged = self.settings.clone();
        merged.extend(
            self.local_settings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }

    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    #[must_use]
    pub fn context(&self) -> SessionContext {
        SessionContext {
            role: self.current_role().to_string(),
            settings: self.settings(),
            in_transaction: self.state != TransactionState::Idle,
        }
    }

    /// The error the engine would give without being asked, if any.
    #[must_use]
    pub fn gate(&self, kind: &StatementKind) -> Option<EngineError> {
        (self.state == TransactionState::AbortedTransaction && !kind.ends_aborted_transaction())
            .then(|| {
                EngineError::new(ABORTED_TRANSACTION_MESSAGE)
                    .with_code(ABORTED_TRANSACTION_SQLSTATE)
            })
    }

    fn capture(&self) -> Snapshot {
        Snapshot {
            session_user: self.session_user.clone(),
            role: self.role.clone(),
            settings: self.settings.clone(),
            local_settings: self.local_settings.clone(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.session_user = snapshot.session_user;
        self.role = snapshot.role;
        self.settings = snapshot.settings;
        self.local_settings = snapshot.local_settings;
    }

    fn begin(&mut self) {
        self.transaction_start = Some(self.capture());
        self.state = TransactionState::InTransaction;
    }

    fn end_transaction(&mut self, commit: bool) {
        if let Some(start) = self.transaction_start.take() {
            if !commit {
                self.restore(start);
            }
        }
        self.savepoints.clear();
        self.local_settings.clear();
        self.state = TransactionState::Idle;
    }

    /// Record the engine's verdict on a statement of the given kind.
    pub fn observe(&mut self, kind: &StatementKind, succeeded: bool) {
        if !succeeded {
            match (self.state, kind) {
                (TransactionState::InTransaction, StatementKind::Commit { .. }) => {
                    self.end_transaction(false);
                }
                (TransactionState::InTransaction, _) => {
                    self.state = TransactionState::AbortedTransaction;
                }
                _ => {}
            }
            return;
        }

        match kind {
            StatementKind::Begin => {
                if self.state == TransactionState::Idle {
                    self.begin();
                }
            }
            StatementKind::Commit { chain } => {
                let commit = self.state == TransactionState::InTransaction;
                self.end_transaction(commit);
                if *chain {
                    self.begin();
                }
            }
            StatementKind::Rollback { chain } => {
                self.end_transaction(false);
                if *chain {
                    self.begin();
                }
            }
            StatementKind::PrepareTransaction => {
                let commit = self.state == TransactionState::InTransaction;
                self.end_transaction(commit);
            }
            StatementKind::Savepoint(name) => {
                if self.state == TransactionState::InTransaction {
                    self.savepoints.push((name.clone(), self.capture()));
                }
            }
            StatementKind::ReleaseSavepoint(name) => {
                if let Some(pos) = self.savepoints.iter().rposition(|(n, _)| n == name) {
                    self.savepoints.truncate(pos);
                }
            }
            StatementKind::RollbackToSavepoint(name) => {
                if let Some(pos) = self.savepoints.iter().rposition(|(n, _)| n == name) {
                    let snapshot = self.savepoints[pos].1.clone();
                    self.savepoints.truncate(pos + 1);
                    self.restore(snapshot);
                }
                if self.state == TransactionState::AbortedTransaction {
                    self.state = TransactionState::InTransaction;
                }
            }
            StatementKind::SetRole(role) => self.role = Some(role.clone()),
            StatementKind::ResetRole => self.role = None,
            StatementKind::SetSessionAuthorization(user) => {
                self.session_user = user.clone();
                self.role = None;
            }
            StatementKind::ResetSessionAuthorization => {
                self.session_user = self.default_role.clone();
                self.role = None;
            }
            StatementKind::SetSetting { name, value, local } => {
                if *local {
                    if self.state == TransactionState::InTransaction {
                        self.local_settings.insert(name.clone(), value.clone());
                    }
                } else {
                    self.local_settings.remove(name);
                    self.settings.insert(name.clone(), value.clone());
                }
            }
            StatementKind::ResetSetting(name) => {
                self.local_settings.remove(name);
                self.settings.remove(name);
            }
            StatementKind::ResetAll => {
                self.local_settings.clear();
                self.settings.clear();
            }
            StatementKind::Other => {}
        }
    }

    /// Bind `\gset` variables from a single-row result.
    pub fn bind_gset(&mut self, prefix: &str, rows: &EngineRows) -> Result<(), EngineError> {
        match rows.rows.as_slice() {
            [row] => {
                for (column, value) in rows.columns.iter().zip(row) {
                    let name = format!("{prefix}{column}");
                    match value {
                        Some(value) => self.variables.set(name, value.clone()),
                        None => self.variables.unset(&name),
                    }
                }
                Ok(())
            }
            [] => Err(EngineError::new("no rows returned for \\gset")),
            _ => Err(EngineError::new("more than one row returned for \\gset")),
        }
    }
}
