//! Regression file fixtures.
//!
//! A regression file is an ordered list of statements, each optionally paired with
//! the rows or the error text it must produce. Files are immutable once registered.

use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FixtureError;

/// One expected cell.
///
/// Fixtures store values the way the engine renders them, so most cells are text.
/// An empty string is the fixture encoding of NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    /// Exact engine output, compared byte for byte.
    Rendered(String),
}

impl Cell {
    /// Parse the JSON fixture encoding of a cell.
    pub fn from_json(value: serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => n
                    .as_f64()
                    .map(Self::Float)
                    .ok_or_else(|| format!("unrepresentable number {n}")),
            },
            Value::String(s) => Ok(Self::Text(s)),
            Value::Object(map) if map.len() == 1 => {
                let (key, inner) = map.into_iter().next().ok_or("empty cell object")?;
                let text = inner
                    .as_str()
                    .ok_or_else(|| format!("`{key}` cell must hold a string"))?
                    .to_string();
                match key.as_str() {
                    "bytes" => decode_hex(&text).map(Self::Bytes),
                    "rendered" => Ok(Self::Rendered(text)),
                    other => Err(format!("unknown cell tag `{other}`")),
                }
            }
            other => Err(format!("unsupported cell value {other}")),
        }
    }

    /// Display form used in reports and diffs.
    #[must_use]
    pub fn display(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Bool(true) => "t".to_string(),
            Self::Bool(false) => "f".to_string(),
            Self::Text(s) if s.is_empty() => "NULL".to_string(),
            Self::Text(s) | Self::Rendered(s) => s.clone(),
            Self::Bytes(b) => format!("\\x{}", hex_lower(b)),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Bytes(b) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("bytes", &hex_lower(b))?;
                map.end()
            }
            Self::Rendered(s) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("rendered", s)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Cell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(value).map_err(D::Error::custom)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Cell {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Renders floats the way PostgreSQL prints float8.
#[must_use]
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        let spelled = if f > 0.0 { "Infinity" } else { "-Infinity" };
        spelled.to_string()
    } else {
        f.to_string()
    }
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits = text.strip_prefix("\\x").unwrap_or(text);
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(format!("malformed hex `{text}`"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|err| format!("hex `{text}`: {err}"))
        })
        .collect()
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn default_enabled() -> bool {
    true
}

/// What a statement is checked against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expectation<'a> {
    Rows(&'a [Vec<Cell>]),
    Error(&'a str),
    /// Run for side effects only.
    Unchecked,
}

/// One statement of a regression file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionFileStatement {
    /// Literal statement text, possibly with psql meta-commands and comments.
    pub statement: String,
    /// Expected rows. `Some(vec![])` expects zero rows; `None` expects nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Vec<Cell>>>,
    /// Expected error text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_string: String,
    /// Reported as skipped and never sent to the engine.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip: bool,
    /// Compare cells by exact rendered text.
    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_normalization: bool,
    /// Accept the expected rows in any order.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unordered: bool,
}

impl RegressionFileStatement {
    /// A statement run for side effects only.
    #[must_use]
    pub fn exec(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn rows(statement: impl Into<String>, results: Vec<Vec<Cell>>) -> Self {
        Self {
            statement: statement.into(),
            results: Some(results),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn error(statement: impl Into<String>, error_string: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            error_string: error_string.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    #[must_use]
    pub fn without_normalization(mut self) -> Self {
        self.disable_normalization = true;
        self
    }

    #[must_use]
    pub fn unordered(mut self) -> Self {
        self.unordered = true;
        self
    }

    /// Both a non-empty result set and an error string.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        !self.error_string.is_empty() && self.results.as_ref().is_some_and(|r| !r.is_empty())
    }

    #[must_use]
    pub fn expectation(&self) -> Expectation<'_> {
        if !self.error_string.is_empty() {
            Expectation::Error(&self.error_string)
        } else if let Some(rows) = &self.results {
            Expectation::Rows(rows)
        } else {
            Expectation::Unchecked
        }
    }
}

/// A named regression file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionFile {
    pub name: String,
    /// Files that must run first on the same connection. Their results are not reported.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Disabled files are reported as skipped when requested, but still run as dependencies.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// May be empty for files that only tie dependencies together.
    #[serde(default)]
    pub statements: Vec<RegressionFileStatement>,
}

impl RegressionFile {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            enabled: true,
            tags: Vec::new(),
            statements: Vec::new(),
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    #[must_use]
    pub fn statement(mut self, statement: RegressionFileStatement) -> Self {
        self.statements.push(statement);
        self
    }

    /// Reject files that can never run correctly.
    pub fn validate(&self) -> Result<(), FixtureError> {
        if self.name.trim().is_empty() {
            return Err(FixtureError::EmptyName);
        }
        if let Some(index) = self.statements.iter().position(|s| s.is_malformed()) {
            return Err(FixtureError::MalformedStatement {
                file: self.name.clone(),
                index,
            });
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON form, for report provenance.
    #[must_use]
    pub fn digest(&self) -> String {
        use sha2::Digest;
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex_lower(&sha2::Sha256::digest(&canonical))
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// On-disk fixture document: one file or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FixtureDocument {
    Many(Vec<RegressionFile>),
    One(Box<RegressionFile>),
}

impl FixtureDocument {
    /// Load a fixture document from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Vec<RegressionFile>, FixtureError> {
        let invalid = |message: String| FixtureError::InvalidFixture {
            path: path.display().to_string(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
        let doc: Self = serde_json::from_str(&content).map_err(|err| invalid(err.to_string()))?;
        Ok(match doc {
            Self::Many(files) => files,
            Self::One(file) => vec![*file],
        })
    }
}
