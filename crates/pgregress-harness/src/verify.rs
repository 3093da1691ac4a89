//! Output comparison and verification.

use pgregress_fixture_exec::EngineRows;
use serde::{Deserialize, Serialize};

use crate::adapter::ExecutionOutcome;
use crate::config::ErrorMatchPolicy;
use crate::diff::render_diff;
use crate::fixtures::{Cell, Expectation, RegressionFileStatement};

/// Expected and actual renderings of a failed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub expected: String,
    pub actual: String,
    pub diff: String,
}

impl Mismatch {
    #[must_use]
    pub fn new(expected: String, actual: String) -> Self {
        let diff = render_diff(&expected, &actual);
        Self {
            expected,
            actual,
            diff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail(Mismatch),
    Skip,
}

impl Verdict {
    #[must_use]
    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail(_) => "fail",
            Self::Skip => "skip",
        }
    }
}

/// Verdict for one reported statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementResult {
    pub file: String,
    pub index: usize,
    /// Statement as written in the fixture.
    pub statement: String,
    pub verdict: Verdict,
    /// SQLSTATE of the engine error, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duration_us: u64,
}

impl StatementResult {
    /// Stable identifier `file:index`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.file, self.index)
    }
}

/// Verdict counts over a set of results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl VerdictCounts {
    #[must_use]
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a StatementResult>) -> Self {
        let mut counts = Self::default();
        for result in results {
            counts.total += 1;
            match result.verdict {
                Verdict::Pass => counts.passed += 1,
                Verdict::Fail(_) => counts.failed += 1,
                Verdict::Skip => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn add(&mut self, other: Self) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

fn render_error(message: &str) -> String {
    format!("ERROR: {message}")
}

fn render_expected_rows(rows: &[Vec<Cell>]) -> String {
    let mut lines: Vec<String> = rows
        .iter()
        .map(|row| row.iter().map(Cell::display).collect::<Vec<_>>().join(" | "))
        .collect();
    lines.push(row_count(rows.len()));
    lines.join("\n")
}

fn render_actual_rows(rows: &EngineRows) -> String {
    let mut lines: Vec<String> = rows
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| cell.as_deref().unwrap_or("NULL"))
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .collect();
    lines.push(row_count(rows.rows.len()));
    lines.join("\n")
}

fn render_outcome(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Rows(rows) => render_actual_rows(rows),
        ExecutionOutcome::Error(err) => render_error(&err.message),
    }
}

fn row_count(n: usize) -> String {
    if n == 1 {
        "(1 row)".to_string()
    } else {
        format!("({n} rows)")
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text.trim() {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn floats_equal(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

/// Compare one expected cell against the engine's text for it.
fn cell_matches(expected: &Cell, actual: Option<&str>, exact: bool) -> bool {
    let Some(actual) = actual else {
        return matches!(expected, Cell::Null) || matches!(expected, Cell::Text(s) if s.is_empty());
    };
    match expected {
        Cell::Null => false,
        Cell::Text(s) | Cell::Rendered(s) => s == actual,
        _ if exact => expected.display() == actual,
        Cell::Int(i) => match actual.trim().parse::<i64>() {
            Ok(v) => v == *i,
            Err(_) => parse_float(actual).is_some_and(|v| floats_equal(v, *i as f64)),
        },
        Cell::Float(f) => parse_float(actual).is_some_and(|v| floats_equal(v, *f)),
        Cell::Bool(b) => match actual.trim() {
            "t" | "true" => *b,
            "f" | "false" => !*b,
            _ => false,
        },
        Cell::Bytes(_) => expected.display().eq_ignore_ascii_case(actual.trim()),
    }
}

fn row_matches(want: &[Cell], got: &[Option<String>], exact: bool) -> bool {
    want.len() == got.len()
        && want
            .iter()
            .zip(got)
            .all(|(cell, value)| cell_matches(cell, value.as_deref(), exact))
}

fn rows_match(expected: &[Vec<Cell>], actual: &EngineRows, exact: bool) -> bool {
    expected.len() == actual.rows.len()
        && expected
            .iter()
            .zip(&actual.rows)
            .all(|(want, got)| row_matches(want, got, exact))
}

/// Try to give expected row `row` an actual row, displacing earlier claims when they
/// can move elsewhere.
fn claim(
    row: usize,
    candidates: &[Vec<usize>],
    owner: &mut [Option<usize>],
    seen: &mut [bool],
) -> bool {
    for &slot in &candidates[row] {
        if seen[slot] {
            continue;
        }
        seen[slot] = true;
        if owner[slot].is_none_or(|other| claim(other, candidates, owner, seen)) {
            owner[slot] = Some(row);
            return true;
        }
    }
    false
}

/// Multiset comparison: every expected row pairs with a distinct actual row.
fn rows_match_unordered(expected: &[Vec<Cell>], actual: &EngineRows, exact: bool) -> bool {
    if expected.len() != actual.rows.len() {
        return false;
    }
    let candidates: Vec<Vec<usize>> = expected
        .iter()
        .map(|want| {
            (0..actual.rows.len())
                .filter(|&slot| row_matches(want, &actual.rows[slot], exact))
                .collect()
        })
        .collect();
    let mut owner = vec![None; actual.rows.len()];
    (0..expected.len()).all(|row| {
        let mut seen = vec![false; actual.rows.len()];
        claim(row, &candidates, &mut owner, &mut seen)
    })
}

/// Compare an engine outcome with a statement's expectation.
#[must_use]
pub fn verify(
    outcome: &ExecutionOutcome,
    statement: &RegressionFileStatement,
    policy: ErrorMatchPolicy,
) -> Verdict {
    if statement.skip {
        return Verdict::Skip;
    }
    match (statement.expectation(), outcome) {
        (Expectation::Unchecked, _) => Verdict::Pass,
        (Expectation::Error(want), ExecutionOutcome::Error(err))
            if policy.matches(want, &err.message) =>
        {
            Verdict::Pass
        }
        (Expectation::Error(want), _) => {
            Verdict::Fail(Mismatch::new(render_error(want), render_outcome(outcome)))
        }
        (Expectation::Rows(want), ExecutionOutcome::Rows(got))
            if statement.unordered
                && rows_match_unordered(want, got, statement.disable_normalization) =>
        {
            Verdict::Pass
        }
        (Expectation::Rows(want), ExecutionOutcome::Rows(got))
            if !statement.unordered && rows_match(want, got, statement.disable_normalization) =>
        {
            Verdict::Pass
        }
        (Expectation::Rows(want), _) => {
            Verdict::Fail(Mismatch::new(render_expected_rows(want), render_outcome(outcome)))
        }
    }
}

/// Fail a statement the harness could not hand to the engine at all.
#[must_use]
pub fn unsupported(statement: &RegressionFileStatement, reason: &str) -> Verdict {
    let expected = match statement.expectation() {
        Expectation::Rows(rows) => render_expected_rows(rows),
        Expectation::Error(want) => render_error(want),
        Expectation::Unchecked => return Verdict::Pass,
    };
    Verdict::Fail(Mismatch::new(expected, format!("[{reason}]")))
}

#[cfg(test)]
mod tests {
    use pgregress_fixture_exec::EngineError;

    use super::*;

    fn rows(values: &[&[Option<&str>]]) -> ExecutionOutcome {
        let width = values.first().map_or(0, |r| r.len());
        ExecutionOutcome::Rows(EngineRows::new(
            (0..width).map(|i| format!("c{i}")).collect(),
            values
                .iter()
                .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        ))
    }

    fn error(message: &str) -> ExecutionOutcome {
        ExecutionOutcome::Error(EngineError::new(message))
    }

    #[test]
    fn error_expectation_uses_policy() {
        let stmt = RegressionFileStatement::error(
            "INSERT INTO basictest values ('88', 'haha', 'short text', '123.12');",
            "value too long for type character varying(5)",
        );
        let outcome = error("ERROR: value too long for type character varying(5)");
        assert_eq!(verify(&outcome, &stmt, ErrorMatchPolicy::Contains), Verdict::Pass);
        assert!(verify(&outcome, &stmt, ErrorMatchPolicy::Exact).is_fail());
        assert!(verify(&rows(&[]), &stmt, ErrorMatchPolicy::Contains).is_fail());
    }

    #[test]
    fn rows_compare_by_position_with_type_aware_cells() {
        let stmt = RegressionFileStatement::rows(
            "select * from basictest;",
            vec![
                vec![88.into(), "haha".into(), "short".into(), 123.12.into()],
                vec![88.into(), "haha".into(), "".into(), Cell::Float(f64::NAN)],
            ],
        );
        let outcome = rows(&[
            &[Some("88"), Some("haha"), Some("short"), Some("123.12")],
            &[Some("88.0"), Some("haha"), None, Some("NaN")],
        ]);
        assert_eq!(verify(&outcome, &stmt, ErrorMatchPolicy::Contains), Verdict::Pass);

        let reordered = rows(&[
            &[Some("88"), Some("haha"), None, Some("NaN")],
            &[Some("88"), Some("haha"), Some("short"), Some("123.12")],
        ]);
        let Verdict::Fail(mismatch) = verify(&reordered, &stmt, ErrorMatchPolicy::Contains) else {
            panic!("row order must matter");
        };
        assert!(mismatch.diff.contains("@@ line 1 @@"));
        assert!(mismatch.expected.ends_with("(2 rows)"));
    }

    #[test]
    fn unordered_rows_match_as_a_multiset() {
        let stmt = RegressionFileStatement::rows(
            "select relname, relkind from pg_class where relname like 'onek%';",
            vec![
                vec!["onek".into(), "r".into()],
                vec!["onek_unique1".into(), "i".into()],
                vec!["onek".into(), "r".into()],
            ],
        )
        .unordered();
        let shuffled = rows(&[
            &[Some("onek_unique1"), Some("i")],
            &[Some("onek"), Some("r")],
            &[Some("onek"), Some("r")],
        ]);
        assert_eq!(verify(&shuffled, &stmt, ErrorMatchPolicy::Contains), Verdict::Pass);

        let duplicate_swapped = rows(&[
            &[Some("onek_unique1"), Some("i")],
            &[Some("onek_unique1"), Some("i")],
            &[Some("onek"), Some("r")],
        ]);
        assert!(verify(&duplicate_swapped, &stmt, ErrorMatchPolicy::Contains).is_fail());

        let mut ordered = stmt.clone();
        ordered.unordered = false;
        assert!(verify(&shuffled, &ordered, ErrorMatchPolicy::Contains).is_fail());
    }

    #[test]
    fn unordered_matching_reassigns_loose_cells() {
        // Text "1" only fits the second actual row, so the integer 1 must give it up.
        let stmt = RegressionFileStatement::rows(
            "select v from (values ('1.0'), ('1')) t(v)",
            vec![vec![1.into()], vec!["1".into()]],
        )
        .unordered();
        let outcome = rows(&[&[Some("1")], &[Some("1.0")]]);
        assert_eq!(verify(&outcome, &stmt, ErrorMatchPolicy::Contains), Verdict::Pass);
    }

    #[test]
    fn zero_rows_is_a_real_expectation() {
        let stmt = RegressionFileStatement::rows("select 1 where false", vec![]);
        assert_eq!(verify(&rows(&[]), &stmt, ErrorMatchPolicy::Contains), Verdict::Pass);
        assert!(verify(&rows(&[&[Some("1")]]), &stmt, ErrorMatchPolicy::Contains).is_fail());
        assert!(verify(&error("boom"), &stmt, ErrorMatchPolicy::Contains).is_fail());
    }

    #[test]
    fn booleans_bytes_and_rendered_cells() {
        let stmt = RegressionFileStatement::rows(
            "select true, '\\xDEAD'::bytea, '(1,2)'::point",
            vec![vec![
                true.into(),
                Cell::Bytes(vec![0xde, 0xad]),
                Cell::Rendered("(1,2)".into()),
            ]],
        );
        let outcome = rows(&[&[Some("t"), Some("\\xdead"), Some("(1,2)")]]);
        assert_eq!(verify(&outcome, &stmt, ErrorMatchPolicy::Contains), Verdict::Pass);
        let spaced = rows(&[&[Some("t"), Some("\\xdead"), Some("(1, 2)")]]);
        assert!(verify(&spaced, &stmt, ErrorMatchPolicy::Contains).is_fail());
    }

    #[test]
    fn disabled_normalization_compares_text() {
        let stmt =
            RegressionFileStatement::rows("select 1.0::numeric", vec![vec![1.into()]])
                .without_normalization();
        assert!(verify(&rows(&[&[Some("1.0")]]), &stmt, ErrorMatchPolicy::Contains).is_fail());
        assert_eq!(
            verify(&rows(&[&[Some("1")]]), &stmt, ErrorMatchPolicy::Contains),
            Verdict::Pass
        );
    }

    #[test]
    fn side_effect_only_and_skipped() {
        let stmt = RegressionFileStatement::exec("create domain d int4");
        assert_eq!(verify(&error("boom"), &stmt, ErrorMatchPolicy::Exact), Verdict::Pass);
        let skipped = RegressionFileStatement::rows("select 1", vec![]).skipped();
        assert_eq!(verify(&error("boom"), &skipped, ErrorMatchPolicy::Exact), Verdict::Skip);
    }

    #[test]
    fn unsupported_meta_fails_only_with_expectation() {
        assert_eq!(
            unsupported(&RegressionFileStatement::exec("\\d t"), "meta-command \\d"),
            Verdict::Pass
        );
        let Verdict::Fail(m) = unsupported(
            &RegressionFileStatement::rows("\\d t", vec![vec!["x".into()]]),
            "meta-command \\d",
        ) else {
            panic!("expected failure");
        };
        assert_eq!(m.actual, "[meta-command \\d]");
    }

    #[test]
    fn verdict_serializes_with_tag() {
        let json = serde_json::to_string(&Verdict::Pass).unwrap();
        assert_eq!(json, r#"{"verdict":"pass"}"#);
        let fail = Verdict::Fail(Mismatch::new("a".into(), "b".into()));
        let back: Verdict = serde_json::from_str(&serde_json::to_string(&fail).unwrap()).unwrap();
        assert_eq!(back, fail);
    }
}
