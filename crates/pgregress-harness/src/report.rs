//! Report generation for regression runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ErrorMatchPolicy;
use crate::error::{HarnessError, InfrastructureError};
use crate::fixtures::hex_lower;
use crate::verify::{StatementResult, Verdict, VerdictCounts};

/// Results of one requested regression file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub name: String,
    /// SHA-256 of the fixture as registered.
    pub fixture_digest: String,
    /// Set when the file was requested but not run (disabled or filtered out).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    pub results: Vec<StatementResult>,
}

impl FileReport {
    #[must_use]
    pub fn counts(&self) -> VerdictCounts {
        VerdictCounts::from_results(&self.results)
    }
}

/// Statement ids by verdict, `file:index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub pass_ids: Vec<String>,
    pub skip_ids: Vec<String>,
    pub fail_ids: Vec<String>,
}

/// A regression run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub title: String,
    pub run_id: String,
    /// Timestamp (UTC).
    pub timestamp: String,
    pub error_match: ErrorMatchPolicy,
    /// Requested files in request order.
    pub files: Vec<FileReport>,
    /// Set when the run was cut short by the engine or its adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_failure: Option<InfrastructureError>,
}

impl RunReport {
    #[must_use]
    pub fn totals(&self) -> VerdictCounts {
        let mut totals = VerdictCounts::default();
        for file in &self.files {
            totals.add(file.counts());
        }
        totals
    }

    /// No failed statement and no infrastructure failure.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.infrastructure_failure.is_none() && self.totals().failed == 0
    }

    /// Turn an aborted run into an error.
    pub fn ensure_complete(&self) -> Result<(), HarnessError> {
        match &self.infrastructure_failure {
            Some(err) => Err(HarnessError::Infrastructure(err.clone())),
            None => Ok(()),
        }
    }

    pub fn results(&self) -> impl Iterator<Item = &StatementResult> {
        self.files.iter().flat_map(|f| f.results.iter())
    }

    #[must_use]
    pub fn tracker(&self) -> Tracker {
        let mut tracker = Tracker::default();
        for result in self.results() {
            let ids = match result.verdict {
                Verdict::Pass => &mut tracker.pass_ids,
                Verdict::Skip => &mut tracker.skip_ids,
                Verdict::Fail(_) => &mut tracker.fail_ids,
            };
            ids.push(result.id());
        }
        tracker
    }

    /// SHA-256 over every reported verdict, independent of timing.
    ///
    /// Two runs of the same plan against equivalent engines have equal digests.
    #[must_use]
    pub fn verdict_digest(&self) -> String {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        for file in &self.files {
            hasher.update(file.name.as_bytes());
            hasher.update(b"\0");
            if let Some(reason) = &file.skipped_reason {
                hasher.update(reason.as_bytes());
            }
            for result in &file.results {
                let verdict = serde_json::to_string(&result.verdict).unwrap_or_default();
                hasher.update(format!("{}\t{}\n", result.index, verdict).as_bytes());
            }
        }
        if let Some(err) = &self.infrastructure_failure {
            hasher.update(err.to_string().as_bytes());
        }
        hex_lower(&hasher.finalize())
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let totals = self.totals();
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Run: {}\n", self.run_id));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!("- Error match: {}\n", self.error_match.as_str()));
        out.push_str(&format!("- Total: {}\n", totals.total));
        out.push_str(&format!("- Passed: {}\n", totals.passed));
        out.push_str(&format!("- Failed: {}\n", totals.failed));
        out.push_str(&format!("- Skipped: {}\n\n", totals.skipped));

        if let Some(err) = &self.infrastructure_failure {
            out.push_str("## Infrastructure failure\n\n");
            out.push_str(&format!("Run aborted: {err}\n\n"));
        }

        for file in &self.files {
            let counts = file.counts();
            out.push_str(&format!("## {}\n\n", file.name));
            if let Some(reason) = &file.skipped_reason {
                out.push_str(&format!("Skipped: {reason}\n\n"));
                continue;
            }
            out.push_str(&format!(
                "{} passed, {} failed, {} skipped\n\n",
                counts.passed, counts.failed, counts.skipped
            ));
            out.push_str("| # | Statement | Status |\n");
            out.push_str("|---|-----------|--------|\n");
            for r in &file.results {
                let status = match r.verdict {
                    Verdict::Pass => "PASS",
                    Verdict::Fail(_) => "FAIL",
                    Verdict::Skip => "SKIP",
                };
                out.push_str(&format!(
                    "| {} | `{}` | {} |\n",
                    r.index,
                    first_line(&r.statement),
                    status
                ));
            }
            out.push('\n');

            for r in &file.results {
                if let Verdict::Fail(mismatch) = &r.verdict {
                    out.push_str(&format!("### {} statement {}\n\n", file.name, r.index));
                    out.push_str(&format!("```sql\n{}\n```\n\n", r.statement));
                    out.push_str(&format!("```diff\n{}```\n\n", ensure_newline(&mismatch.diff)));
                }
            }
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Statements whose pass/fail verdict changed between `base` and `head`.
    ///
    /// Statements are paired by file, index and text; an edited statement is a
    /// different statement.
    #[must_use]
    pub fn compare(base: &Self, head: &Self) -> ReportComparison {
        let before: HashMap<(&str, usize, &str), &Verdict> = base
            .results()
            .map(|r| ((r.file.as_str(), r.index, r.statement.as_str()), &r.verdict))
            .collect();
        let mut comparison = ReportComparison {
            base: base.totals(),
            head: head.totals(),
            regressions: Vec::new(),
            progressions: Vec::new(),
        };
        for result in head.results() {
            let key = (result.file.as_str(), result.index, result.statement.as_str());
            let Some(old) = before.get(&key) else {
                continue;
            };
            match (old, &result.verdict) {
                (Verdict::Pass, Verdict::Fail(mismatch)) => {
                    comparison
                        .regressions
                        .push(ChangedStatement::new(result, Some(mismatch.diff.clone())));
                }
                (Verdict::Fail(_), Verdict::Pass) => {
                    comparison.progressions.push(ChangedStatement::new(result, None));
                }
                _ => {}
            }
        }
        comparison
    }
}

/// A statement whose verdict flipped between two runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedStatement {
    pub file: String,
    pub index: usize,
    pub statement: String,
    /// Diff of the failing side, for regressions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl ChangedStatement {
    fn new(result: &StatementResult, diff: Option<String>) -> Self {
        Self {
            file: result.file.clone(),
            index: result.index,
            statement: result.statement.clone(),
            diff,
        }
    }
}

/// Verdict changes from a base run to a head run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportComparison {
    pub base: VerdictCounts,
    pub head: VerdictCounts,
    /// Passed in base, failed in head.
    pub regressions: Vec<ChangedStatement>,
    /// Failed in base, passed in head.
    pub progressions: Vec<ChangedStatement>,
}

impl ReportComparison {
    #[must_use]
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let (base, head) = (self.base, self.head);
        let mut out = String::new();
        out.push_str("|   | Base | Head |\n");
        out.push_str("| --- | --- | --- |\n");
        out.push_str(&format!("| Total | {} | {} |\n", base.total, head.total));
        out.push_str(&format!("| Passed | {} | {} |\n", base.passed, head.passed));
        out.push_str(&format!("| Failed | {} | {} |\n", base.failed, head.failed));
        out.push_str(&format!("| Skipped | {} | {} |\n", base.skipped, head.skipped));
        out.push_str(&format!(
            "| Pass rate | {:.4}% | {:.4}% |\n",
            pass_rate(base),
            pass_rate(head)
        ));

        if !self.regressions.is_empty() {
            out.push_str("\n## Regressions\n");
            push_changes(&mut out, &self.regressions);
        }
        if !self.progressions.is_empty() {
            out.push_str("\n## Progressions\n");
            push_changes(&mut out, &self.progressions);
        }
        out
    }
}

fn pass_rate(counts: VerdictCounts) -> f64 {
    if counts.total == 0 {
        return 0.0;
    }
    counts.passed as f64 * 100.0 / counts.total as f64
}

fn push_changes(out: &mut String, changes: &[ChangedStatement]) {
    let mut current: Option<&str> = None;
    for change in changes {
        if current != Some(change.file.as_str()) {
            out.push_str(&format!("### {}\n", change.file));
            current = Some(change.file.as_str());
        }
        out.push_str(&format!("```\nSTATEMENT {}: {}\n", change.index, change.statement));
        if let Some(diff) = &change.diff {
            out.push_str(&ensure_newline(diff));
        }
        out.push_str("```\n");
    }
}

fn first_line(statement: &str) -> String {
    let line = statement.lines().next().unwrap_or_default().replace('|', "\\|");
    if statement.lines().nth(1).is_some() {
        format!("{line} ...")
    } else {
        line
    }
}

fn ensure_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InfrastructureKind;
    use crate::verify::Mismatch;

    fn result(file: &str, index: usize, verdict: Verdict, duration_us: u64) -> StatementResult {
        StatementResult {
            file: file.into(),
            index,
            statement: format!("select {index};"),
            verdict,
            error_code: None,
            duration_us,
        }
    }

    fn report(duration_us: u64) -> RunReport {
        RunReport {
            title: "Regression".into(),
            run_id: "run-1".into(),
            timestamp: "2026-01-01T00:00:00.000Z".into(),
            error_match: ErrorMatchPolicy::Contains,
            files: vec![
                FileReport {
                    name: "domain".into(),
                    fixture_digest: "00".into(),
                    skipped_reason: None,
                    results: vec![
                        result("domain", 0, Verdict::Pass, duration_us),
                        result(
                            "domain",
                            1,
                            Verdict::Fail(Mismatch::new("(1 row)".into(), "(0 rows)".into())),
                            duration_us,
                        ),
                        result("domain", 2, Verdict::Skip, duration_us),
                    ],
                },
                FileReport {
                    name: "copy2".into(),
                    fixture_digest: "01".into(),
                    skipped_reason: Some("disabled".into()),
                    results: Vec::new(),
                },
            ],
            infrastructure_failure: None,
        }
    }

    #[test]
    fn totals_and_tracker() {
        let report = report(10);
        let totals = report.totals();
        assert_eq!((totals.total, totals.passed, totals.failed, totals.skipped), (3, 1, 1, 1));
        assert!(!report.all_passed());
        let tracker = report.tracker();
        assert_eq!(tracker.pass_ids, vec!["domain:0"]);
        assert_eq!(tracker.fail_ids, vec!["domain:1"]);
        assert_eq!(tracker.skip_ids, vec!["domain:2"]);
    }

    #[test]
    fn digest_ignores_timing() {
        assert_eq!(report(10).verdict_digest(), report(99_999).verdict_digest());
        let mut changed = report(10);
        changed.files[0].results[0].verdict = Verdict::Skip;
        assert_ne!(report(10).verdict_digest(), changed.verdict_digest());
    }

    #[test]
    fn markdown_lists_failures_with_diff() {
        let md = report(1).to_markdown();
        assert!(md.contains("# Regression"));
        assert!(md.contains("- Failed: 1"));
        assert!(md.contains("| 1 | `select 1;` | FAIL |"));
        assert!(md.contains("```diff\n--- expected"));
        assert!(md.contains("Skipped: disabled"));
    }

    #[test]
    fn compare_lists_regressions_and_progressions() {
        let base = report(1);
        let mut head = report(2);
        head.files[0].results[0].verdict =
            Verdict::Fail(Mismatch::new("(1 row)".into(), "ERROR: boom".into()));
        head.files[0].results[1].verdict = Verdict::Pass;
        head.files[0].results[2].verdict = Verdict::Pass;
        head.files[0].results.push(result("domain", 3, Verdict::Pass, 2));

        let comparison = RunReport::compare(&base, &head);
        assert!(comparison.has_regressions());
        assert_eq!(comparison.regressions.len(), 1);
        assert_eq!(comparison.regressions[0].index, 0);
        assert!(comparison.regressions[0].diff.as_deref().unwrap().contains("ERROR: boom"));
        assert_eq!(comparison.progressions.len(), 1);
        assert_eq!(comparison.progressions[0].index, 1);
        assert_eq!((comparison.base.total, comparison.head.total), (3, 4));

        let md = comparison.to_markdown();
        assert!(md.contains("| Passed | 1 | 3 |"));
        assert!(md.contains("## Regressions\n### domain\n```\nSTATEMENT 0: select 0;"));
        assert!(md.contains("## Progressions\n### domain\n```\nSTATEMENT 1: select 1;"));

        let mut edited = report(2);
        edited.files[0].results[0].statement = "select 10;".into();
        edited.files[0].results[0].verdict = Verdict::Skip;
        assert!(!RunReport::compare(&base, &edited).has_regressions());
        assert!(RunReport::compare(&base, &base).regressions.is_empty());
    }

    #[test]
    fn infrastructure_failure_is_reported_apart() {
        let mut report = report(1);
        report.files[0].results.truncate(1);
        assert!(report.all_passed());
        report.infrastructure_failure = Some(InfrastructureError {
            file: "domain".into(),
            statement_index: Some(1),
            kind: InfrastructureKind::Timeout("no answer".into()),
        });
        assert!(!report.all_passed());
        assert!(report.ensure_complete().unwrap_err().is_infrastructure());
        assert!(report.to_markdown().contains("## Infrastructure failure"));
        let back = RunReport::from_json(&report.to_json()).unwrap();
        assert_eq!(back, report);
    }
}
