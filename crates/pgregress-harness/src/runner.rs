//! Test execution engine.
//!
//! Plans the requested files, validates every statement up front, then runs each
//! independent group on its own connection. Within a group, files and statements run
//! strictly in order; statement N+1 is sent only after statement N is verified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use pgregress_fixture_exec::{EngineFactory, EngineRows};
use rayon::prelude::*;

use crate::adapter::{EngineAdapter, ExecutionOutcome};
use crate::config::HarnessConfig;
use crate::error::{FixtureError, HarnessError, InfrastructureError};
use crate::fixtures::RegressionFile;
use crate::normalize::{Normalized, normalize};
use crate::registry::FixtureRegistry;
use crate::report::{FileReport, RunReport};
use crate::scheduler::{RunGroup, plan_many};
use crate::session::{Session, TransactionState};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, RunLog, now_utc};
use crate::verify::{self, StatementResult, Verdict, VerdictCounts};

/// Receives results as they are produced. Called from worker threads.
pub trait TestHandle: Sync {
    fn file_started(&self, _file: &str) {}
    fn statement_finished(&self, _result: &StatementResult) {}
    fn file_finished(&self, _report: &FileReport) {}
    fn infrastructure_failure(&self, _error: &InfrastructureError) {}
}

/// Handle that records everything it is told.
#[derive(Debug, Default)]
pub struct CollectingHandle {
    started: Mutex<Vec<String>>,
    results: Mutex<Vec<StatementResult>>,
    finished: Mutex<Vec<String>>,
    failures: Mutex<Vec<InfrastructureError>>,
}

impl CollectingHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn started_files(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    #[must_use]
    pub fn finished_files(&self) -> Vec<String> {
        self.finished.lock().clone()
    }

    #[must_use]
    pub fn results(&self) -> Vec<StatementResult> {
        self.results.lock().clone()
    }

    #[must_use]
    pub fn infrastructure_failures(&self) -> Vec<InfrastructureError> {
        self.failures.lock().clone()
    }
}

impl TestHandle for CollectingHandle {
    fn file_started(&self, file: &str) {
        self.started.lock().push(file.to_string());
    }

    fn statement_finished(&self, result: &StatementResult) {
        self.results.lock().push(result.clone());
    }

    fn file_finished(&self, report: &FileReport) {
        self.finished.lock().push(report.name.clone());
    }

    fn infrastructure_failure(&self, error: &InfrastructureError) {
        self.failures.lock().push(error.clone());
    }
}

/// One file execution; `stop` ends the group.
struct FileRun {
    report: FileReport,
    stop: Option<HarnessError>,
}

#[derive(Default)]
struct GroupRun {
    reports: Vec<FileReport>,
    stop: Option<HarnessError>,
}

fn micros(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn log_outcome(verdict: &Verdict) -> Outcome {
    match verdict {
        Verdict::Pass => Outcome::Pass,
        Verdict::Fail(_) => Outcome::Fail,
        Verdict::Skip => Outcome::Skip,
    }
}

/// Runs regression files from a registry against an engine.
pub struct TestRunner<'a> {
    registry: &'a FixtureRegistry,
    factory: &'a dyn EngineFactory,
    config: HarnessConfig,
    log: RunLog,
    title: String,
    run_id: String,
}

impl<'a> TestRunner<'a> {
    #[must_use]
    pub fn new(
        registry: &'a FixtureRegistry,
        factory: &'a dyn EngineFactory,
        config: HarnessConfig,
    ) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Self {
            registry,
            factory,
            config,
            log: RunLog::disabled(),
            title: "Regression report".to_string(),
            run_id: format!("run-{}-{nanos:09}", std::process::id()),
        }
    }

    /// Write structured logs to `emitter`; the run takes the emitter's run id.
    #[must_use]
    pub fn with_log(mut self, emitter: LogEmitter) -> Self {
        self.run_id = emitter.run_id().to_string();
        self.log = RunLog::new(emitter);
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run one file and its dependencies. True when every reported statement
    /// passed or was skipped.
    pub fn run_tests(&self, handle: &dyn TestHandle, name: &str) -> bool {
        match self.run(handle, &[name]) {
            Ok(report) => report.all_passed(),
            Err(err) => {
                self.log.emit(
                    LogEntry::new("", LogLevel::Error, "run_failed")
                        .with_file(name)
                        .with_details(serde_json::json!({ "error": err.to_string() })),
                );
                false
            }
        }
    }

    /// Run the requested files and build a report.
    ///
    /// Fixture errors fail the whole run before any statement is sent. An
    /// infrastructure failure stops every group and is recorded on the report.
    pub fn run<S: AsRef<str>>(
        &self,
        handle: &dyn TestHandle,
        names: &[S],
    ) -> Result<RunReport, HarnessError> {
        self.log.emit(
            LogEntry::new("", LogLevel::Info, "run_start").with_details(serde_json::json!({
                "requested": names.iter().map(|n| n.as_ref()).collect::<Vec<&str>>(),
                "error_match": self.config.error_match.as_str(),
                "parallel": self.config.parallel,
            })),
        );

        let mut requested: Vec<String> = Vec::new();
        let mut skipped: HashMap<String, String> = HashMap::new();
        let mut runnable: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref();
            if requested.iter().any(|n| n == name) {
                continue;
            }
            let file = self
                .registry
                .lookup(name)
                .ok_or_else(|| FixtureError::UnknownFile(name.to_string()))?;
            requested.push(name.to_string());
            if !file.enabled {
                skipped.insert(name.to_string(), "disabled".to_string());
            } else if !self.config.filter.admits(&file) {
                skipped.insert(name.to_string(), "excluded by filter".to_string());
            } else {
                runnable.push(name.to_string());
            }
        }

        let plan = plan_many(self.registry, &runnable)?;
        for group in &plan.groups {
            for planned in &group.files {
                if let Some(file) = self.registry.lookup(&planned.name) {
                    self.preflight(&file)?;
                }
            }
        }
        self.log.emit(
            LogEntry::new("", LogLevel::Debug, "plan_ready").with_details(serde_json::json!({
                "groups": plan
                    .groups
                    .iter()
                    .map(|g| g.names().collect::<Vec<_>>())
                    .collect::<Vec<_>>(),
            })),
        );

        let cancel = AtomicBool::new(false);
        let runs: Vec<GroupRun> = if self.config.parallel {
            plan.groups
                .par_iter()
                .map(|group| self.run_group(group, handle, &cancel))
                .collect()
        } else {
            plan.groups
                .iter()
                .map(|group| self.run_group(group, handle, &cancel))
                .collect()
        };

        let mut by_name: HashMap<String, FileReport> = HashMap::new();
        let mut infrastructure_failure = None;
        for run in runs {
            for report in run.reports {
                by_name.insert(report.name.clone(), report);
            }
            match run.stop {
                Some(HarnessError::Infrastructure(err)) => {
                    infrastructure_failure.get_or_insert(err);
                }
                Some(other) => return Err(other),
                None => {}
            }
        }

        let mut files = Vec::with_capacity(requested.len());
        for name in &requested {
            let fixture_digest = self
                .registry
                .lookup(name)
                .map(|f| f.digest())
                .unwrap_or_default();
            let report = match (by_name.remove(name), skipped.remove(name)) {
                (Some(report), _) => report,
                (None, reason) => FileReport {
                    name: name.clone(),
                    fixture_digest,
                    skipped_reason: Some(
                        reason.unwrap_or_else(|| "not run: run aborted".to_string()),
                    ),
                    results: Vec::new(),
                },
            };
            files.push(report);
        }

        let report = RunReport {
            title: self.title.clone(),
            run_id: self.run_id.clone(),
            timestamp: now_utc(),
            error_match: self.config.error_match,
            files,
            infrastructure_failure,
        };
        let totals = report.totals();
        self.log.emit(
            LogEntry::new("", LogLevel::Info, "run_end")
                .with_outcome(if report.all_passed() {
                    Outcome::Pass
                } else if report.infrastructure_failure.is_some() {
                    Outcome::Error
                } else {
                    Outcome::Fail
                })
                .with_details(serde_json::json!({
                    "total": totals.total,
                    "passed": totals.passed,
                    "failed": totals.failed,
                    "skipped": totals.skipped,
                    "verdict_digest": report.verdict_digest(),
                })),
        );
        self.log.finish()?;
        Ok(report)
    }

    /// Normalize every statement once so broken fixtures fail before execution.
    fn preflight(&self, file: &RegressionFile) -> Result<(), FixtureError> {
        let mut vars = self.config.initial_variables();
        for (index, statement) in file.statements.iter().enumerate() {
            if statement.skip {
                continue;
            }
            let items =
                normalize(&statement.statement, &mut vars).map_err(|e| e.at(&file.name, index))?;
            // Columns bound by `\gset` are only known at run time.
            if items
                .iter()
                .any(|item| matches!(item, Normalized::Sql(sql) if sql.gset_prefix.is_some()))
            {
                vars.set_lenient(true);
            }
        }
        Ok(())
    }

    fn run_group(
        &self,
        group: &RunGroup,
        handle: &dyn TestHandle,
        cancel: &AtomicBool,
    ) -> GroupRun {
        let mut run = GroupRun::default();
        let Some(first) = group.files.first() else {
            return run;
        };
        if cancel.load(Ordering::SeqCst) {
            return run;
        }
        let mut adapter = match EngineAdapter::connect(self.factory, &first.name) {
            Ok(adapter) => adapter,
            Err(err) => {
                cancel.store(true, Ordering::SeqCst);
                self.report_infrastructure(handle, &err);
                run.stop = Some(err.into());
                return run;
            }
        };
        let mut session = Session::new(
            first.name.clone(),
            self.config.default_role.clone(),
            self.config.initial_variables(),
        );

        for planned in &group.files {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let Some(file) = self.registry.lookup(&planned.name) else {
                continue;
            };
            let file_run = self.run_file(
                &mut adapter,
                &mut session,
                &file,
                planned.requested,
                handle,
                cancel,
            );
            if planned.requested {
                run.reports.push(file_run.report);
            }
            if let Some(stop) = file_run.stop {
                cancel.store(true, Ordering::SeqCst);
                run.stop = Some(stop);
                break;
            }
        }
        run
    }

    fn report_infrastructure(&self, handle: &dyn TestHandle, err: &InfrastructureError) {
        handle.infrastructure_failure(err);
        let mut entry = LogEntry::new("", LogLevel::Fatal, "infrastructure_failure")
            .with_file(err.file.clone())
            .with_outcome(Outcome::Error)
            .with_details(serde_json::to_value(&err.kind).unwrap_or_default());
        entry.statement_index = err.statement_index;
        self.log.emit(entry);
    }

    fn run_file(
        &self,
        adapter: &mut EngineAdapter,
        session: &mut Session,
        file: &RegressionFile,
        requested: bool,
        handle: &dyn TestHandle,
        cancel: &AtomicBool,
    ) -> FileRun {
        session.start_file(file.name.clone(), self.config.initial_variables());
        let mut report = FileReport {
            name: file.name.clone(),
            fixture_digest: file.digest(),
            skipped_reason: None,
            results: Vec::new(),
        };
        if requested {
            handle.file_started(&file.name);
        }
        self.log.emit(
            LogEntry::new("", LogLevel::Info, "file_start")
                .with_file(file.name.clone())
                .with_details(serde_json::json!({
                    "requested": requested,
                    "statements": file.statements.len(),
                })),
        );

        let policy = self.config.error_match;
        for (index, statement) in file.statements.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                break;
            }

            let mut error_code = None;
            let mut duration_us = 0;
            let verdict = if statement.skip {
                Verdict::Skip
            } else {
                let items = match normalize(&statement.statement, session.variables_mut()) {
                    Ok(items) => items,
                    Err(err) => {
                        return FileRun {
                            report,
                            stop: Some(err.at(&file.name, index).into()),
                        };
                    }
                };

                let mut sql = None;
                let mut unsupported_meta = None;
                for item in items {
                    match item {
                        Normalized::Meta(meta) => {
                            self.log.emit(
                                LogEntry::new("", LogLevel::Debug, "meta_command")
                                    .with_file(file.name.clone())
                                    .with_statement(index, statement.statement.clone())
                                    .with_details(serde_json::json!({
                                        "name": meta.name,
                                        "args": meta.args,
                                    })),
                            );
                            if !meta.binds_variables() && unsupported_meta.is_none() {
                                unsupported_meta = Some(meta.name);
                            }
                        }
                        Normalized::Sql(stmt) => sql = Some(stmt),
                    }
                }

                match (sql, unsupported_meta) {
                    (None, Some(name)) => verify::unsupported(
                        statement,
                        &format!("meta-command \\{name} is not executed by the harness"),
                    ),
                    (None, None) => verify::verify(
                        &ExecutionOutcome::Rows(EngineRows::empty()),
                        statement,
                        policy,
                    ),
                    (Some(sql), _) => {
                        let execution = match adapter.execute(session, &sql, index) {
                            Ok(execution) => execution,
                            Err(err) => {
                                self.report_infrastructure(handle, &err);
                                return FileRun {
                                    report,
                                    stop: Some(err.into()),
                                };
                            }
                        };
                        let gset_error = match (&sql.gset_prefix, &execution.outcome) {
                            (Some(prefix), ExecutionOutcome::Rows(rows)) => {
                                session.bind_gset(prefix, rows).err()
                            }
                            _ => None,
                        };
                        let outcome = match gset_error {
                            Some(err) => ExecutionOutcome::Error(err),
                            None => execution.outcome,
                        };
                        error_code = outcome.error_code().map(str::to_string);
                        duration_us = micros(execution.duration);
                        verify::verify(&outcome, statement, policy)
                    }
                }
            };

            let mut entry = LogEntry::new(
                "",
                if verdict.is_fail() && requested {
                    LogLevel::Warn
                } else {
                    LogLevel::Info
                },
                "statement_result",
            )
            .with_file(file.name.clone())
            .with_statement(index, statement.statement.clone())
            .with_outcome(log_outcome(&verdict))
            .with_session(session.state().as_str(), session.current_role())
            .with_duration_us(duration_us);
            if let Some(code) = &error_code {
                entry = entry.with_error_code(code.clone());
            }
            if !requested {
                entry = entry.with_details(serde_json::json!({ "dependency": true }));
            } else if let Verdict::Fail(mismatch) = &verdict {
                entry = entry.with_details(serde_json::json!({ "diff": mismatch.diff }));
            }
            self.log.emit(entry);

            if requested {
                let result = StatementResult {
                    file: file.name.clone(),
                    index,
                    statement: statement.statement.clone(),
                    verdict,
                    error_code,
                    duration_us,
                };
                handle.statement_finished(&result);
                report.results.push(result);
            }
        }

        let mut stop = None;
        if session.state() != TransactionState::Idle
            && self.config.rollback_open_transactions
            && !cancel.load(Ordering::SeqCst)
        {
            self.log.emit(
                LogEntry::new("", LogLevel::Warn, "file_left_open_transaction")
                    .with_file(file.name.clone())
                    .with_session(session.state().as_str(), session.current_role()),
            );
            if let Err(err) = adapter.rollback(session, file.statements.len()) {
                self.report_infrastructure(handle, &err);
                stop = Some(err.into());
            }
        }

        let counts = VerdictCounts::from_results(&report.results);
        self.log.emit(
            LogEntry::new("", LogLevel::Info, "file_end")
                .with_file(file.name.clone())
                .with_outcome(if counts.failed == 0 {
                    Outcome::Pass
                } else {
                    Outcome::Fail
                })
                .with_details(serde_json::json!({
                    "requested": requested,
                    "passed": counts.passed,
                    "failed": counts.failed,
                    "skipped": counts.skipped,
                })),
        );
        if requested {
            handle.file_finished(&report);
        }
        FileRun { report, stop }
    }
}
