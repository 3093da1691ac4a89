//! CLI entrypoint for the regression fixture harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use pgregress_fixture_exec::{EngineFactory, EngineScript, ProcessFactory, ScriptedFactory};
use pgregress_harness::scheduler::plan_many;
use pgregress_harness::structured_log::{LogEmitter, validate_log_file};
use pgregress_harness::verify::Verdict;
use pgregress_harness::{
    CollectingHandle, ErrorMatchPolicy, FixtureRegistry, HarnessConfig, RunReport, TestRunner,
};

/// Regression tooling for SQL engines.
#[derive(Debug, Parser)]
#[command(name = "pgregress-harness")]
#[command(about = "Replays SQL regression fixtures against an engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the run groups for the requested files.
    Plan {
        /// Directory containing fixture JSON files.
        #[arg(long)]
        fixtures: PathBuf,
        /// Files to plan; all registered files when omitted.
        names: Vec<String>,
    },
    /// Run regression files against an engine.
    Verify {
        /// Directory containing fixture JSON files.
        #[arg(long)]
        fixtures: PathBuf,
        /// Bridge command speaking the JSON-lines engine protocol.
        #[arg(long, conflicts_with = "script")]
        engine_cmd: Option<String>,
        /// Scripted engine responses (JSON).
        #[arg(long)]
        script: Option<PathBuf>,
        /// Harness configuration (JSON).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Error matching policy (`contains` or `exact`).
        #[arg(long)]
        error_match: Option<ErrorMatchPolicy>,
        /// Run groups one after another.
        #[arg(long)]
        serial: bool,
        /// Output report path (markdown); JSON is written alongside.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run the plan this many times and require identical verdicts.
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Files to run; all registered files when omitted.
        names: Vec<String>,
    },
    /// Compare two JSON run reports and list verdict changes.
    Compare {
        /// Report of the reference run.
        #[arg(long)]
        base: PathBuf,
        /// Report of the run under review.
        #[arg(long)]
        head: PathBuf,
        /// Write the markdown comparison here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a structured log file.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn load_registry(dir: &Path) -> Result<FixtureRegistry, Box<dyn std::error::Error>> {
    let registry = FixtureRegistry::new();
    let loaded = registry.load_dir(dir)?;
    if loaded.is_empty() {
        return Err(format!("No fixture JSON files found in {}", dir.display()).into());
    }
    registry.seal();
    Ok(registry)
}

fn requested(registry: &FixtureRegistry, names: Vec<String>) -> Vec<String> {
    if names.is_empty() {
        registry.names()
    } else {
        names
    }
}

fn print_summary(report: &RunReport) {
    for file in &report.files {
        if let Some(reason) = &file.skipped_reason {
            println!("{:<32} skipped ({reason})", file.name);
            continue;
        }
        let counts = file.counts();
        println!(
            "{:<32} {} passed, {} failed, {} skipped",
            file.name, counts.passed, counts.failed, counts.skipped
        );
    }
    for result in report.results() {
        if let Verdict::Fail(mismatch) = &result.verdict {
            eprintln!("FAIL {}\n{}\n{}", result.id(), result.statement, mismatch.diff);
        }
    }
    if let Some(err) = &report.infrastructure_failure {
        eprintln!("Run aborted: {err}");
    }
    let totals = report.totals();
    println!(
        "total {}: {} passed, {} failed, {} skipped",
        totals.total, totals.passed, totals.failed, totals.skipped
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Plan { fixtures, names } => {
            let registry = load_registry(&fixtures)?;
            let names = requested(&registry, names);
            let plan = plan_many(&registry, &names)?;
            print!("{}", plan.render());
        }
        Command::Verify {
            fixtures,
            engine_cmd,
            script,
            config,
            error_match,
            serial,
            report,
            log,
            repeat,
            names,
        } => {
            let registry = load_registry(&fixtures)?;
            let names = requested(&registry, names);

            let mut harness_config = match &config {
                Some(path) => HarnessConfig::from_file(path)?,
                None => HarnessConfig::default(),
            };
            harness_config.apply_process_env()?;
            if let Some(policy) = error_match {
                harness_config.error_match = policy;
            }
            if serial {
                harness_config.parallel = false;
            }

            let script = match &script {
                Some(path) => Some(EngineScript::from_file(path).map_err(|e| e.to_string())?),
                None => None,
            };
            let make_factory = || -> Result<Box<dyn EngineFactory>, String> {
                match (&engine_cmd, &script) {
                    (Some(cmd), _) => {
                        let mut parts = cmd.split_whitespace().map(str::to_string);
                        let program = parts.next().ok_or("--engine-cmd is empty")?;
                        let mut factory = ProcessFactory::new(program, parts.collect());
                        if let Some(timeout) = harness_config.statement_timeout() {
                            factory = factory.with_timeout(timeout);
                        }
                        Ok(Box::new(factory))
                    }
                    (None, Some(script)) => Ok(Box::new(ScriptedFactory::new(script.clone()))),
                    (None, None) => Err("one of --engine-cmd or --script is required".to_string()),
                }
            };

            let factory = make_factory()?;
            let mut runner = TestRunner::new(&registry, factory.as_ref(), harness_config.clone())
                .with_title("Regression report");
            if let Some(path) = &log {
                let run_id = format!("pgregress-{}", std::process::id());
                runner = runner.with_log(LogEmitter::to_file(path, &run_id)?);
            }
            let handle = CollectingHandle::new();
            let first = runner.run(&handle, &names)?;
            print_summary(&first);

            if let Some(path) = &report {
                std::fs::write(path, first.to_markdown())?;
                std::fs::write(path.with_extension("json"), first.to_json())?;
                eprintln!("Report written to {}", path.display());
            }

            let digest = first.verdict_digest();
            for attempt in 2..=repeat {
                let factory = make_factory()?;
                let again = TestRunner::new(&registry, factory.as_ref(), harness_config.clone())
                    .run(&CollectingHandle::new(), &names)?;
                if again.verdict_digest() != digest {
                    return Err(format!(
                        "verdicts differ between run 1 and run {attempt}: {} vs {}",
                        digest,
                        again.verdict_digest()
                    )
                    .into());
                }
            }
            if repeat > 1 {
                eprintln!("{repeat} runs produced identical verdicts ({digest})");
            }

            if let Some(err) = first.infrastructure_failure {
                return Err(format!("run aborted: {err}").into());
            }
            if !first.all_passed() {
                return Err(format!("{} statement(s) failed", first.totals().failed).into());
            }
        }
        Command::Compare { base, head, output } => {
            let base = RunReport::from_json(&std::fs::read_to_string(&base)?)?;
            let head = RunReport::from_json(&std::fs::read_to_string(&head)?)?;
            let comparison = RunReport::compare(&base, &head);
            match &output {
                Some(path) => std::fs::write(path, comparison.to_markdown())?,
                None => print!("{}", comparison.to_markdown()),
            }
            if comparison.has_regressions() {
                return Err(format!("{} regression(s)", comparison.regressions.len()).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(format!("{} invalid entries in {lines} lines", errors.len()).into());
            }
            println!("{lines} entries valid");
        }
    }

    Ok(())
}
