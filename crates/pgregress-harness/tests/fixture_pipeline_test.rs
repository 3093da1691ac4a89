//! Integration test: fixture JSON on disk through planning, execution, and reports.
//!
//! Run: cargo test -p pgregress-harness --test fixture_pipeline_test

use std::path::PathBuf;

use pgregress_fixture_exec::{EngineScript, ScriptedFactory};
use pgregress_harness::scheduler::plan_many;
use pgregress_harness::{
    CollectingHandle, FixtureError, FixtureRegistry, HarnessConfig, RunReport, TestRunner, Verdict,
};

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pgregress-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

const SETUP: &str = r#"{
    "name": "test_setup",
    "statements": [
        {"statement": "\\getenv abs_srcdir PG_ABS_SRCDIR"},
        {"statement": "\\set filename :abs_srcdir '/data/onek.data'"},
        {"statement": "CREATE TABLE onek (unique1 int4, stringu1 name);"},
        {"statement": "COPY onek FROM :'filename';"}
    ]
}"#;

const SUITE: &str = r#"[
    {
        "name": "create_function_c",
        "depends_on": ["test_setup"],
        "tags": ["c"],
        "statements": [
            {"statement": "LOAD :'regresslib';"},
            {"statement": "SELECT test_atomic_ops();", "results": [[true]]}
        ]
    },
    {
        "name": "copy2",
        "depends_on": ["test_setup"],
        "statements": [
            {"statement": "COPY x (a, b) from stdin;\n1\tone\n2\ttwo\n\\.", "results": []},
            {"statement": "SELECT b FROM x ORDER BY a;", "results": [["one"], ["two"]]},
            {"statement": "COPY x from stdin (format csv, force_not_null);", "error_string": "syntax error", "skip": true},
            {"statement": "\\d x", "error_string": "anything"}
        ]
    }
]"#;

const SCRIPT: &str = r#"{
    "rules": [
        {"sql": "SELECT test_atomic_ops()", "response": {"rows": {"columns": ["test_atomic_ops"], "rows": [["t"]]}}},
        {"sql": "SELECT b FROM x ORDER BY a", "response": {"rows": {"columns": ["b"], "rows": [["one"], ["two"]]}}}
    ]
}"#;

const CONFIG: &str = r#"{
    "error_match": "contains",
    "variables": {"regresslib": "/usr/lib/postgresql/regress.so"},
    "env": {"PG_ABS_SRCDIR": "/src/test/regress"},
    "inherit_process_env": false,
    "parallel": false
}"#;

fn load(tag: &str) -> FixtureRegistry {
    let dir = scratch_dir(tag);
    std::fs::write(dir.join("00_setup.json"), SETUP).unwrap();
    std::fs::write(dir.join("10_suite.json"), SUITE).unwrap();
    std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

    let registry = FixtureRegistry::new();
    let names = registry.load_dir(&dir).unwrap();
    assert_eq!(names, vec!["test_setup", "create_function_c", "copy2"]);
    registry.seal();
    registry
}

#[test]
fn plan_groups_files_sharing_a_dependency() {
    let registry = load("plan");
    let plan = plan_many(&registry, &["copy2", "create_function_c"]).unwrap();
    assert_eq!(plan.group_count(), 1);
    assert_eq!(plan.file_count(), 3);
    let order: Vec<&str> = plan.groups[0].names().collect();
    assert_eq!(order, vec!["test_setup", "copy2", "create_function_c"]);
    assert!(plan.render().contains("test_setup (dependency)"));
}

#[test]
fn suite_runs_from_disk_with_config_and_script() {
    let registry = load("run");
    let config = HarnessConfig::from_json(CONFIG).unwrap();
    let factory = ScriptedFactory::new(EngineScript::from_json(SCRIPT).unwrap());
    let runner = TestRunner::new(&registry, &factory, config).with_title("pipeline");

    let report = runner
        .run(&CollectingHandle::new(), &["create_function_c", "copy2"])
        .unwrap();

    let journal = factory.journal();
    let copy_from_file = journal
        .iter()
        .find(|e| e.sql.starts_with("COPY onek"))
        .unwrap();
    assert_eq!(
        copy_from_file.sql,
        "COPY onek FROM '/src/test/regress/data/onek.data';"
    );
    let copy_stdin = journal.iter().find(|e| e.sql.starts_with("COPY x")).unwrap();
    assert_eq!(copy_stdin.copy_payload.as_deref(), Some("1\tone\n2\ttwo\n"));
    assert!(journal.iter().any(|e| e.sql == "LOAD '/usr/lib/postgresql/regress.so';"));
    assert!(journal.iter().all(|e| !e.sql.contains("force_not_null")));

    let names: Vec<&str> = report.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["create_function_c", "copy2"]);
    assert_eq!(report.files[0].counts().passed, 2);

    let copy2 = &report.files[1].results;
    assert_eq!(copy2[0].verdict, Verdict::Pass);
    assert_eq!(copy2[1].verdict, Verdict::Pass);
    assert_eq!(copy2[2].verdict, Verdict::Skip);
    assert!(copy2[3].verdict.is_fail(), "unexecuted meta-command with an expectation fails");

    let dir = scratch_dir("report");
    let md_path = dir.join("report.md");
    std::fs::write(&md_path, report.to_markdown()).unwrap();
    std::fs::write(md_path.with_extension("json"), report.to_json()).unwrap();
    let json = std::fs::read_to_string(md_path.with_extension("json")).unwrap();
    let back = RunReport::from_json(&json).unwrap();
    assert_eq!(back, report);
    assert!(std::fs::read_to_string(&md_path).unwrap().starts_with("# pipeline"));
}

#[test]
fn invalid_fixture_document_is_rejected() {
    let dir = scratch_dir("invalid");
    std::fs::write(dir.join("broken.json"), "{\"name\": 7}").unwrap();
    let registry = FixtureRegistry::new();
    let err = registry.load_dir(&dir).unwrap_err();
    assert!(matches!(err, FixtureError::InvalidFixture { .. }));
}

#[test]
fn cyclic_fixtures_are_rejected_at_planning() {
    let dir = scratch_dir("cycle");
    std::fs::write(
        dir.join("cycle.json"),
        r#"[{"name": "a", "depends_on": ["b"]}, {"name": "b", "depends_on": ["a"]}]"#,
    )
    .unwrap();
    let registry = FixtureRegistry::new();
    assert_eq!(registry.load_dir(&dir).unwrap(), vec!["a", "b"]);
    assert!(registry.lookup("a").unwrap().statements.is_empty());
    let err = plan_many(&registry, &["a"]).unwrap_err();
    assert!(
        matches!(&err, FixtureError::CyclicDependency { cycle } if cycle == &["a", "b", "a"]),
        "unexpected error: {err}"
    );
}
