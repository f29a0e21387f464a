use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{now}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_mrb<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_mrb"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute mrb binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_mrb(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "mrb command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn str_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
        .iter()
        .map(|item| {
            item.as_str()
                .unwrap_or_else(|| panic!("non-string item in `{key}`: {value}"))
                .to_string()
        })
        .collect()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_script(dir: &Path, revision: &str, parent: Option<&str>) {
    let body = format!(
        "-- revision: {revision}\n\
         -- down_revision: {}\n\
         -- message: create t_{revision}\n\
         \n\
         -- migrate:up\n\
         CREATE TABLE t_{revision} (id INTEGER PRIMARY KEY);\n\
         \n\
         -- migrate:down\n\
         DROP TABLE t_{revision};\n",
        parent.unwrap_or("none")
    );
    let path = dir.join(format!("{revision}_create_t_{revision}.sql"));
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write script {}: {err}", path.display()));
}

struct Project {
    root: PathBuf,
    config: PathBuf,
}

impl Project {
    /// `p1 -> p2 -> p3 -> p4`, then `p4 -> a1 -> a2` and `p4 -> b1 -> b2`,
    /// with both branches applied to the database.
    fn diverged(prefix: &str) -> Self {
        let root = unique_temp_dir(prefix);
        let versions = root.join("versions");
        fs::create_dir_all(&versions)
            .unwrap_or_else(|err| panic!("failed to create versions dir: {err}"));
        for (revision, parent) in [
            ("p1", None),
            ("p2", Some("p1")),
            ("p3", Some("p2")),
            ("p4", Some("p3")),
            ("a1", Some("p4")),
            ("a2", Some("a1")),
            ("b1", Some("p4")),
            ("b2", Some("b1")),
        ] {
            write_script(&versions, revision, parent);
        }

        let config = root.join("migrate.yaml");
        fs::write(&config, "script_location: versions\ndatabase: app.sqlite3\n")
            .unwrap_or_else(|err| panic!("failed to write config: {err}"));

        let project = Self { root, config };
        project.json(&["db", "upgrade", "a2"]);
        project.json(&["db", "upgrade", "b2"]);
        project
    }

    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = vec!["--config", path_str(&self.config)];
        full.extend_from_slice(args);
        full
    }

    fn json(&self, args: &[&str]) -> Value {
        run_json(self.args(args))
    }

    fn run(&self, args: &[&str]) -> Output {
        run_mrb(self.args(args))
    }

    fn script(&self, revision: &str) -> String {
        let path = self.root.join("versions").join(format!("{revision}_create_t_{revision}.sql"));
        fs::read_to_string(&path)
            .unwrap_or_else(|err| panic!("failed to read script {}: {err}", path.display()))
    }

    fn table_exists(&self, table: &str) -> bool {
        let conn = Connection::open(self.root.join("app.sqlite3"))
            .unwrap_or_else(|err| panic!("failed to open database: {err}"));
        let exists = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [table],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or_else(|err| panic!("failed to query sqlite_master: {err}"));
        exists == 1
    }
}

#[test]
fn heads_reports_both_branches_before_rebase() {
    let project = Project::diverged("mrb-heads");
    let heads = project.json(&["heads"]);

    assert_eq!(as_str(&heads, "contract_version"), "cli.v1");
    assert_eq!(str_list(&heads, "script_heads"), vec!["a2", "b2"]);
    assert_eq!(str_list(&heads, "database_heads"), vec!["a2", "b2"]);
    assert_eq!(heads.get("single_head").and_then(Value::as_bool), Some(false));
}

#[test]
fn history_and_ancestor_follow_recorded_parents() {
    let project = Project::diverged("mrb-history");

    let history = project.json(&["history", "b2"]);
    assert_eq!(str_list(&history, "chain"), vec!["p1", "p2", "p3", "p4", "b1", "b2"]);

    let ancestor = project.json(&["ancestor", "a2", "b2"]);
    assert_eq!(as_str(&ancestor, "ancestor"), "p4");
}

#[test]
fn plan_is_a_dry_run() {
    let project = Project::diverged("mrb-plan");
    let before = project.script("b1");

    let plan = project.json(&["plan", "b2", "a2"]);
    assert_eq!(plan.get("dry_run").and_then(Value::as_bool), Some(true));
    assert_eq!(as_str(&plan, "new_head"), "b2");
    let inner = plan.get("plan").unwrap_or_else(|| panic!("missing plan: {plan}"));
    assert_eq!(as_str(inner, "ancestor"), "p4");
    assert_eq!(str_list(inner, "rebase_set"), vec!["b1", "b2"]);

    assert_eq!(project.script("b1"), before);
    assert_eq!(str_list(&project.json(&["heads"]), "database_heads"), vec!["a2", "b2"]);
}

#[test]
fn rebase_linearizes_scripts_and_database() {
    let project = Project::diverged("mrb-rebase");
    let before = project.script("b1");

    let report = project.json(&["rebase", "b2", "a2"]);
    assert_eq!(as_str(&report, "new_head"), "b2");
    assert_eq!(str_list(&report, "rewritten"), vec!["b1"]);
    assert_eq!(str_list(&report, "database_heads"), vec!["b2"]);
    assert_eq!(
        str_list(&report, "phases"),
        vec!["validating", "downgrading", "rewriting", "applying", "done"]
    );

    assert_eq!(project.script("b1"), before.replace("down_revision: p4", "down_revision: a2"));
    let history = project.json(&["history", "b2"]);
    assert_eq!(
        str_list(&history, "chain"),
        vec!["p1", "p2", "p3", "p4", "a1", "a2", "b1", "b2"]
    );
    let heads = project.json(&["heads"]);
    assert_eq!(str_list(&heads, "script_heads"), vec!["b2"]);
    assert!(project.table_exists("t_b2"));

    let status = project.json(&["db", "status"]);
    assert_eq!(status.get("up_to_date").and_then(Value::as_bool), Some(true));
}

#[test]
fn identical_heads_fail_without_touching_anything() {
    let project = Project::diverged("mrb-same");
    let before = project.script("b1");

    let output = project.run(&["rebase", "b2", "b2"]);
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "stderr:\n{stderr}");
    assert!(stderr.contains("cannot be the same"), "stderr:\n{stderr}");

    assert_eq!(project.script("b1"), before);
    assert!(project.table_exists("t_b2"));
}

#[test]
fn heads_missing_from_the_database_are_rejected() {
    let project = Project::diverged("mrb-not-current");
    project.json(&["db", "downgrade", "b1"]);

    let output = project.run(&["rebase", "b2", "a2"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("is not a current head"), "stderr:\n{stderr}");
    assert!(stderr.contains("Current heads: [a2, b1]"), "stderr:\n{stderr}");
}

#[test]
fn engine_failure_while_applying_exits_with_fatal_status() {
    let project = Project::diverged("mrb-fatal");
    let path = project.root.join("versions").join("b1_create_t_b1.sql");
    let broken = project.script("b1").replace(
        "CREATE TABLE t_b1 (id INTEGER PRIMARY KEY);",
        "INSERT INTO no_such_table VALUES (1);",
    );
    fs::write(&path, broken)
        .unwrap_or_else(|err| panic!("failed to write script {}: {err}", path.display()));

    let output = project.run(&["rebase", "b2", "a2"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed during applying at b1"), "stderr:\n{stderr}");
    assert!(stderr.contains("last known heads: [a2]"), "stderr:\n{stderr}");
    assert!(stderr.contains("between revisions"), "stderr:\n{stderr}");

    assert!(project.table_exists("t_a2"));
    assert!(!project.table_exists("t_b1"));
}

#[test]
fn db_downgrade_reports_unapplied_revisions() {
    let project = Project::diverged("mrb-downgrade");

    let downgrade = project.json(&["db", "downgrade", "p4"]);
    assert_eq!(str_list(&downgrade, "unapplied"), vec!["b2", "b1", "a2", "a1"]);
    assert_eq!(str_list(&downgrade, "heads"), vec!["p4"]);
    assert!(!project.table_exists("t_a1"));
}

#[test]
fn command_line_paths_override_the_config_file() {
    let project = Project::diverged("mrb-override");
    let other_db = project.root.join("other.sqlite3");

    let heads = run_json([
        "--config",
        path_str(&project.root.join("missing.yaml")),
        "--scripts",
        path_str(&project.root.join("versions")),
        "--db",
        path_str(&other_db),
        "heads",
    ]);
    assert_eq!(str_list(&heads, "script_heads"), vec!["a2", "b2"]);
    assert!(str_list(&heads, "database_heads").is_empty());
}

#[test]
fn invalid_revision_ids_are_rejected_by_the_parser() {
    let project = Project::diverged("mrb-invalid-id");
    let output = project.run(&["history", "not a revision"]);
    assert!(!output.status.success());
}
