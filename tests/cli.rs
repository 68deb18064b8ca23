//! Command-line surface: help, argument validation, and exit codes.

mod common;

use assert_cmd::Command;
use common::TestRepo;
use predicates::prelude::*;

const CONFIG: &str = r#"
[upstream]
branch = "trunk"

[patches]
order = ["patch/a"]

[features.alpha]
patches = ["patch/a"]
"#;

fn forked(t: &TestRepo) -> Command {
    let mut cmd = Command::cargo_bin("forked").unwrap();
    cmd.current_dir(&t.root)
        .env_remove("FORKED_WORKTREES_DIR")
        .env("FORKED_LOG", "off");
    cmd
}

#[test]
fn help_lists_subcommands_and_exit_codes() {
    Command::cargo_bin("forked")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("guard"))
        .stdout(predicate::str::contains("EXIT CODES"));
}

#[test]
fn missing_config_exits_3() {
    let t = TestRepo::new();
    forked(&t)
        .args(["build", "--features", "alpha"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("forked.toml not found"));
}

#[test]
fn invalid_config_exits_3() {
    let t = TestRepo::new();
    t.write("forked.toml", "[patches]\norder = [\"a\"]\nbogus = 1\n");
    forked(&t).args(["sync"]).assert().code(3);
}

#[test]
fn unknown_feature_exits_2() {
    let t = TestRepo::new();
    t.configure(CONFIG);
    forked(&t)
        .args(["build", "--features", "alpha,beta", "--no-worktree"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown feature 'beta'"))
        .stderr(predicate::str::contains("known features: alpha"));
}

#[test]
fn unknown_conflict_mode_is_rejected() {
    let t = TestRepo::new();
    t.configure(CONFIG);
    forked(&t)
        .args(["sync", "--on-conflict", "bogus"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid value 'bogus'"));
}

#[test]
fn exec_mode_needs_a_command() {
    let t = TestRepo::new();
    t.configure(CONFIG);
    forked(&t)
        .args(["sync", "--on-conflict", "exec"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--on-conflict-exec"));
}

#[test]
fn overlay_and_features_are_exclusive() {
    let t = TestRepo::new();
    t.configure(CONFIG);
    forked(&t)
        .args(["build", "--overlay", "dev", "--features", "alpha"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn guard_requires_overlay() {
    let t = TestRepo::new();
    t.configure(CONFIG);
    forked(&t)
        .arg("guard")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--overlay"));
}

#[test]
fn guard_rejects_unknown_mode() {
    let t = TestRepo::new();
    t.configure(CONFIG);
    forked(&t)
        .args(["guard", "--overlay", "dev", "--mode", "lenient"])
        .assert()
        .failure();
}
