//! Shared test helpers for forked integration tests.
//!
//! Every test gets its own temp directory holding a repository at
//! `<tmp>/repo` on `trunk` and a bare `upstream` remote at
//! `<tmp>/remote.git`. Overlay worktrees land in `<tmp>/repo-worktrees`, so
//! nothing escapes the temp directory.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use forked::ForkedConfig;
use forked_git::CliRepo;
use tempfile::TempDir;

/// A repository with an `upstream` remote that trunk tracks.
pub struct TestRepo {
    _dir: TempDir,
    pub root: PathBuf,
    pub remote: PathBuf,
}

impl TestRepo {
    /// `README.md` committed on trunk and pushed to `upstream/trunk`.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let root = dir.path().join("repo");
        let remote = dir.path().join("remote.git");
        std::fs::create_dir(&root).unwrap();

        git(dir.path(), &["init", "-q", "--bare", remote.to_str().unwrap()]);
        git(&root, &["init", "-q"]);
        git(&root, &["symbolic-ref", "HEAD", "refs/heads/trunk"]);
        git(&root, &["config", "user.email", "ci@example.com"]);
        git(&root, &["config", "user.name", "CI"]);
        git(&root, &["config", "commit.gpgsign", "false"]);
        git(&root, &["config", "tag.gpgsign", "false"]);
        let repo = Self {
            _dir: dir,
            root: std::fs::canonicalize(&root).unwrap(),
            remote,
        };
        repo.commit_file("README.md", "initial\n", "initial");
        repo.git(&["remote", "add", "upstream", repo.remote.to_str().unwrap()]);
        repo.push_trunk();
        repo
    }

    pub fn git(&self, args: &[&str]) -> String {
        git(&self.root, args)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Write, stage, and commit one file on the current branch.
    pub fn commit_file(&self, rel: &str, content: &str, msg: &str) -> String {
        self.write(rel, content);
        self.git(&["add", rel]);
        self.git(&["commit", "-q", "-m", msg]);
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn push_trunk(&self) {
        self.git(&["push", "-q", "upstream", "trunk"]);
    }

    /// Commit `forked.toml` on trunk and publish it upstream, so trunk
    /// syncs never drop it.
    pub fn configure(&self, toml: &str) -> ForkedConfig {
        self.write("forked.toml", toml);
        self.write(".gitignore", ".forked/\n");
        self.git(&["add", "forked.toml", ".gitignore"]);
        self.git(&["commit", "-q", "-m", "configure forked"]);
        self.push_trunk();
        ForkedConfig::load_from_repo(&self.root).unwrap()
    }

    /// Create `branch` from trunk with one commit, then return to trunk.
    pub fn patch_branch(&self, branch: &str, rel: &str, content: &str) -> String {
        self.git(&["checkout", "-q", "-b", branch, "trunk"]);
        let sha = self.commit_file(rel, content, &format!("{branch}: edit {rel}"));
        self.git(&["checkout", "-q", "trunk"]);
        sha
    }

    /// Commit on trunk and publish upstream.
    pub fn upstream_commit(&self, rel: &str, content: &str, msg: &str) -> String {
        self.git(&["checkout", "-q", "trunk"]);
        let sha = self.commit_file(rel, content, msg);
        self.push_trunk();
        sha
    }

    pub fn repo(&self) -> CliRepo {
        CliRepo::open(&self.root).unwrap()
    }

    /// Run the `forked` binary in the repository root.
    pub fn forked(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_forked"))
            .args(args)
            .current_dir(&self.root)
            .env_remove("FORKED_WORKTREES_DIR")
            .env("FORKED_LOG", "off")
            .output()
            .expect("failed to execute forked")
    }

    /// Build-log entries, oldest first.
    pub fn build_log(&self) -> Vec<serde_json::Value> {
        read_lines(&self.root.join(".forked/logs/forked-build.log"))
    }

    /// Guard-log entries, oldest first.
    pub fn guard_log(&self) -> Vec<serde_json::Value> {
        read_lines(&self.root.join(".forked/logs/forked-guard.log"))
    }

    pub fn read_json(&self, rel: &str) -> serde_json::Value {
        let text = std::fs::read_to_string(self.root.join(rel)).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    /// Files in the tree of `rev`.
    pub fn show(&self, rev: &str, path: &str) -> String {
        self.git(&["show", &format!("{rev}:{path}")])
    }

    /// Parent directory of the repository (inside the temp dir).
    pub fn parent(&self) -> &Path {
        self.root.parent().unwrap()
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_owned()
}

fn read_lines(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

/// stdout + stderr of a finished command.
pub fn output_text(out: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    )
}
