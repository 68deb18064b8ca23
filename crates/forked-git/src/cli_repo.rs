//! The `git`-executable implementation of [`GitRepo`].
//!
//! Every method spawns exactly one (occasionally two) `git` processes and
//! waits for them. Output is parsed from porcelain or `-z` formats so paths
//! with spaces or non-ASCII characters survive intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::debug;

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{
    ConflictEntry, GitOid, HeadState, NumstatEntry, ReplayKind, ReplayOutcome, Side, TagInfo,
    WorktreeInfo,
};

/// A [`GitRepo`] backed by the `git` command-line tool.
///
/// Construct with [`CliRepo::open`].
#[derive(Clone, Debug)]
pub struct CliRepo {
    root: PathBuf,
}

impl CliRepo {
    /// Open the repository containing `path` (discovers the top level).
    ///
    /// # Errors
    /// Returns [`GitError::NotFound`] if `path` is not inside a git work tree.
    pub fn open(path: &Path) -> Result<Self, GitError> {
        let out = spawn(path, &["rev-parse", "--show-toplevel"])?;
        if !out.status.success() {
            return Err(GitError::NotFound {
                message: format!("no git repository at {}", path.display()),
            });
        }
        let top = stdout_string(&out);
        let root = std::fs::canonicalize(top.trim()).unwrap_or_else(|_| PathBuf::from(top.trim()));
        Ok(Self { root })
    }

    /// Run git in `dir`, returning trimmed stdout on success.
    fn git(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let out = spawn(dir, args)?;
        if out.status.success() {
            Ok(stdout_string(&out).trim_end().to_owned())
        } else {
            Err(command_failed(args, &out))
        }
    }

    /// Run git in `dir`, returning raw stdout bytes on success.
    fn git_bytes(&self, dir: &Path, args: &[&str]) -> Result<Vec<u8>, GitError> {
        let out = spawn(dir, args)?;
        if out.status.success() {
            Ok(out.stdout)
        } else {
            Err(command_failed(args, &out))
        }
    }

    fn rev_parse_in(&self, dir: &Path, rev: &str) -> Result<Option<GitOid>, GitError> {
        let spec = format!("{rev}^{{commit}}");
        let out = spawn(dir, &["rev-parse", "--verify", "--quiet", &spec])?;
        if !out.status.success() {
            return Ok(None);
        }
        let raw = stdout_string(&out);
        Ok(Some(raw.trim().parse()?))
    }

    /// Resolve a `--git-path` name to an absolute path for `workdir`.
    fn git_path(&self, workdir: &Path, name: &str) -> Result<PathBuf, GitError> {
        let raw = self.git(workdir, &["rev-parse", "--git-path", name])?;
        let path = PathBuf::from(raw.trim());
        Ok(if path.is_absolute() {
            path
        } else {
            workdir.join(path)
        })
    }

    /// Classify a failed replay step by inspecting the index and sequencer state.
    fn classify_failure(
        &self,
        workdir: &Path,
        args: &[&str],
        out: &Output,
    ) -> Result<ReplayOutcome, GitError> {
        if !self.conflicted_entries(workdir)?.is_empty() {
            return Ok(ReplayOutcome::Conflicted);
        }
        if self.replay_in_progress(workdir)?.is_some() {
            return Ok(ReplayOutcome::Empty);
        }
        Err(command_failed(args, out))
    }

    fn replay_step(&self, workdir: &Path, args: &[&str]) -> Result<ReplayOutcome, GitError> {
        let out = spawn(workdir, args)?;
        if out.status.success() {
            Ok(ReplayOutcome::Applied)
        } else {
            self.classify_failure(workdir, args, &out)
        }
    }
}

impl GitRepo for CliRepo {
    fn root(&self) -> &Path {
        &self.root
    }

    // === Remotes ===

    fn has_remote(&self, name: &str) -> Result<bool, GitError> {
        let out = self.git(&self.root, &["remote"])?;
        Ok(out.lines().any(|line| line.trim() == name))
    }

    fn fetch(&self, remote: &str) -> Result<(), GitError> {
        self.git(&self.root, &["fetch", "--quiet", remote])?;
        Ok(())
    }

    // === Rev-parse ===

    fn rev_parse(&self, rev: &str) -> Result<GitOid, GitError> {
        self.rev_parse_opt(rev)?.ok_or_else(|| GitError::NotFound {
            message: format!("revision `{rev}` does not resolve to a commit"),
        })
    }

    fn rev_parse_opt(&self, rev: &str) -> Result<Option<GitOid>, GitError> {
        self.rev_parse_in(&self.root, rev)
    }

    // === Branches / HEAD ===

    fn head_state(&self, workdir: &Path) -> Result<HeadState, GitError> {
        let out = spawn(workdir, &["symbolic-ref", "-q", "--short", "HEAD"])?;
        if out.status.success() {
            return Ok(HeadState::Branch(stdout_string(&out).trim().to_owned()));
        }
        let oid = self
            .rev_parse_in(workdir, "HEAD")?
            .ok_or_else(|| GitError::NotFound {
                message: format!("HEAD does not resolve in {}", workdir.display()),
            })?;
        Ok(HeadState::Detached(oid))
    }

    fn set_branch(&self, name: &str, target: GitOid) -> Result<(), GitError> {
        let oid = target.to_string();
        self.git(&self.root, &["branch", "-f", name, &oid])?;
        Ok(())
    }

    fn checkout(&self, workdir: &Path, target: &str) -> Result<(), GitError> {
        self.git(workdir, &["checkout", "--quiet", target, "--"])?;
        Ok(())
    }

    fn checkout_branch_at(
        &self,
        workdir: &Path,
        branch: &str,
        start: GitOid,
    ) -> Result<(), GitError> {
        let oid = start.to_string();
        self.git(workdir, &["checkout", "--quiet", "-B", branch, &oid])?;
        Ok(())
    }

    fn reset_hard(&self, workdir: &Path, target: GitOid) -> Result<(), GitError> {
        let oid = target.to_string();
        self.git(workdir, &["reset", "--quiet", "--hard", &oid])?;
        Ok(())
    }

    fn reset_keep(&self, workdir: &Path, target: GitOid) -> Result<(), GitError> {
        let oid = target.to_string();
        let out = spawn(workdir, &["reset", "--quiet", "--keep", &oid])?;
        if out.status.success() {
            return Ok(());
        }
        Err(GitError::DirtyWorktree {
            path: workdir.to_path_buf(),
            message: stderr_string(&out),
        })
    }

    fn is_clean(&self, workdir: &Path) -> Result<bool, GitError> {
        let out = self.git(workdir, &["status", "--porcelain", "--untracked-files=no"])?;
        Ok(out.trim().is_empty())
    }

    // === History ===

    fn merge_base(&self, a: GitOid, b: GitOid) -> Result<Option<GitOid>, GitError> {
        let (a, b) = (a.to_string(), b.to_string());
        let args = ["merge-base", a.as_str(), b.as_str()];
        let out = spawn(&self.root, &args)?;
        if out.status.success() {
            return Ok(Some(stdout_string(&out).trim().parse()?));
        }
        // Exit 1 with no output means "no common ancestor".
        if out.status.code() == Some(1) && out.stdout.is_empty() {
            return Ok(None);
        }
        Err(command_failed(&args, &out))
    }

    fn list_commits(&self, base: GitOid, tip: GitOid) -> Result<Vec<GitOid>, GitError> {
        let range = format!("{base}..{tip}");
        let out = self.git(&self.root, &["rev-list", "--reverse", &range])?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().parse().map_err(GitError::from))
            .collect()
    }

    fn upstream_equivalents(
        &self,
        upstream: GitOid,
        tip: GitOid,
        base: GitOid,
    ) -> Result<Vec<GitOid>, GitError> {
        let (u, t, b) = (upstream.to_string(), tip.to_string(), base.to_string());
        let out = self.git(&self.root, &["cherry", &u, &t, &b])?;
        parse_cherry(&out)
    }

    fn commit_summary(&self, commit: GitOid) -> Result<String, GitError> {
        let oid = commit.to_string();
        self.git(&self.root, &["show", "-s", "--format=%s", &oid])
    }

    fn commit_trailer_values(&self, commit: GitOid, key: &str) -> Result<Vec<String>, GitError> {
        let oid = commit.to_string();
        let format = format!("--format=%(trailers:key={key},valueonly,unfold)");
        let out = self.git(&self.root, &["show", "-s", &format, &oid])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    // === Replay ===

    fn cherry_pick(&self, workdir: &Path, commit: GitOid) -> Result<ReplayOutcome, GitError> {
        let oid = commit.to_string();
        debug!(commit = %commit.short(), workdir = %workdir.display(), "cherry-pick");
        self.replay_step(workdir, &["cherry-pick", "-x", &oid])
    }

    fn rebase_onto(
        &self,
        workdir: &Path,
        branch: &str,
        onto: GitOid,
    ) -> Result<ReplayOutcome, GitError> {
        let oid = onto.to_string();
        debug!(branch, onto = %onto.short(), "rebase");
        self.replay_step(workdir, &["rebase", &oid, branch])
    }

    fn replay_in_progress(&self, workdir: &Path) -> Result<Option<ReplayKind>, GitError> {
        for name in ["rebase-merge", "rebase-apply"] {
            if self.git_path(workdir, name)?.is_dir() {
                return Ok(Some(ReplayKind::Rebase));
            }
        }
        if self.git_path(workdir, "CHERRY_PICK_HEAD")?.is_file() {
            return Ok(Some(ReplayKind::CherryPick));
        }
        Ok(None)
    }

    fn replay_head(&self, workdir: &Path) -> Result<Option<GitOid>, GitError> {
        match self.replay_in_progress(workdir)? {
            Some(ReplayKind::CherryPick) => self.rev_parse_in(workdir, "CHERRY_PICK_HEAD"),
            Some(ReplayKind::Rebase) => self.rev_parse_in(workdir, "REBASE_HEAD"),
            None => Ok(None),
        }
    }

    fn continue_replay(
        &self,
        workdir: &Path,
        kind: ReplayKind,
    ) -> Result<ReplayOutcome, GitError> {
        self.replay_step(workdir, &[kind.subcommand(), "--continue"])
    }

    fn skip_replay(&self, workdir: &Path, kind: ReplayKind) -> Result<ReplayOutcome, GitError> {
        self.replay_step(workdir, &[kind.subcommand(), "--skip"])
    }

    fn quit_replay(&self, workdir: &Path, kind: ReplayKind) -> Result<(), GitError> {
        self.git(workdir, &[kind.subcommand(), "--quit"])?;
        Ok(())
    }

    fn conflicted_entries(&self, workdir: &Path) -> Result<Vec<ConflictEntry>, GitError> {
        let raw = self.git_bytes(workdir, &["ls-files", "-u", "-z"])?;
        parse_unmerged(&String::from_utf8_lossy(&raw))
    }

    fn take_side(&self, workdir: &Path, entry: &ConflictEntry, side: Side) -> Result<(), GitError> {
        let path = entry.path.as_str();
        if entry.side(side).is_some() {
            self.git(workdir, &["checkout", side.checkout_flag(), "--", path])?;
            self.git(workdir, &["add", "--", path])?;
        } else {
            self.git(workdir, &["rm", "--quiet", "--", path])?;
        }
        Ok(())
    }

    // === Diff / objects ===

    fn changed_paths(&self, from: GitOid, to: GitOid) -> Result<Vec<String>, GitError> {
        let range = format!("{from}...{to}");
        let raw = self.git_bytes(
            &self.root,
            &["diff", "--name-only", "-z", "--no-renames", &range],
        )?;
        let mut paths: Vec<String> = String::from_utf8_lossy(&raw)
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    fn numstat(&self, from: GitOid, to: GitOid) -> Result<Vec<NumstatEntry>, GitError> {
        let range = format!("{from}...{to}");
        let raw = self.git_bytes(&self.root, &["diff", "--numstat", "-z", &range])?;
        Ok(parse_numstat_z(&String::from_utf8_lossy(&raw)))
    }

    fn tree_blobs(&self, rev: GitOid) -> Result<BTreeMap<String, GitOid>, GitError> {
        let oid = rev.to_string();
        let raw = self.git_bytes(&self.root, &["ls-tree", "-r", "-z", &oid])?;
        parse_ls_tree(&String::from_utf8_lossy(&raw))
    }

    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError> {
        let hex = oid.to_string();
        self.git_bytes(&self.root, &["cat-file", "blob", &hex])
    }

    // === Tags / notes ===

    fn annotated_tags_at(&self, commit: GitOid) -> Result<Vec<TagInfo>, GitError> {
        let oid = commit.to_string();
        let listing = self.git(
            &self.root,
            &[
                "for-each-ref",
                "--points-at",
                &oid,
                "--format=%(objecttype)%09%(creatordate:unix)%09%(refname:short)",
                "refs/tags",
            ],
        )?;
        let mut tags = Vec::new();
        for line in listing.lines() {
            let mut parts = line.splitn(3, '\t');
            let (Some(kind), Some(created), Some(name)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if kind != "tag" {
                continue;
            }
            let refname = format!("refs/tags/{name}");
            let message = self.git(&self.root, &["for-each-ref", "--format=%(contents)", &refname])?;
            tags.push(TagInfo {
                name: name.to_owned(),
                created: created.trim().parse().unwrap_or(0),
                message,
            });
        }
        tags.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));
        Ok(tags)
    }

    fn read_note(&self, notes_ref: &str, commit: GitOid) -> Result<Option<String>, GitError> {
        let oid = commit.to_string();
        let args = ["notes", "--ref", notes_ref, "show", oid.as_str()];
        let out = spawn(&self.root, &args)?;
        if out.status.success() {
            let body = stdout_string(&out);
            return Ok((!body.trim().is_empty()).then_some(body));
        }
        if stderr_string(&out).contains("no note found") {
            return Ok(None);
        }
        Err(command_failed(&args, &out))
    }

    fn write_note(&self, notes_ref: &str, commit: GitOid, message: &str) -> Result<(), GitError> {
        let oid = commit.to_string();
        self.git(
            &self.root,
            &["notes", "--ref", notes_ref, "add", "-f", "-m", message, &oid],
        )?;
        Ok(())
    }

    // === Worktrees ===

    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let out = self.git(&self.root, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&out))
    }

    fn prune_worktrees(&self) -> Result<(), GitError> {
        self.git(&self.root, &["worktree", "prune"])?;
        Ok(())
    }

    fn add_worktree(&self, path: &Path, branch: &str, start: GitOid) -> Result<(), GitError> {
        let oid = start.to_string();
        let target = path.to_string_lossy();
        self.git(
            &self.root,
            &["worktree", "add", "--quiet", "-B", branch, &target, &oid],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process helpers
// ---------------------------------------------------------------------------

fn spawn(dir: &Path, args: &[&str]) -> Result<Output, GitError> {
    debug!(dir = %dir.display(), args = ?args, "git");
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_EDITOR", "true")
        .env("LC_ALL", "C")
        .output()?;
    Ok(out)
}

fn stdout_string(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr_string(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_owned()
}

fn command_failed(args: &[&str], out: &Output) -> GitError {
    GitError::CommandFailed {
        command: format!("git {}", args.join(" ")),
        stderr: stderr_string(out),
        exit_code: out.status.code(),
    }
}

// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

/// `git cherry` prints `- <sha>` for commits with an equivalent upstream.
fn parse_cherry(out: &str) -> Result<Vec<GitOid>, GitError> {
    out.lines()
        .filter_map(|line| line.strip_prefix("- "))
        .map(|sha| sha.trim().parse().map_err(GitError::from))
        .collect()
}

/// Parse `git ls-files -u -z`: `<mode> <oid> <stage>\t<path>\0`.
fn parse_unmerged(raw: &str) -> Result<Vec<ConflictEntry>, GitError> {
    let mut by_path: BTreeMap<String, ConflictEntry> = BTreeMap::new();
    for record in raw.split('\0').filter(|r| !r.is_empty()) {
        let Some((meta, path)) = record.split_once('\t') else {
            continue;
        };
        let mut fields = meta.split_whitespace();
        let (Some(_mode), Some(oid), Some(stage)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let oid: GitOid = oid.parse()?;
        let entry = by_path
            .entry(path.to_owned())
            .or_insert_with(|| ConflictEntry {
                path: path.to_owned(),
                base: None,
                ours: None,
                theirs: None,
            });
        match stage {
            "1" => entry.base = Some(oid),
            "2" => entry.ours = Some(oid),
            "3" => entry.theirs = Some(oid),
            _ => {}
        }
    }
    Ok(by_path.into_values().collect())
}

/// Parse `git diff --numstat -z`.
///
/// Plain records are `<add>\t<del>\t<path>\0`. Renames leave the path empty
/// and follow with `<old>\0<new>\0`.
fn parse_numstat_z(raw: &str) -> Vec<NumstatEntry> {
    let mut entries = Vec::new();
    let mut tokens = raw.split('\0');
    while let Some(token) = tokens.next() {
        if token.is_empty() {
            continue;
        }
        let mut parts = token.splitn(3, '\t');
        let (Some(added), Some(removed), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let path = if path.is_empty() {
            let _old = tokens.next();
            match tokens.next() {
                Some(new) => new.to_owned(),
                None => break,
            }
        } else {
            path.to_owned()
        };
        entries.push(NumstatEntry {
            path,
            added: added.parse().ok(),
            removed: removed.parse().ok(),
        });
    }
    entries
}

/// Parse `git ls-tree -r -z`: `<mode> <type> <oid>\t<path>\0`, blobs only.
fn parse_ls_tree(raw: &str) -> Result<BTreeMap<String, GitOid>, GitError> {
    let mut blobs = BTreeMap::new();
    for record in raw.split('\0').filter(|r| !r.is_empty()) {
        let Some((meta, path)) = record.split_once('\t') else {
            continue;
        };
        let mut fields = meta.split_whitespace();
        let (Some(_mode), Some(kind), Some(oid)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if kind == "blob" {
            blobs.insert(path.to_owned(), oid.parse()?);
        }
    }
    Ok(blobs)
}

fn parse_worktree_porcelain(out: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(done) = current.take() {
                worktrees.push(done);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: None,
                branch: None,
            });
        } else if let Some(wt) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                wt.head = head.trim().parse().ok();
            } else if let Some(branch) = line.strip_prefix("branch ") {
                let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                wt.branch = Some(short.to_owned());
            }
        }
    }
    if let Some(done) = current {
        worktrees.push(done);
    }
    worktrees
}
