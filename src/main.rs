use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use forked::config::{ForkedConfig, GuardMode};
use forked::conflict::BlobsLocation;
use forked::guard::{self, GuardOptions};
use forked::overlay::target::WORKTREES_DIR_ENV;
use forked::overlay::{self, BuildOptions, ConflictMode, ConflictOptions, SyncOptions};
use forked::selection::SelectionRequest;
use forked::{ForkedError, telemetry};
use forked_git::CliRepo;

/// Maintain a downstream fork as an ordered stack of patch branches
///
/// forked mirrors upstream into a trunk branch, rebuilds overlay branches
/// by replaying selected patch branches on top of it, and audits the
/// result against policy.
///
/// EXIT CODES:
///   0   success
///   1   unexpected git or I/O failure
///   2   unknown selection name, or guard violation
///   3   invalid forked.toml
///   4   precondition failed (dirty tree, missing remote or branch)
///   10  replay stopped on a conflict; see the bundle
#[derive(Parser)]
#[command(name = "forked")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'forked <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an overlay branch from trunk plus the selected patches
    ///
    /// Syncs trunk to upstream, then cherry-picks every selected patch
    /// branch onto overlay/<id>, by default in a dedicated worktree.
    Build(BuildArgs),

    /// Sync trunk to upstream and rebase every patch branch onto it
    Sync(SyncArgs),

    /// Audit an overlay against trunk and apply the guard mode
    ///
    /// Writes a JSON report (default .forked/report.json) and exits 2 when
    /// the mode fails the run.
    Guard(GuardArgs),
}

#[derive(Args)]
struct ConflictArgs {
    /// Write conflict bundles, optionally at PATH (used as a stem:
    /// PATH-<wave>.json)
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = "")]
    emit_conflicts: Option<String>,

    /// Export base/ours/theirs blobs next to each bundle, or under DIR
    #[arg(long, value_name = "DIR", num_args = 0..=1, default_missing_value = "")]
    conflict_blobs_dir: Option<String>,

    /// Conflict strategy
    #[arg(long, value_enum, value_name = "MODE")]
    on_conflict: Option<OnConflict>,

    /// Alias for --on-conflict bias
    #[arg(long, conflicts_with = "on_conflict")]
    auto_continue: bool,

    /// Resolver command for exec mode; {json} is replaced by the bundle path
    #[arg(long, value_name = "CMD", required_if_eq("on_conflict", "exec"))]
    on_conflict_exec: Option<String>,
}

/// `--on-conflict` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OnConflict {
    /// Write a bundle and stop
    Stop,
    /// Resolve by path bias and continue
    #[value(alias = "bias-continue")]
    Bias,
    /// Run --on-conflict-exec and continue
    Exec,
}

impl ConflictArgs {
    fn into_options(self) -> Result<ConflictOptions> {
        let mode = match (self.on_conflict, self.on_conflict_exec) {
            (None | Some(OnConflict::Exec), Some(cmd)) => ConflictMode::Exec(cmd),
            (Some(OnConflict::Exec), None) => {
                anyhow::bail!("--on-conflict exec requires --on-conflict-exec CMD")
            }
            (Some(other), Some(_)) => {
                anyhow::bail!(
                    "--on-conflict-exec implies exec mode, but --on-conflict is {other:?}"
                )
            }
            (Some(OnConflict::Stop), None) => ConflictMode::Stop,
            (Some(OnConflict::Bias), None) => ConflictMode::Bias,
            (None, None) if self.auto_continue => ConflictMode::Bias,
            (None, None) => ConflictMode::Stop,
        };
        let emit = self.emit_conflicts.is_some();
        let emit_path = self
            .emit_conflicts
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let blobs = self.conflict_blobs_dir.map(|dir| {
            if dir.is_empty() {
                BlobsLocation::Default
            } else {
                BlobsLocation::Dir(PathBuf::from(dir))
            }
        });
        Ok(ConflictOptions {
            mode,
            emit,
            emit_path,
            blobs,
        })
    }
}

#[derive(Args)]
struct BuildArgs {
    /// Overlay profile to build
    #[arg(long, conflicts_with = "features")]
    overlay: Option<String>,

    /// Comma-separated feature names
    #[arg(long, value_delimiter = ',')]
    features: Vec<String>,

    /// Add patch branches matching GLOB (repeatable)
    #[arg(long, value_name = "GLOB")]
    include: Vec<String>,

    /// Remove patch branches matching GLOB (repeatable)
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,

    /// Overlay id (default: profile name, else today's date)
    #[arg(long)]
    id: Option<String>,

    /// Build in the main working copy instead of a worktree
    #[arg(long)]
    no_worktree: bool,

    /// Skip commits whose patch already exists upstream
    #[arg(long)]
    skip_upstream_equivalents: bool,

    /// Do not attach the provenance note to the overlay tip
    #[arg(long)]
    no_git_note: bool,

    /// Worktree root (overrides worktree.root)
    #[arg(long, env = WORKTREES_DIR_ENV, hide_env_values = true)]
    worktrees_dir: Option<String>,

    #[command(flatten)]
    conflicts: ConflictArgs,
}

#[derive(Args)]
struct SyncArgs {
    #[command(flatten)]
    conflicts: ConflictArgs,
}

#[derive(Args)]
struct GuardArgs {
    /// Overlay branch or rev to audit
    #[arg(long)]
    overlay: String,

    /// Report path
    #[arg(long)]
    output: Option<PathBuf>,

    /// warn, block, or require-override (default: guards.mode)
    #[arg(long)]
    mode: Option<GuardMode>,

    /// List both-touched paths and sentinel matches
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    telemetry::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err.downcast_ref::<ForkedError>().map_or(1, ForkedError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("cannot read current directory")?;
    let repo = CliRepo::open(&cwd).map_err(ForkedError::from)?;
    let cfg = ForkedConfig::load_from_repo(forked_git::GitRepo::root(&repo))
        .map_err(ForkedError::from)?;

    match cli.command {
        Commands::Build(args) => build(&repo, &cfg, args),
        Commands::Sync(args) => sync(&repo, &cfg, args),
        Commands::Guard(args) => guard(&repo, &cfg, &args),
    }
}

fn build(repo: &CliRepo, cfg: &ForkedConfig, args: BuildArgs) -> Result<()> {
    let request = SelectionRequest {
        overlay: args.overlay,
        features: args.features,
        include: args.include,
        exclude: args.exclude,
    };
    let options = BuildOptions {
        request,
        id: args.id,
        use_worktree: !args.no_worktree,
        skip_upstream_equivalents: args.skip_upstream_equivalents,
        write_note: !args.no_git_note,
        conflicts: args.conflicts.into_options()?,
        worktree_root: args.worktrees_dir,
    };
    let outcome = overlay::build_overlay(repo, cfg, &options)?;
    println!(
        "[build] {} -> {}",
        outcome.overlay_branch,
        outcome.target.reported.display()
    );
    for patch in &outcome.patches {
        println!(
            "  {} ({} commit(s), {} skipped)",
            patch.branch, patch.commit_count, patch.skipped_count
        );
    }
    for conflict in &outcome.conflicts {
        if let Some(bundle) = &conflict.bundle {
            println!("  conflict wave {}: {}", conflict.wave, bundle.display());
        }
    }
    println!("[build] tip {}", outcome.tip.short());
    Ok(())
}

fn sync(repo: &CliRepo, cfg: &ForkedConfig, args: SyncArgs) -> Result<()> {
    let options = SyncOptions {
        conflicts: args.conflicts.into_options()?,
    };
    let outcome = overlay::sync(repo, cfg, &options)?;
    for branch in &outcome.branches {
        println!("[sync] {}: {}", branch.branch, branch.status);
    }
    Ok(())
}

fn guard(repo: &CliRepo, cfg: &ForkedConfig, args: &GuardArgs) -> Result<()> {
    let options = GuardOptions {
        overlay: args.overlay.clone(),
        output: args.output.clone(),
        mode: args.mode,
        verbose: args.verbose,
    };
    let outcome = guard::run_guard(repo, cfg, &options)?;
    if let Some(debug) = &outcome.report.debug {
        print!("{}", guard::render_debug(debug));
    }
    if let Some(message) = &outcome.decision.error {
        println!("[guard] {message}");
    }
    println!("Report written: {}", outcome.report_path.display());
    outcome.enforce()?;
    Ok(())
}
