//! Git adapter for forked.
//!
//! This crate defines the [`GitRepo`] trait, the single interface through
//! which the overlay builder, the sync driver, and the guard engine talk to
//! git. Nothing outside this crate spawns `git` directly; callers program
//! against the trait so the orchestration logic can run against a test double.
//!
//! # Crate layout
//!
//! - [`repo`]: the [`GitRepo`] trait definition.
//! - [`types`]: value types used in trait signatures ([`GitOid`],
//!   [`ConflictEntry`], [`WorktreeInfo`], etc.).
//! - [`error`]: the [`GitError`] enum returned by all trait methods.
//! - [`CliRepo`]: the production implementation, one `git` process per call.

pub mod error;
pub mod repo;
pub mod types;

mod cli_repo;

pub use cli_repo::CliRepo;

pub use error::GitError;
pub use repo::GitRepo;
pub use types::{
    ConflictEntry, GitOid, HeadState, NumstatEntry, OidParseError, ReplayKind, ReplayOutcome,
    Side, TagInfo, WorktreeInfo,
};
