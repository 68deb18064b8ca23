//! Override resolution and the guard mode decision table.
//!
//! An override is a set of scope tokens carried by a trailer
//! (`Forked-Override: sentinel, size` by default). Sources are consulted in
//! a fixed order and the first non-empty one wins; tokens are never merged
//! across sources:
//!
//! 1. the overlay tip's commit message;
//! 2. the newest annotated tag pointing at the tip;
//! 3. the tip's note under [`OVERRIDE_NOTES_REF`].

use std::collections::BTreeSet;
use std::fmt;

use forked_git::{GitError, GitOid, GitRepo};
use serde::{Deserialize, Serialize};

use crate::config::{GuardMode, PolicyOverridesConfig};
use crate::trailers;

/// Notes ref consulted for overrides.
pub const OVERRIDE_NOTES_REF: &str = "refs/notes/forked/override";

/// Token that covers every violation scope.
pub const WILDCARD: &str = "all";

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// A violation scope an override can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The both-touched check fired.
    BothTouched,
    /// A sentinel rule fired.
    Sentinel,
    /// A size cap was exceeded.
    Size,
}

impl Scope {
    /// The token spelling.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::BothTouched => "both_touched",
            Self::Sentinel => "sentinel",
            Self::Size => "size",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Where the override tokens came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideSource {
    Commit,
    Tag,
    Note,
    #[default]
    None,
}

/// The override found for a commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedOverride {
    pub source: OverrideSource,
    /// Lower-cased, de-duplicated tokens in first-seen order.
    pub values: Vec<String>,
    /// Tag name when `source` is [`OverrideSource::Tag`].
    pub tag: Option<String>,
}

/// Resolve the override for `commit` using trailer `key`.
///
/// # Errors
/// Returns [`GitError`] if the commit, tags, or notes cannot be read.
pub fn resolve_override(
    repo: &dyn GitRepo,
    key: &str,
    commit: GitOid,
) -> Result<ResolvedOverride, GitError> {
    let values = trailers::tokens_from_values(&repo.commit_trailer_values(commit, key)?);
    if !values.is_empty() {
        return Ok(ResolvedOverride {
            source: OverrideSource::Commit,
            values,
            tag: None,
        });
    }

    for tag in repo.annotated_tags_at(commit)? {
        let values = trailers::collect(&tag.message, key);
        if !values.is_empty() {
            return Ok(ResolvedOverride {
                source: OverrideSource::Tag,
                values,
                tag: Some(tag.name),
            });
        }
    }

    if let Some(note) = repo.read_note(OVERRIDE_NOTES_REF, commit)? {
        let values = trailers::collect(&note, key);
        if !values.is_empty() {
            return Ok(ResolvedOverride {
                source: OverrideSource::Note,
                values,
                tag: None,
            });
        }
    }

    Ok(ResolvedOverride::default())
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// The outcome of applying the mode and override policy to a set of
/// violation scopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Overrides are in force (`require_trailer` or `require-override`).
    pub enabled: bool,
    /// The override was required, valid, and covered every scope.
    pub applied: bool,
    /// Why the override was rejected or missing, if it was.
    pub error: Option<String>,
    /// The run must fail.
    pub fails: bool,
}

/// Decide the guard outcome.
///
/// - `warn` never fails.
/// - `block` fails whenever any scope is present.
/// - `require-override` fails unless an override is present, made only of
///   allowed tokens, and covers every scope (or contains [`WILDCARD`]).
///
/// A token outside a non-empty allow-list invalidates the whole override,
/// even if the allowed tokens alone would cover the scopes.
#[must_use]
pub fn decide(
    mode: GuardMode,
    policy: &PolicyOverridesConfig,
    scopes: &BTreeSet<Scope>,
    resolved: &ResolvedOverride,
) -> PolicyDecision {
    let enabled = policy.require_trailer || mode == GuardMode::RequireOverride;
    let allowed: BTreeSet<String> = policy
        .allowed_values
        .iter()
        .map(|v| v.to_lowercase())
        .collect();
    let values: BTreeSet<&str> = resolved.values.iter().map(String::as_str).collect();
    let invalid: Vec<&str> = if allowed.is_empty() {
        Vec::new()
    } else {
        values
            .iter()
            .copied()
            .filter(|v| !allowed.contains(*v))
            .collect()
    };
    let missing: Vec<&str> = scopes
        .iter()
        .map(|s| s.token())
        .filter(|t| !values.contains(t))
        .collect();
    let covers = values.contains(WILDCARD) || missing.is_empty();
    let present = !values.is_empty();
    let has_violations = !scopes.is_empty();
    let required = enabled && has_violations;

    let error = if has_violations && present && !invalid.is_empty() {
        let mut msg = format!("Override values {invalid:?} are not permitted.");
        if !allowed.is_empty() {
            let list: Vec<&str> = allowed.iter().map(String::as_str).collect();
            msg.push_str(&format!(" Allowed: {}.", list.join(", ")));
        }
        Some(msg)
    } else if required && !present {
        Some(format!(
            "Override required for violation scopes: {}.",
            join_scopes(scopes)
        ))
    } else if required && !covers {
        Some(format!(
            "Override does not cover all violation scopes; missing: {}",
            missing.join(", ")
        ))
    } else {
        None
    };

    let applied = required && present && covers && invalid.is_empty();
    let fails = match mode {
        GuardMode::Warn => false,
        GuardMode::Block => has_violations,
        GuardMode::RequireOverride => has_violations && !applied,
    };
    PolicyDecision {
        enabled,
        applied,
        error,
        fails,
    }
}

fn join_scopes(scopes: &BTreeSet<Scope>) -> String {
    let tokens: Vec<&str> = scopes.iter().map(|s| s.token()).collect();
    tokens.join(", ")
}
