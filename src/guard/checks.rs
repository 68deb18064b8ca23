//! The three guard checks: both-touched files, sentinels, and size caps.

use std::collections::BTreeSet;

use forked_git::{GitError, GitOid, GitRepo};
use serde::{Deserialize, Serialize};

use crate::config::{SentinelConfig, SizeCapsConfig};
use crate::conflict::compile;
use crate::error::ForkedError;

/// Paths changed since `base` on both trunk and the overlay, sorted.
///
/// # Errors
/// Returns [`GitError`] if either diff fails.
pub fn both_touched(
    repo: &dyn GitRepo,
    base: GitOid,
    trunk: GitOid,
    overlay: GitOid,
) -> Result<Vec<String>, GitError> {
    let on_trunk: BTreeSet<String> = repo.changed_paths(base, trunk)?.into_iter().collect();
    let on_overlay: BTreeSet<String> = repo.changed_paths(base, overlay)?.into_iter().collect();
    Ok(on_trunk.intersection(&on_overlay).cloned().collect())
}

/// Sentinel violations, split by rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelReport {
    pub must_match_upstream: Vec<String>,
    pub must_diverge_from_upstream: Vec<String>,
}

impl SentinelReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must_match_upstream.is_empty() && self.must_diverge_from_upstream.is_empty()
    }
}

/// Every path that matched a sentinel glob, violating or not.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelMatches {
    pub matched_must_match: Vec<String>,
    pub matched_must_diverge: Vec<String>,
}

/// Evaluate sentinel rules over the union of paths in both trees.
///
/// - A `must_match_upstream` path violates when it is missing on either
///   side or its blobs differ.
/// - A `must_diverge_from_upstream` path violates when it is missing from
///   the overlay, or present on trunk with an identical blob.
///
/// # Errors
/// Returns [`ForkedError::Config`] for an invalid glob or
/// [`ForkedError::Git`] if a tree cannot be listed.
pub fn sentinels(
    repo: &dyn GitRepo,
    rules: &SentinelConfig,
    trunk: GitOid,
    overlay: GitOid,
) -> Result<(SentinelReport, SentinelMatches), ForkedError> {
    if rules.is_empty() {
        return Ok(Default::default());
    }
    let must_match = compile("sentinels.must_match_upstream", &rules.must_match_upstream)?;
    let must_diverge = compile(
        "sentinels.must_diverge_from_upstream",
        &rules.must_diverge_from_upstream,
    )?;

    let trunk_tree = repo.tree_blobs(trunk)?;
    let overlay_tree = repo.tree_blobs(overlay)?;
    let candidates: BTreeSet<&String> = trunk_tree.keys().chain(overlay_tree.keys()).collect();

    let mut report = SentinelReport::default();
    let mut matched = SentinelMatches::default();
    for path in candidates {
        let ours = trunk_tree.get(path);
        let theirs = overlay_tree.get(path);
        if must_match.matches(path) {
            matched.matched_must_match.push(path.clone());
            let same = matches!((ours, theirs), (Some(a), Some(b)) if a == b);
            if !same {
                report.must_match_upstream.push(path.clone());
            }
        }
        if must_diverge.matches(path) {
            matched.matched_must_diverge.push(path.clone());
            let violates = match (ours, theirs) {
                (_, None) => true,
                (Some(a), Some(b)) => a == b,
                (None, Some(_)) => false,
            };
            if violates {
                report.must_diverge_from_upstream.push(path.clone());
            }
        }
    }
    Ok((report, matched))
}

/// Size of the overlay's diff against trunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeReport {
    pub files_changed: u64,
    pub loc: u64,
    /// A configured ceiling was exceeded.
    pub violations: bool,
}

/// Measure `merge-base(trunk, overlay)..overlay`. Returns zeros when no
/// ceiling is configured. Binary files count as changed with zero lines.
///
/// # Errors
/// Returns [`GitError`] if the diff fails.
pub fn size_caps(
    repo: &dyn GitRepo,
    caps: SizeCapsConfig,
    trunk: GitOid,
    overlay: GitOid,
) -> Result<SizeReport, GitError> {
    if !caps.is_enabled() {
        return Ok(SizeReport::default());
    }
    let entries = repo.numstat(trunk, overlay)?;
    let files_changed = entries.len() as u64;
    let loc: u64 = entries
        .iter()
        .map(|e| e.added.unwrap_or(0) + e.removed.unwrap_or(0))
        .sum();
    let violations = (caps.max_files > 0 && files_changed > caps.max_files)
        || (caps.max_loc > 0 && loc > caps.max_loc);
    Ok(SizeReport {
        files_changed,
        loc,
        violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_report_emptiness() {
        let mut report = SentinelReport::default();
        assert!(report.is_empty());
        report.must_diverge_from_upstream.push("brand.txt".into());
        assert!(!report.is_empty());
    }

    #[test]
    fn size_report_serializes_flat() {
        let report = SizeReport {
            files_changed: 3,
            loc: 42,
            violations: true,
        };
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            serde_json::json!({"files_changed": 3, "loc": 42, "violations": true})
        );
    }
}
