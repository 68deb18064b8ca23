//! Overlay guard: audit an overlay against trunk and apply the mode policy.
//!
//! A guard run computes `base = merge-base(trunk, overlay)` and runs three
//! checks (both-touched, sentinels, size caps). The checks that fired become
//! violation scopes; the mode and any override decide the outcome. The
//! report is always written, and a guard log entry appended, before the
//! outcome is enforced.

pub mod checks;
pub mod policy;

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use forked_git::{GitOid, GitRepo};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::artifacts;
use crate::config::{ForkedConfig, GuardMode};
use crate::error::ForkedError;
use crate::provenance::{self, ProvenanceSource, RecoveredSelection};
use crate::selection::SelectionSource;

pub use checks::{SentinelMatches, SentinelReport, SizeReport};
pub use policy::{OverrideSource, PolicyDecision, ResolvedOverride, Scope};

/// Current guard report schema.
pub const REPORT_VERSION: u32 = 2;

/// How many sentinel matches [`render_debug`] lists per rule.
const DEBUG_LIST_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Guard report, schema version 2.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardReport {
    pub report_version: u32,
    /// The overlay rev as given.
    pub overlay: String,
    /// Trunk branch name.
    pub trunk: String,
    pub base: GitOid,
    pub violations: Violations,
    /// Absent when the both-touched check is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub both_touched: Option<Vec<String>>,
    pub sentinels: SentinelReport,
    pub size_caps: SizeReport,
    #[serde(rename = "override")]
    pub override_: OverrideReport,
    pub features: FeaturesReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<GuardDebug>,
}

/// The checks that fired. Only present keys are violations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub both_touched: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinels: Option<SentinelReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_caps: Option<SizeViolation>,
}

impl Violations {
    /// The scope token for each violation present.
    #[must_use]
    pub fn scopes(&self) -> BTreeSet<Scope> {
        let mut scopes = BTreeSet::new();
        if self.both_touched.is_some() {
            scopes.insert(Scope::BothTouched);
        }
        if self.sentinels.is_some() {
            scopes.insert(Scope::Sentinel);
        }
        if self.size_caps.is_some() {
            scopes.insert(Scope::Size);
        }
        scopes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.both_touched.is_none() && self.sentinels.is_none() && self.size_caps.is_none()
    }
}

/// Measured size when a cap was exceeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeViolation {
    pub files: u64,
    pub loc: u64,
}

/// The override block of the report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideReport {
    pub enabled: bool,
    pub source: OverrideSource,
    pub values: Vec<String>,
    pub applied: bool,
    /// Lower-cased allow-list; absent when none is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    /// Tag name when the override came from a tag.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// The features block: which selection produced the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturesReport {
    pub source: ProvenanceSource,
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_source: Option<SelectionSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,
}

impl From<RecoveredSelection> for FeaturesReport {
    fn from(recovered: RecoveredSelection) -> Self {
        Self {
            source: recovered.source,
            values: recovered.features,
            resolver_source: recovered.resolver_source,
            overlay_profile: recovered.overlay_profile,
            patches: recovered.patches,
        }
    }
}

/// Extra detail written with `--verbose`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardDebug {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub both_touched: Option<Vec<String>>,
    pub sentinels: SentinelMatches,
    pub size_caps: SizeTotals,
}

/// Raw diff size, reported whether or not caps are enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeTotals {
    pub files_changed: u64,
    pub loc: u64,
}

/// One line of `.forked/logs/forked-guard.log`.
#[derive(Serialize)]
struct GuardLogEntry<'a> {
    timestamp: DateTime<Utc>,
    overlay: &'a str,
    mode: GuardMode,
    violations: &'a Violations,
    verbose: bool,
    #[serde(rename = "override")]
    override_: OverrideReport,
    features: &'a FeaturesReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<&'a GuardDebug>,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Inputs for [`run_guard`].
#[derive(Clone, Debug, Default)]
pub struct GuardOptions {
    /// Overlay rev; a bare overlay id is also accepted.
    pub overlay: String,
    /// Report path; defaults to `.forked/report.json`. Relative paths
    /// resolve against the repository root.
    pub output: Option<PathBuf>,
    /// Mode override; defaults to `guards.mode`.
    pub mode: Option<GuardMode>,
    /// Record sentinel matches and both-touched paths under `debug`.
    pub verbose: bool,
}

/// Result of a guard run, before the mode is enforced.
#[derive(Clone, Debug)]
pub struct GuardOutcome {
    pub report: GuardReport,
    pub report_path: PathBuf,
    pub mode: GuardMode,
    pub decision: PolicyDecision,
}

impl GuardOutcome {
    /// Turn a failing decision into [`ForkedError::GuardViolation`].
    ///
    /// # Errors
    /// Returns the violation when the mode says the run fails.
    pub fn enforce(self) -> Result<GuardReport, ForkedError> {
        if !self.decision.fails {
            return Ok(self.report);
        }
        let scopes: Vec<&str> = self
            .report
            .violations
            .scopes()
            .iter()
            .map(|s| s.token())
            .collect();
        let message = self.decision.error.unwrap_or_else(|| {
            format!(
                "guard mode '{}' blocks violations in: {}",
                self.mode,
                scopes.join(", ")
            )
        });
        Err(ForkedError::GuardViolation {
            message,
            report: self.report_path,
        })
    }
}

/// Audit an overlay, write the report and guard log, and decide the outcome.
///
/// The returned outcome has not been enforced; call
/// [`GuardOutcome::enforce`] to apply the mode.
///
/// # Errors
/// - [`ForkedError::Precondition`] if the overlay or trunk does not exist,
///   or they share no history.
/// - [`ForkedError::Config`] for an invalid sentinel glob.
/// - [`ForkedError::Io`] if the report or log cannot be written.
#[instrument(skip(repo, cfg, options), fields(overlay = %options.overlay))]
pub fn run_guard(
    repo: &dyn GitRepo,
    cfg: &ForkedConfig,
    options: &GuardOptions,
) -> Result<GuardOutcome, ForkedError> {
    let mode = options.mode.unwrap_or(cfg.guards.mode);
    let (overlay_ref, overlay_tip) = resolve_overlay(repo, cfg, &options.overlay)?;
    let trunk = &cfg.branches.trunk;
    let trunk_tip = repo
        .rev_parse_opt(trunk)?
        .ok_or_else(|| ForkedError::precondition(format!("trunk branch '{trunk}' not found")))?;
    let base = repo.merge_base(trunk_tip, overlay_tip)?.ok_or_else(|| {
        ForkedError::precondition(format!(
            "overlay '{}' shares no history with '{trunk}'",
            options.overlay
        ))
    })?;

    let features: FeaturesReport =
        provenance::lookup(repo, cfg, &overlay_ref, overlay_tip)?.into();

    let mut violations = Violations::default();

    let both_touched = if cfg.guards.both_touched {
        let paths = checks::both_touched(repo, base, trunk_tip, overlay_tip)?;
        if !paths.is_empty() {
            violations.both_touched = Some(paths.clone());
        }
        Some(paths)
    } else {
        None
    };

    let rules = cfg.effective_sentinels(&features.values);
    let (sentinels, matched) = checks::sentinels(repo, &rules, trunk_tip, overlay_tip)?;
    if !sentinels.is_empty() {
        violations.sentinels = Some(sentinels.clone());
    }

    let size_caps = checks::size_caps(repo, cfg.guards.size_caps, trunk_tip, overlay_tip)?;
    if size_caps.violations {
        violations.size_caps = Some(SizeViolation {
            files: size_caps.files_changed,
            loc: size_caps.loc,
        });
    }

    let resolved =
        policy::resolve_override(repo, &cfg.policy_overrides.trailer_key, overlay_tip)?;
    let scopes = violations.scopes();
    let decision = policy::decide(mode, &cfg.policy_overrides, &scopes, &resolved);
    let allowed: Vec<String> = cfg
        .policy_overrides
        .allowed_values
        .iter()
        .map(|v| v.to_lowercase())
        .collect();
    let override_ = OverrideReport {
        enabled: decision.enabled,
        source: resolved.source,
        values: resolved.values,
        applied: decision.applied,
        allowed_values: (!allowed.is_empty()).then_some(allowed),
        tag: resolved.tag,
    };

    let debug = options.verbose.then(|| GuardDebug {
        both_touched: both_touched.clone(),
        sentinels: matched,
        size_caps: SizeTotals {
            files_changed: size_caps.files_changed,
            loc: size_caps.loc,
        },
    });

    let report = GuardReport {
        report_version: REPORT_VERSION,
        overlay: options.overlay.clone(),
        trunk: trunk.clone(),
        base,
        violations,
        both_touched,
        sentinels,
        size_caps,
        override_,
        features,
        debug,
    };

    let root = repo.root();
    let report_path = options
        .output
        .as_ref()
        .map_or_else(|| artifacts::default_report_path(root), |p| absolutize(root, p));
    artifacts::write_json_atomic(&report_path, &report)?;
    append_log(root, &report, mode, options.verbose)?;

    if let Some(err) = &decision.error {
        warn!(error = %err, "override policy");
    }
    info!(
        scopes = ?scopes,
        mode = %mode,
        fails = decision.fails,
        report = %report_path.display(),
        "guard finished"
    );
    Ok(GuardOutcome {
        report,
        report_path,
        mode,
        decision,
    })
}

/// Resolve the overlay as given, falling back to `<prefix><name>`.
fn resolve_overlay(
    repo: &dyn GitRepo,
    cfg: &ForkedConfig,
    name: &str,
) -> Result<(String, GitOid), ForkedError> {
    if let Some(oid) = repo.rev_parse_opt(name)? {
        return Ok((name.to_owned(), oid));
    }
    let branch = cfg.overlay_branch(name);
    if branch != name {
        if let Some(oid) = repo.rev_parse_opt(&branch)? {
            return Ok((branch, oid));
        }
    }
    Err(ForkedError::precondition(format!("overlay '{name}' not found")))
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn append_log(
    root: &Path,
    report: &GuardReport,
    mode: GuardMode,
    verbose: bool,
) -> Result<(), ForkedError> {
    let entry = GuardLogEntry {
        timestamp: Utc::now(),
        overlay: &report.overlay,
        mode,
        violations: &report.violations,
        verbose,
        override_: OverrideReport {
            allowed_values: None,
            ..report.override_.clone()
        },
        features: &report.features,
        debug: report.debug.as_ref(),
    };
    artifacts::append_json_line(&artifacts::guard_log_path(root), &entry)?;
    Ok(())
}

/// Human listing of the verbose detail: both-touched paths, then the first
/// few sentinel matches per rule.
#[must_use]
pub fn render_debug(debug: &GuardDebug) -> String {
    let mut out = String::new();
    if let Some(paths) = debug.both_touched.as_ref().filter(|p| !p.is_empty()) {
        out.push_str("[guard] Both-touched files:\n");
        for path in paths {
            writeln!(out, "  {path}").ok();
        }
    }
    out.push_str("[guard] Sentinel matches:\n");
    for (label, paths) in [
        ("must_match_upstream", &debug.sentinels.matched_must_match),
        ("must_diverge_from_upstream", &debug.sentinels.matched_must_diverge),
    ] {
        writeln!(out, "  {label} ({}):", paths.len()).ok();
        for path in paths.iter().take(DEBUG_LIST_LIMIT) {
            writeln!(out, "    {path}").ok();
        }
        if paths.len() > DEBUG_LIST_LIMIT {
            writeln!(out, "     +{}", paths.len() - DEBUG_LIST_LIMIT).ok();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violations_map_to_scopes() {
        let v = Violations {
            both_touched: Some(vec!["a".into()]),
            sentinels: None,
            size_caps: Some(SizeViolation { files: 9, loc: 900 }),
        };
        let scopes: Vec<Scope> = v.scopes().into_iter().collect();
        assert_eq!(scopes, vec![Scope::BothTouched, Scope::Size]);
        assert!(Violations::default().is_empty());
    }

    #[test]
    fn empty_violations_serialize_to_empty_object() {
        assert_eq!(
            serde_json::to_value(Violations::default()).unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn override_block_shape() {
        let block = OverrideReport {
            enabled: true,
            source: OverrideSource::Tag,
            values: vec!["sentinel".into()],
            applied: true,
            allowed_values: None,
            tag: Some("release-1".into()),
        };
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            serde_json::json!({
                "enabled": true,
                "source": "tag",
                "values": ["sentinel"],
                "applied": true,
                "ref": "release-1",
            })
        );
    }

    #[test]
    fn features_block_omits_empty_fields() {
        let block = FeaturesReport {
            source: ProvenanceSource::Derived,
            values: vec!["contract_update".into()],
            resolver_source: Some(SelectionSource::Overlay("dev".into())),
            overlay_profile: None,
            patches: vec![],
        };
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            serde_json::json!({
                "source": "derived",
                "values": ["contract_update"],
                "resolver_source": "overlay:dev",
            })
        );
    }

    #[test]
    fn render_debug_truncates_long_lists() {
        let debug = GuardDebug {
            both_touched: Some(vec!["README.md".into()]),
            sentinels: SentinelMatches {
                matched_must_match: (0..12).map(|i| format!("api/{i}.json")).collect(),
                matched_must_diverge: vec![],
            },
            size_caps: SizeTotals::default(),
        };
        let text = render_debug(&debug);
        assert!(text.contains("[guard] Both-touched files:\n  README.md\n"));
        assert!(text.contains("must_match_upstream (12):"));
        assert!(text.contains("api/9.json"));
        assert!(!text.contains("api/10.json"));
        assert!(text.contains("+2"));
        assert!(text.contains("must_diverge_from_upstream (0):"));
    }

    #[test]
    fn enforce_uses_policy_message() {
        let outcome = GuardOutcome {
            report: GuardReport {
                report_version: REPORT_VERSION,
                overlay: "overlay/dev".into(),
                trunk: "trunk".into(),
                base: "0123456789abcdef0123456789abcdef01234567".parse().unwrap(),
                violations: Violations {
                    sentinels: Some(SentinelReport {
                        must_match_upstream: vec!["app.py".into()],
                        must_diverge_from_upstream: vec![],
                    }),
                    ..Violations::default()
                },
                both_touched: None,
                sentinels: SentinelReport::default(),
                size_caps: SizeReport::default(),
                override_: OverrideReport {
                    enabled: true,
                    source: OverrideSource::None,
                    values: vec![],
                    applied: false,
                    allowed_values: None,
                    tag: None,
                },
                features: FeaturesReport {
                    source: ProvenanceSource::Derived,
                    values: vec![],
                    resolver_source: None,
                    overlay_profile: None,
                    patches: vec![],
                },
                debug: None,
            },
            report_path: PathBuf::from("/tmp/report.json"),
            mode: GuardMode::RequireOverride,
            decision: PolicyDecision {
                enabled: true,
                applied: false,
                error: Some("Override required for violation scopes: sentinel.".into()),
                fails: true,
            },
        };
        let err = outcome.enforce().unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("Override required"));
    }
}
