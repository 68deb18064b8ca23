//! Forked repository configuration (`forked.toml`).
//!
//! Defines the typed configuration for `forked.toml` at the repository root:
//! upstream location, branch naming, the global patch order, features and
//! overlay profiles, guard policy, path bias, worktree placement, and policy
//! overrides. The value is immutable once loaded and is passed by reference
//! into every operation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// File name of the configuration, relative to the repository root.
pub const CONFIG_FILE: &str = "forked.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level forked configuration.
///
/// Every table and field is optional; missing values take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForkedConfig {
    /// Schema version of the file.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Where upstream lives.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Local branch naming.
    #[serde(default)]
    pub branches: BranchesConfig,

    /// The global patch order.
    #[serde(default)]
    pub patches: PatchesConfig,

    /// Named groups of patch branches.
    #[serde(default)]
    pub features: BTreeMap<String, FeatureConfig>,

    /// Named groups of features (overlay profiles).
    #[serde(default)]
    pub overlays: BTreeMap<String, OverlayProfileConfig>,

    /// Guard policy.
    #[serde(default)]
    pub guards: GuardsConfig,

    /// Conflict auto-resolution preferences.
    #[serde(default)]
    pub path_bias: PathBiasConfig,

    /// Worktree placement for overlay builds.
    #[serde(default)]
    pub worktree: WorktreeConfig,

    /// Override trailer settings for the guard.
    #[serde(default)]
    pub policy_overrides: PolicyOverridesConfig,
}

impl Default for ForkedConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            upstream: UpstreamConfig::default(),
            branches: BranchesConfig::default(),
            patches: PatchesConfig::default(),
            features: BTreeMap::new(),
            overlays: BTreeMap::new(),
            guards: GuardsConfig::default(),
            path_bias: PathBiasConfig::default(),
            worktree: WorktreeConfig::default(),
            policy_overrides: PolicyOverridesConfig::default(),
        }
    }
}

const fn default_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Upstream / branches / patches
// ---------------------------------------------------------------------------

/// The upstream remote and branch that trunk mirrors.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Remote name (default: `"upstream"`).
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Branch on the remote (default: `"main"`).
    #[serde(default = "default_upstream_branch")]
    pub branch: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: default_upstream_branch(),
        }
    }
}

fn default_remote() -> String {
    "upstream".to_owned()
}

fn default_upstream_branch() -> String {
    "main".to_owned()
}

/// Local branch naming.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BranchesConfig {
    /// The branch that mirrors upstream (default: `"trunk"`).
    #[serde(default = "default_trunk")]
    pub trunk: String,

    /// Prefix for overlay branches (default: `"overlay/"`).
    #[serde(default = "default_overlay_prefix")]
    pub overlay_prefix: String,
}

impl Default for BranchesConfig {
    fn default() -> Self {
        Self {
            trunk: default_trunk(),
            overlay_prefix: default_overlay_prefix(),
        }
    }
}

fn default_trunk() -> String {
    "trunk".to_owned()
}

fn default_overlay_prefix() -> String {
    "overlay/".to_owned()
}

/// The global patch order. Replay order and every selection is projected
/// through this list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PatchesConfig {
    /// Patch branch names, in replay order.
    #[serde(default)]
    pub order: Vec<String>,
}

// ---------------------------------------------------------------------------
// Features / overlays
// ---------------------------------------------------------------------------

/// A named group of patch branches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    /// Patch branches that make up the feature.
    #[serde(default)]
    pub patches: Vec<String>,

    /// Sentinels that apply whenever this feature is active.
    #[serde(default)]
    pub sentinels: SentinelConfig,
}

/// A named, ordered group of features.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayProfileConfig {
    /// Feature names, in order.
    #[serde(default)]
    pub features: Vec<String>,
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// How guard violations affect the exit status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardMode {
    /// Report only; never fail.
    #[default]
    Warn,
    /// Fail on any violation.
    Block,
    /// Fail unless a valid override covers every violation scope.
    RequireOverride,
}

impl fmt::Display for GuardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warn => write!(f, "warn"),
            Self::Block => write!(f, "block"),
            Self::RequireOverride => write!(f, "require-override"),
        }
    }
}

impl FromStr for GuardMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "block" => Ok(Self::Block),
            "require-override" | "require_override" => Ok(Self::RequireOverride),
            other => Err(format!(
                "unknown guard mode '{other}' (expected warn, block, or require-override)"
            )),
        }
    }
}

/// Guard settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GuardsConfig {
    /// Exit-status policy (default: `warn`).
    #[serde(default)]
    pub mode: GuardMode,

    /// Run the both-touched check (default: true).
    #[serde(default = "default_true")]
    pub both_touched: bool,

    /// Global sentinel globs.
    #[serde(default)]
    pub sentinels: SentinelConfig,

    /// Diff size ceilings.
    #[serde(default)]
    pub size_caps: SizeCapsConfig,
}

impl Default for GuardsConfig {
    fn default() -> Self {
        Self {
            mode: GuardMode::default(),
            both_touched: true,
            sentinels: SentinelConfig::default(),
            size_caps: SizeCapsConfig::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Sentinel glob pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SentinelConfig {
    /// Paths whose overlay content must equal trunk's.
    #[serde(default)]
    pub must_match_upstream: Vec<String>,

    /// Paths whose overlay content must differ from trunk's.
    #[serde(default)]
    pub must_diverge_from_upstream: Vec<String>,
}

impl SentinelConfig {
    /// Whether no sentinel globs are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must_match_upstream.is_empty() && self.must_diverge_from_upstream.is_empty()
    }

    /// Append `other`'s globs, skipping ones already present.
    pub fn extend_from(&mut self, other: &Self) {
        extend_unique(&mut self.must_match_upstream, &other.must_match_upstream);
        extend_unique(
            &mut self.must_diverge_from_upstream,
            &other.must_diverge_from_upstream,
        );
    }
}

fn extend_unique(into: &mut Vec<String>, from: &[String]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

/// Diff size ceilings. Zero disables a ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SizeCapsConfig {
    /// Maximum added + removed lines.
    #[serde(default)]
    pub max_loc: u64,

    /// Maximum number of changed files.
    #[serde(default)]
    pub max_files: u64,
}

impl SizeCapsConfig {
    /// Whether at least one ceiling is set.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_loc > 0 || self.max_files > 0
    }
}

// ---------------------------------------------------------------------------
// Path bias / worktree / overrides
// ---------------------------------------------------------------------------

/// Glob lists that pick a side when a replay conflicts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PathBiasConfig {
    /// Keep trunk's version.
    #[serde(default)]
    pub ours: Vec<String>,

    /// Keep the patch's version.
    #[serde(default)]
    pub theirs: Vec<String>,
}

/// Worktree placement.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorktreeConfig {
    /// Build overlays in dedicated worktrees (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Root directory for overlay worktrees, relative to the repository
    /// root unless absolute (default: `".forked/worktrees"`).
    #[serde(default = "default_worktree_root")]
    pub root: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_worktree_root(),
        }
    }
}

fn default_worktree_root() -> String {
    ".forked/worktrees".to_owned()
}

/// Override trailer settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverridesConfig {
    /// Evaluate overrides even outside `require-override` mode.
    #[serde(default)]
    pub require_trailer: bool,

    /// Trailer key carrying override scopes (default: `"Forked-Override"`).
    #[serde(default = "default_trailer_key")]
    pub trailer_key: String,

    /// Permitted override values; empty permits anything.
    #[serde(default)]
    pub allowed_values: Vec<String>,
}

impl Default for PolicyOverridesConfig {
    fn default() -> Self {
        Self {
            require_trailer: false,
            trailer_key: default_trailer_key(),
            allowed_values: Vec::new(),
        }
    }
}

fn default_trailer_key() -> String {
    "Forked-Override".to_owned()
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl ForkedConfig {
    /// Full branch name of the overlay with this id.
    #[must_use]
    pub fn overlay_branch(&self, id: &str) -> String {
        format!("{}{id}", self.branches.overlay_prefix)
    }

    /// Strip the overlay prefix from a branch name, if present.
    #[must_use]
    pub fn overlay_id<'a>(&self, branch: &'a str) -> &'a str {
        branch
            .strip_prefix(self.branches.overlay_prefix.as_str())
            .unwrap_or(branch)
    }

    /// The remote-tracking ref for upstream, e.g. `refs/remotes/upstream/main`.
    #[must_use]
    pub fn upstream_ref(&self) -> String {
        format!(
            "refs/remotes/{}/{}",
            self.upstream.remote, self.upstream.branch
        )
    }

    /// Human form of the upstream, e.g. `upstream/main`.
    #[must_use]
    pub fn upstream_display(&self) -> String {
        format!("{}/{}", self.upstream.remote, self.upstream.branch)
    }

    /// Global sentinels plus the sentinels of each named feature.
    ///
    /// Unknown feature names contribute nothing.
    #[must_use]
    pub fn effective_sentinels(&self, active_features: &[String]) -> SentinelConfig {
        let mut merged = self.guards.sentinels.clone();
        for name in active_features {
            if let Some(feature) = self.features.get(name) {
                merged.extend_from(&feature.sentinels);
            }
        }
        merged
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading or validating a forked configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ForkedConfig {
    /// Load, parse, and validate a configuration file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file is missing or unreadable, is not
    /// valid TOML, contains unknown fields, or fails [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("{CONFIG_FILE} not found"),
                });
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        let cfg = Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })?;
        cfg.validate().map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })?;
        Ok(cfg)
    }

    /// Load `forked.toml` from a repository root.
    ///
    /// # Errors
    /// See [`load`](Self::load).
    pub fn load_from_repo(root: &Path) -> Result<Self, ConfigError> {
        Self::load(&root.join(CONFIG_FILE))
    }

    /// Parse configuration from a TOML string without validating it.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }

    /// Check cross-references between the patch order, features, and profiles.
    ///
    /// # Errors
    /// Returns `ConfigError` for a duplicate entry in `patches.order`, a
    /// feature naming a patch outside the order, or a profile naming an
    /// unknown feature.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let mut seen = HashSet::new();
        for patch in &self.patches.order {
            if !seen.insert(patch.as_str()) {
                problems.push(format!("patches.order lists '{patch}' more than once"));
            }
        }

        for (name, feature) in &self.features {
            for patch in &feature.patches {
                if !seen.contains(patch.as_str()) {
                    problems.push(format!(
                        "feature '{name}' references '{patch}', which is not in patches.order"
                    ));
                }
            }
        }

        for (name, profile) in &self.overlays {
            for feature in &profile.features {
                if !self.features.contains_key(feature) {
                    problems.push(format!(
                        "overlay '{name}' references unknown feature '{feature}'"
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError {
                path: None,
                message: problems.join("; "),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
