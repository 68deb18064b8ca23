//! Selection resolver.
//!
//! Turns a request (overlay profile, explicit features, include/exclude
//! globs) into the concrete, ordered list of patch branches to replay.
//!
//! The output is always projected through `patches.order`: features and
//! profiles choose branches but never reorder them, and the result does not
//! depend on map or set iteration order.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::ForkedConfig;
use crate::globs::BranchGlob;

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// What the caller asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Overlay profile name. Takes precedence over `features`.
    pub overlay: Option<String>,
    /// Explicit feature names, in the caller's order.
    pub features: Vec<String>,
    /// Branch globs to force-include.
    pub include: Vec<String>,
    /// Branch globs to remove (applied after include).
    pub exclude: Vec<String>,
}

impl SelectionRequest {
    /// Request the named overlay profile.
    #[must_use]
    pub fn overlay(name: impl Into<String>) -> Self {
        Self {
            overlay: Some(name.into()),
            ..Self::default()
        }
    }

    /// Request an explicit feature list.
    #[must_use]
    pub fn features<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            features: names.iter().map(|n| n.as_ref().to_owned()).collect(),
            ..Self::default()
        }
    }
}

/// Where the base feature set came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SelectionSource {
    /// An overlay profile.
    Overlay(String),
    /// An explicit feature list.
    Features,
    /// Neither; the base set is empty.
    Default,
}

impl fmt::Display for SelectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlay(name) => write!(f, "overlay:{name}"),
            Self::Features => write!(f, "features"),
            Self::Default => write!(f, "default"),
        }
    }
}

impl FromStr for SelectionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "features" => Ok(Self::Features),
            "default" => Ok(Self::Default),
            other => other
                .strip_prefix("overlay:")
                .map(|name| Self::Overlay(name.to_owned()))
                .ok_or_else(|| format!("unknown selection source '{other}'")),
        }
    }
}

impl Serialize for SelectionSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SelectionSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A resolved selection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Active features, in request order.
    pub features: Vec<String>,
    /// Patch branches to replay, a sub-sequence of `patches.order`.
    pub patches: Vec<String>,
    /// The overlay profile, if one was requested.
    pub overlay_profile: Option<String>,
    /// Include globs as given.
    pub include: Vec<String>,
    /// Exclude globs as given.
    pub exclude: Vec<String>,
    /// Include globs that matched no branch.
    pub unmatched_include: Vec<String>,
    /// Exclude globs that matched no branch.
    pub unmatched_exclude: Vec<String>,
    /// Where the base feature set came from.
    pub source: SelectionSource,
    /// Patch branch to the active features that contributed it.
    /// Branches added only by an include glob are absent.
    pub patch_feature_map: BTreeMap<String, Vec<String>>,
}

// ---------------------------------------------------------------------------
// ResolutionError
// ---------------------------------------------------------------------------

/// A request that names something the configuration does not define.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolutionError {
    /// No feature with this name.
    UnknownFeature {
        /// The requested name.
        name: String,
        /// Defined feature names.
        known: Vec<String>,
    },
    /// No overlay profile with this name.
    UnknownProfile {
        /// The requested name.
        name: String,
        /// Defined profile names.
        known: Vec<String>,
    },
    /// An include/exclude glob failed to compile.
    InvalidPattern {
        /// The glob as given.
        pattern: String,
        /// Why it is invalid.
        reason: String,
    },
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFeature { name, known } => {
                write!(f, "unknown feature '{name}'")?;
                write_known(f, "features", known)
            }
            Self::UnknownProfile { name, known } => {
                write!(f, "unknown overlay profile '{name}'")?;
                write_known(f, "profiles", known)
            }
            Self::InvalidPattern { pattern, reason } => {
                write!(f, "invalid branch pattern '{pattern}': {reason}")
            }
        }
    }
}

fn write_known(f: &mut fmt::Formatter<'_>, what: &str, known: &[String]) -> fmt::Result {
    if known.is_empty() {
        write!(f, " (no {what} are defined)")
    } else {
        write!(f, " (known {what}: {})", known.join(", "))
    }
}

impl std::error::Error for ResolutionError {}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolve a request against the configuration.
///
/// Pure: reads only `cfg` and `request`.
///
/// # Errors
/// Returns [`ResolutionError`] for an unknown profile or feature, or an
/// include/exclude glob that does not compile.
pub fn resolve(cfg: &ForkedConfig, request: &SelectionRequest) -> Result<Selection, ResolutionError> {
    let (base_features, source) = base_features(cfg, request)?;

    let include_hits = match_patterns(&cfg.patches.order, &request.include)?;
    let exclude_hits = match_patterns(&cfg.patches.order, &request.exclude)?;

    // Base patch set and which features contributed each branch.
    let mut contributors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for feature in &base_features {
        if let Some(def) = cfg.features.get(feature.as_str()) {
            for patch in &def.patches {
                let entry = contributors.entry(patch.as_str()).or_default();
                if !entry.contains(&feature.as_str()) {
                    entry.push(feature.as_str());
                }
            }
        }
    }

    let mut selected: HashSet<&str> = contributors.keys().copied().collect();
    for (_, hits) in &include_hits {
        selected.extend(hits.iter().copied());
    }
    for (_, hits) in &exclude_hits {
        for hit in hits {
            selected.remove(hit);
        }
    }

    let mut patches: Vec<String> = Vec::new();
    for branch in &cfg.patches.order {
        if selected.contains(branch.as_str()) && !patches.contains(branch) {
            patches.push(branch.clone());
        }
    }

    let mut patch_feature_map = BTreeMap::new();
    for patch in &patches {
        if let Some(features) = contributors.get(patch.as_str()) {
            patch_feature_map.insert(
                patch.clone(),
                features.iter().map(|f| (*f).to_owned()).collect(),
            );
        }
    }

    // A feature stays active while it still contributes a branch. Features
    // defined with no patches stay active as labels.
    let features = base_features
        .into_iter()
        .filter(|name| {
            cfg.features.get(name).is_some_and(|def| {
                def.patches.is_empty() || def.patches.iter().any(|p| patches.contains(p))
            })
        })
        .collect();

    Ok(Selection {
        features,
        patches,
        overlay_profile: request.overlay.clone(),
        include: request.include.clone(),
        exclude: request.exclude.clone(),
        unmatched_include: unmatched(&include_hits),
        unmatched_exclude: unmatched(&exclude_hits),
        source,
        patch_feature_map,
    })
}

fn base_features(
    cfg: &ForkedConfig,
    request: &SelectionRequest,
) -> Result<(Vec<String>, SelectionSource), ResolutionError> {
    let (names, source) = if let Some(profile) = &request.overlay {
        let def = cfg
            .overlays
            .get(profile)
            .ok_or_else(|| ResolutionError::UnknownProfile {
                name: profile.clone(),
                known: cfg.overlays.keys().cloned().collect(),
            })?;
        (def.features.clone(), SelectionSource::Overlay(profile.clone()))
    } else if request.features.is_empty() {
        (Vec::new(), SelectionSource::Default)
    } else {
        (request.features.clone(), SelectionSource::Features)
    };

    let mut deduped: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().to_owned();
        if name.is_empty() || deduped.contains(&name) {
            continue;
        }
        if !cfg.features.contains_key(&name) {
            return Err(ResolutionError::UnknownFeature {
                name,
                known: cfg.features.keys().cloned().collect(),
            });
        }
        deduped.push(name);
    }
    Ok((deduped, source))
}

/// For each pattern (in request order), the branches of `order` it matches.
fn match_patterns<'a>(
    order: &'a [String],
    patterns: &'a [String],
) -> Result<Vec<(&'a str, Vec<&'a str>)>, ResolutionError> {
    patterns
        .iter()
        .map(|pattern| {
            let glob = BranchGlob::new(pattern).map_err(|e| ResolutionError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.msg.to_owned(),
            })?;
            let hits = order
                .iter()
                .filter(|branch| glob.matches(branch))
                .map(String::as_str)
                .collect();
            Ok((pattern.as_str(), hits))
        })
        .collect()
}

fn unmatched(hits: &[(&str, Vec<&str>)]) -> Vec<String> {
    hits.iter()
        .filter(|(_, matched)| matched.is_empty())
        .map(|(pattern, _)| (*pattern).to_owned())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
