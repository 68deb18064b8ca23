//! Path and branch glob matching.
//!
//! [`PathGlobs`] follows gitignore-style wildcard rules, which is how path
//! bias and sentinel lists are written:
//!
//! - a pattern without `/` matches a file or directory name at any depth
//!   (`*.lock`, `vendor`);
//! - a pattern containing `/` is anchored at the repository root, and a
//!   leading `/` is dropped (`/api/**`, `docs/index.md`);
//! - a trailing `/` restricts the pattern to directories;
//! - a pattern matching a directory also matches everything below it;
//! - `*` never crosses `/`, `**` spans any number of directories.
//!
//! Branch patterns ([`BranchGlob`]) are plain globs where `*` does
//! cross `/`, so `patch/*` selects `patch/ui/theme`.

use glob::{MatchOptions, Pattern, PatternError};

const PATH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Clone, Debug)]
struct Rule {
    pattern: Pattern,
    anchored: bool,
    dir_only: bool,
}

impl Rule {
    fn parse(raw: &str) -> Result<Option<Self>, PatternError> {
        let trimmed = raw.trim();
        let dir_only = trimmed.ends_with('/');
        let body = trimmed.trim_end_matches('/');
        let anchored = body.contains('/');
        let body = body.trim_start_matches('/');
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            pattern: Pattern::new(body)?,
            anchored,
            dir_only,
        }))
    }

    fn matches(&self, path: &str) -> bool {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let last = components.len().saturating_sub(1);
        if self.anchored {
            (1..=components.len()).any(|k| {
                if self.dir_only && k - 1 == last {
                    return false;
                }
                self.pattern
                    .matches_with(&components[..k].join("/"), PATH_OPTIONS)
            })
        } else {
            components.iter().enumerate().any(|(i, comp)| {
                if self.dir_only && i == last {
                    return false;
                }
                self.pattern.matches_with(comp, PATH_OPTIONS)
            })
        }
    }
}

/// A compiled list of gitignore-style path globs.
#[derive(Clone, Debug, Default)]
pub struct PathGlobs {
    rules: Vec<Rule>,
}

impl PathGlobs {
    /// Compile a glob list. Blank entries are ignored.
    ///
    /// # Errors
    /// Returns the first [`PatternError`] for an invalid glob.
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self, PatternError> {
        let mut rules = Vec::with_capacity(globs.len());
        for raw in globs {
            if let Some(rule) = Rule::parse(raw.as_ref())? {
                rules.push(rule);
            }
        }
        Ok(Self { rules })
    }

    /// Whether the list has no usable patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any pattern matches the repository-relative `path`.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(path))
    }
}

/// A branch-name glob where `*` may cross `/`.
#[derive(Clone, Debug)]
pub struct BranchGlob(Pattern);

impl BranchGlob {
    /// Compile a branch glob.
    ///
    /// # Errors
    /// Returns [`PatternError`] if `pattern` is not a valid glob.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Ok(Self(Pattern::new(pattern)?))
    }

    /// Whether `branch` matches.
    #[must_use]
    pub fn matches(&self, branch: &str) -> bool {
        self.0.matches(branch)
    }
}
