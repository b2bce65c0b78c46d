//! Change levels and next-version derivation.
//!
//! Every attributed commit is classified into a [`ChangeLevel`]; the highest
//! level across a library's commits decides the semver increment.

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::commit::ConventionalCommit;

/// Errors from version operations.
#[derive(Error, Debug)]
pub enum VersionError {
    /// A version string is not valid semver.
    #[error("invalid semver {version:?}: {source}")]
    Unparsable {
        /// The rejected input.
        version: String,
        /// Parser error.
        #[source]
        source: semver::Error,
    },

    /// Incrementing a component would exceed `u64::MAX`.
    #[error("cannot apply a {level} increment to {version}: component overflows")]
    Overflow {
        /// The version being incremented.
        version: Version,
        /// The requested increment.
        level: ChangeLevel,
    },
}

/// Result alias for version operations.
pub type VersionResult<T> = Result<T, VersionError>;

/// How much a set of commits changes a library.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ChangeLevel {
    /// Nothing releasable.
    #[default]
    None,
    /// Patch release (x.y.Z).
    Patch,
    /// Minor release (x.Y.0).
    Minor,
    /// Major release (X.0.0).
    Major,
}

impl std::fmt::Display for ChangeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Patch => write!(f, "patch"),
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
        }
    }
}

/// Change level of a single commit.
///
/// Nested commits are capped at minor: they describe upstream API changes
/// that regenerate additively.
pub fn classify_change_level(commit: &ConventionalCommit) -> ChangeLevel {
    if commit.is_nested {
        return ChangeLevel::Minor;
    }
    if commit.is_breaking {
        return ChangeLevel::Major;
    }
    match commit.commit_type.as_str() {
        "feat" => ChangeLevel::Minor,
        "fix" => ChangeLevel::Patch,
        _ => ChangeLevel::None,
    }
}

/// Highest level across `commits`; [`ChangeLevel::None`] when empty.
pub fn highest_change_level<'a, I>(commits: I) -> ChangeLevel
where
    I: IntoIterator<Item = &'a ConventionalCommit>,
{
    commits
        .into_iter()
        .map(classify_change_level)
        .max()
        .unwrap_or_default()
}

/// Apply a change level to a version.
///
/// [`ChangeLevel::None`] returns the version unchanged; any increment resets
/// lower components and drops pre-release and build metadata. Fails rather
/// than wrapping when the incremented component is already `u64::MAX`.
pub fn next_version(current: &Version, level: ChangeLevel) -> VersionResult<Version> {
    let bump = |component: u64| {
        component.checked_add(1).ok_or_else(|| VersionError::Overflow {
            version: current.clone(),
            level,
        })
    };
    Ok(match level {
        ChangeLevel::None => current.clone(),
        ChangeLevel::Patch => Version::new(current.major, current.minor, bump(current.patch)?),
        ChangeLevel::Minor => Version::new(current.major, bump(current.minor)?, 0),
        ChangeLevel::Major => Version::new(bump(current.major)?, 0, 0),
    })
}

/// Parse a version string, stripping an optional `v` prefix.
pub fn parse_version(s: &str) -> VersionResult<Version> {
    let trimmed = s.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed).map_err(|source| VersionError::Unparsable {
        version: s.to_string(),
        source,
    })
}

/// Next version for a library currently at `current`.
#[instrument(skip(commits))]
pub fn derive_next_version(commits: &[ConventionalCommit], current: &str) -> VersionResult<Version> {
    let current = parse_version(current)?;
    let level = highest_change_level(commits);
    let next = next_version(&current, level)?;
    debug!(%level, %next, "derived next version");
    Ok(next)
}

/// Apply an administrative `next_version` override.
///
/// The override wins only when it is strictly greater than the derived
/// version and there is something to release.
pub fn apply_override(
    derived: Version,
    level: ChangeLevel,
    override_version: Option<&str>,
) -> VersionResult<Version> {
    let Some(raw) = override_version else {
        return Ok(derived);
    };
    if level == ChangeLevel::None {
        debug!(override_version = raw, "ignoring override with nothing to release");
        return Ok(derived);
    }
    let requested = parse_version(raw)?;
    if requested > derived {
        debug!(%requested, %derived, "using next_version override");
        Ok(requested)
    } else {
        debug!(%requested, %derived, "override does not exceed derived version");
        Ok(derived)
    }
}
