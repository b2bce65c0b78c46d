//! Whether a library needs regeneration.
//!
//! The decision compares the content hash of every API path at the commit a
//! library was last generated from against the API-source head. It asks the
//! repository only read-only questions, so running it twice with no new
//! upstream commits gives the same answer.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::git::{GitError, VersionControl};
use crate::state::Library;

/// Errors from the regeneration decision.
#[derive(Error, Debug)]
pub enum FreshnessError {
    /// Looking up a content hash failed.
    #[error("content hash lookup for {path} at {commit} failed: {source}")]
    ContentHash {
        /// API path.
        path: String,
        /// Commit being inspected.
        commit: String,
        /// Underlying version-control failure.
        #[source]
        source: GitError,
    },
}

/// Result alias for the regeneration decision.
pub type FreshnessResult<T> = Result<T, FreshnessError>;

/// Why a library is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Generation is blocked in the config document.
    Blocked,
    /// The library has no API paths.
    NoApis,
    /// No API path changed since the last generation.
    Unchanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked => write!(f, "generation blocked by configuration"),
            Self::NoApis => write!(f, "no API paths"),
            Self::Unchanged => write!(f, "API paths unchanged"),
        }
    }
}

/// Why a library is regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenerateReason {
    /// The caller asked for it.
    Forced,
    /// The library has never been generated.
    NoBaseline,
    /// An API path's content differs from the last generation.
    ApiChanged {
        /// First changed path.
        path: String,
    },
}

impl fmt::Display for RegenerateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => write!(f, "forced"),
            Self::NoBaseline => write!(f, "never generated"),
            Self::ApiChanged { path } => write!(f, "{path} changed"),
        }
    }
}

/// Outcome of [`decide_generation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GenerationDecision {
    /// Leave the library alone.
    Skip {
        /// Why.
        reason: SkipReason,
    },
    /// Regenerate the library.
    Regenerate {
        /// Why.
        reason: RegenerateReason,
    },
}

impl GenerationDecision {
    /// Whether the library should be regenerated.
    pub const fn should_regenerate(&self) -> bool {
        matches!(self, Self::Regenerate { .. })
    }
}

/// Inputs to the decision besides the repository.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessInput<'a> {
    /// Library under consideration.
    pub library: &'a Library,
    /// API-source head commit.
    pub head: &'a str,
    /// Generation blocked by the config document.
    pub blocked: bool,
    /// Regenerate regardless of content.
    pub force: bool,
}

/// Decide whether `input.library` needs regeneration.
///
/// Rules, first match wins: blocked, no APIs, forced, no baseline, then a
/// per-path content hash comparison.
#[instrument(skip_all, fields(library = %input.library.id))]
pub fn decide_generation<V: VersionControl + ?Sized>(
    source: &V,
    input: FreshnessInput<'_>,
) -> FreshnessResult<GenerationDecision> {
    let library = input.library;

    if input.blocked {
        info!("generation blocked by configuration");
        return Ok(GenerationDecision::Skip {
            reason: SkipReason::Blocked,
        });
    }
    if library.apis.is_empty() {
        return Ok(GenerationDecision::Skip {
            reason: SkipReason::NoApis,
        });
    }
    if input.force {
        return Ok(GenerationDecision::Regenerate {
            reason: RegenerateReason::Forced,
        });
    }
    if library.last_generated_commit.is_empty() {
        return Ok(GenerationDecision::Regenerate {
            reason: RegenerateReason::NoBaseline,
        });
    }

    let lookup = |commit: &str, path: &str| {
        source
            .content_hash(commit, path)
            .map_err(|source| FreshnessError::ContentHash {
                path: path.to_string(),
                commit: commit.to_string(),
                source,
            })
    };

    for path in library.api_paths() {
        let before = lookup(&library.last_generated_commit, path)?;
        let after = lookup(input.head, path)?;
        if before != after {
            debug!(path, %before, %after, "API content changed");
            return Ok(GenerationDecision::Regenerate {
                reason: RegenerateReason::ApiChanged {
                    path: path.to_string(),
                },
            });
        }
    }

    debug!("API content unchanged");
    Ok(GenerationDecision::Skip {
        reason: SkipReason::Unchanged,
    })
}
