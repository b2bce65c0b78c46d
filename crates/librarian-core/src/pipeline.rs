//! The per-library state machine shared by every run, and batch aggregation.
//!
//! Each library walks a fixed sequence of [`LibraryPhase`]s and ends in one
//! [`LibraryStatus`]. A library stops at its first failing phase; the batch
//! carries on. The loop returns a [`BatchOutcome`] value; when every library
//! either failed or was skipped (and at least one failed), the run fails with
//! [`BatchError::TotalFailure`] and nothing is written.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;

use crate::attribution::AttributionError;
use crate::config::Config;
use crate::container::ContainerError;
use crate::error::{ConfigError, ConfigResult};
use crate::freshness::FreshnessError;
use crate::git::GitError;
use crate::notes::{IngestError, RepoRef};
use crate::state::StateError;
use crate::version::VersionError;
use crate::workspace::WorkspaceError;

// ──────────────────────────────────────────────
// Phases and statuses
// ──────────────────────────────────────────────

/// Per-library phases, across all runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryPhase {
    /// Set up a library new to the repository.
    Configuring,
    /// Decide freshness and generate code.
    Generating,
    /// Build generated code.
    Building,
    /// Test generated code.
    Testing,
    /// Attribute commits since the last release.
    Collecting,
    /// Derive the next version.
    Deriving,
    /// Run the container's release staging.
    Staging,
}

impl fmt::Display for LibraryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuring => write!(f, "configure"),
            Self::Generating => write!(f, "generate"),
            Self::Building => write!(f, "build"),
            Self::Testing => write!(f, "test"),
            Self::Collecting => write!(f, "collect"),
            Self::Deriving => write!(f, "derive"),
            Self::Staging => write!(f, "stage"),
        }
    }
}

/// Terminal state of one library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum LibraryStatus {
    /// Every phase succeeded.
    Done {
        /// What changed.
        message: String,
    },
    /// Nothing to do, or blocked.
    Skipped {
        /// Why.
        reason: String,
    },
    /// A phase failed.
    Failed {
        /// The failing phase.
        phase: LibraryPhase,
        /// Error chain.
        message: String,
    },
}

/// Outcome of one library in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryReport {
    /// Library ID.
    pub id: String,
    /// Terminal state.
    #[serde(flatten)]
    pub status: LibraryStatus,
}

impl LibraryReport {
    /// Report from a library's result.
    pub fn from_result(id: &str, result: Result<LibraryStatus, LibraryError>) -> Self {
        let status = result.unwrap_or_else(|e| LibraryStatus::Failed {
            phase: e.phase,
            message: error_chain(&e.source),
        });
        Self {
            id: id.to_string(),
            status,
        }
    }
}

/// Events emitted during a run for progress reporting.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Work on a library has begun.
    LibraryStarted(String),
    /// A library entered a phase.
    PhaseStarted {
        /// Library ID.
        library: String,
        /// Phase entered.
        phase: LibraryPhase,
    },
    /// A library reached its terminal state.
    LibraryFinished(LibraryReport),
}

// ──────────────────────────────────────────────
// Aggregation
// ──────────────────────────────────────────────

/// IDs by terminal state, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Libraries that completed.
    pub succeeded: Vec<String>,
    /// Libraries that failed.
    pub failed: Vec<String>,
    /// Libraries skipped (blocked or nothing to do).
    pub skipped: Vec<String>,
}

impl BatchOutcome {
    /// Fold reports into an outcome.
    pub fn from_reports(reports: &[LibraryReport]) -> Self {
        reports.iter().fold(Self::default(), |mut outcome, report| {
            let bucket = match report.status {
                LibraryStatus::Done { .. } => &mut outcome.succeeded,
                LibraryStatus::Skipped { .. } => &mut outcome.skipped,
                LibraryStatus::Failed { .. } => &mut outcome.failed,
            };
            bucket.push(report.id.clone());
            outcome
        })
    }

    /// Libraries processed.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// At least one failure and nothing succeeded.
    pub fn is_total_failure(&self) -> bool {
        !self.failed.is_empty() && self.failed.len() + self.skipped.len() == self.total()
    }

    /// Some failures alongside at least one success.
    pub fn is_partial_failure(&self) -> bool {
        !self.failed.is_empty() && !self.is_total_failure()
    }

    /// `Err(TotalFailure)` when [`is_total_failure`](Self::is_total_failure).
    pub fn ensure_not_total_failure(&self) -> BatchResult<()> {
        if self.is_total_failure() {
            return Err(BatchError::TotalFailure {
                failed: self.failed.clone(),
                skipped: self.skipped.len(),
                total: self.total(),
            });
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// What went wrong inside one library's phase.
#[derive(Error, Debug)]
pub enum LibraryErrorKind {
    /// Commit attribution failed.
    #[error(transparent)]
    Attribution(#[from] AttributionError),

    /// Version derivation failed.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Freshness lookup failed.
    #[error(transparent)]
    Freshness(#[from] FreshnessError),

    /// A container call failed.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Merging output failed.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// A repository query failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// The library is new and could not be configured.
    #[error("library {0} is not configured: {1}")]
    NotConfigured(String, String),
}

/// A library's failure, tagged with the phase it happened in.
#[derive(Error, Debug)]
#[error("{phase} failed: {source}")]
pub struct LibraryError {
    /// Failing phase.
    pub phase: LibraryPhase,
    /// Cause.
    #[source]
    pub source: LibraryErrorKind,
}

impl LibraryError {
    /// Tag `source` with `phase`.
    pub fn new(phase: LibraryPhase, source: impl Into<LibraryErrorKind>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }

    /// Closure for `map_err` that tags errors with `phase`.
    pub fn at<E: Into<LibraryErrorKind>>(phase: LibraryPhase) -> impl FnOnce(E) -> Self {
        move |source| Self::new(phase, source)
    }
}

/// Errors that abort a whole run.
#[derive(Error, Debug)]
pub enum BatchError {
    /// Every library failed or was skipped.
    #[error("all {total} libraries failed or were skipped (failed: {})", failed.join(", "))]
    TotalFailure {
        /// Failed IDs.
        failed: Vec<String>,
        /// Number skipped.
        skipped: usize,
        /// Number processed.
        total: usize,
    },

    /// Pushing, opening a pull request, tagging or releasing failed.
    #[error("{operation} failed: {message}")]
    ExternalService {
        /// What was attempted.
        operation: String,
        /// Error chain.
        message: String,
    },

    /// The state or config document could not be read or written.
    #[error(transparent)]
    State(#[from] StateError),

    /// The workspace lock could not be taken.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// A repository operation outside any one library failed.
    #[error(transparent)]
    Vcs(#[from] GitError),

    /// The requested library is not in the state document.
    #[error("unknown library: {0}")]
    UnknownLibrary(String),

    /// A merged release pull request body is malformed.
    #[error("release pull request #{number} has a malformed body: {source}")]
    Ingest {
        /// Pull request number.
        number: u64,
        /// Parser error.
        #[source]
        source: IngestError,
    },
}

/// Result alias for whole runs.
pub type BatchResult<T> = Result<T, BatchError>;

impl BatchError {
    /// Closure for `map_err` wrapping any error as [`BatchError::ExternalService`].
    pub fn external<E>(operation: &str) -> impl FnOnce(E) -> Self + '_
    where
        E: std::error::Error,
    {
        move |e| Self::ExternalService {
            operation: operation.to_string(),
            message: error_chain(&e),
        }
    }
}

/// `error: cause: cause` on one line.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

// ──────────────────────────────────────────────
// Settings
// ──────────────────────────────────────────────

/// Everything a run needs from configuration, resolved against a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Absolute state directory.
    pub state_dir: Utf8PathBuf,
    /// Language repository, for links.
    pub repo: RepoRef,
    /// API-source repository, for links.
    pub source_repo: RepoRef,
    /// Generation branch prefix.
    pub branch_prefix: String,
    /// Pull request base branch.
    pub base_branch: String,
    /// Label for staged release pull requests.
    pub pending_label: String,
    /// Label once published.
    pub done_label: String,
    /// Image override for narratives and container calls.
    pub image: Option<String>,
    /// Bulk-change threshold from tool configuration.
    pub bulk_change_threshold: Option<usize>,
}

impl RunSettings {
    /// Resolve `config` for a checkout at `repo_root` hosted at `repo`.
    pub fn from_config(config: &Config, repo_root: &Utf8Path, repo: RepoRef) -> ConfigResult<Self> {
        let source_repo =
            RepoRef::parse(config.source_repo()).ok_or_else(|| ConfigError::Invalid {
                field: "repo.source_repo",
                reason: format!("{:?} is not owner/name", config.source_repo()),
            })?;
        Ok(Self {
            state_dir: config.state_dir_in(repo_root),
            repo,
            source_repo,
            branch_prefix: config.branch_prefix().to_string(),
            base_branch: config.base_branch().to_string(),
            pending_label: config.pending_label().to_string(),
            done_label: config.done_label().to_string(),
            image: config.container_image().map(str::to_string),
            bulk_change_threshold: config.bulk_change_threshold(),
        })
    }
}

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn since_epoch() -> std::time::Duration {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

fn now_secs() -> u64 {
    since_epoch().as_secs()
}

/// Hinnant's civil_from_days: days since the epoch to `(year, month, day)`.
fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097); // day of era [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365; // year of era [0, 399]
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // day of year [0, 365]
    let mp = (5 * doy + 2) / 153; // month index [0, 11]
    let d = doy - (153 * mp + 2) / 5 + 1; // day [1, 31]
    let m = if mp < 10 { mp + 3 } else { mp - 9 }; // month [1, 12]
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

fn format_date(secs: u64) -> String {
    let (y, m, d) = civil_from_days((secs / 86_400) as i64);
    format!("{y:04}-{m:02}-{d:02}")
}

fn format_timestamp(secs: u64) -> String {
    let (y, m, d) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{y:04}{m:02}{d:02}T{:02}{:02}{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

fn format_rfc3339(secs: u64, millis: u32) -> String {
    let rem = secs % 86_400;
    format!(
        "{}T{:02}:{:02}:{:02}.{millis:03}Z",
        format_date(secs),
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Today's date (UTC) as `YYYY-MM-DD`.
pub fn iso_date_today() -> String {
    format_date(now_secs())
}

/// The current UTC time as `YYYYMMDDTHHMMSSZ`, for branch names and titles.
pub fn compact_timestamp() -> String {
    format_timestamp(now_secs())
}

/// The current UTC time as RFC 3339 with milliseconds, for log records.
pub fn rfc3339_now() -> String {
    let now = since_epoch();
    format_rfc3339(now.as_secs(), now.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, status: LibraryStatus) -> LibraryReport {
        LibraryReport {
            id: id.into(),
            status,
        }
    }

    fn done(id: &str) -> LibraryReport {
        report(id, LibraryStatus::Done { message: "ok".into() })
    }

    fn skipped(id: &str) -> LibraryReport {
        report(id, LibraryStatus::Skipped { reason: "blocked".into() })
    }

    fn failed(id: &str) -> LibraryReport {
        report(
            id,
            LibraryStatus::Failed {
                phase: LibraryPhase::Building,
                message: "boom".into(),
            },
        )
    }

    #[test]
    fn blocked_plus_failed_is_total_failure() {
        let outcome = BatchOutcome::from_reports(&[skipped("a"), failed("b")]);
        assert!(outcome.is_total_failure());
        assert!(!outcome.is_partial_failure());
        let err = outcome.ensure_not_total_failure().unwrap_err();
        assert!(matches!(
            err,
            BatchError::TotalFailure { ref failed, skipped: 1, total: 2 } if failed == &["b".to_string()]
        ));
    }

    #[test]
    fn one_success_makes_a_partial_failure() {
        let outcome = BatchOutcome::from_reports(&[failed("a"), done("b")]);
        assert!(!outcome.is_total_failure());
        assert!(outcome.is_partial_failure());
        assert_eq!(outcome.failed, vec!["a"]);
        assert_eq!(outcome.succeeded, vec!["b"]);
        assert!(outcome.ensure_not_total_failure().is_ok());
    }

    #[test]
    fn all_skipped_is_not_a_failure() {
        let outcome = BatchOutcome::from_reports(&[skipped("a"), skipped("b")]);
        assert!(!outcome.is_total_failure());
        assert!(!outcome.is_partial_failure());
        assert_eq!(BatchOutcome::default().total(), 0);
        assert!(!BatchOutcome::default().is_total_failure());
    }

    #[test]
    fn failed_result_becomes_report() {
        let err = LibraryError::new(
            LibraryPhase::Testing,
            LibraryErrorKind::NotConfigured("x".into(), "no api".into()),
        );
        let report = LibraryReport::from_result("x", Err(err));
        assert_eq!(
            report.status,
            LibraryStatus::Failed {
                phase: LibraryPhase::Testing,
                message: "library x is not configured: no api".into(),
            }
        );
    }

    #[test]
    fn report_serializes_flat() {
        let json = serde_json::to_string(&failed("a")).unwrap();
        assert_eq!(
            json,
            r#"{"id":"a","status":"failed","phase":"building","message":"boom"}"#
        );
    }

    #[test]
    fn error_chain_skips_repeated_causes() {
        let err = BatchError::Ingest {
            number: 7,
            source: IngestError::Malformed {
                line: 3,
                message: "bad".into(),
            },
        };
        assert_eq!(
            error_chain(&err),
            "release pull request #7 has a malformed body: line 3: bad"
        );
    }

    #[test]
    fn dates_and_timestamps() {
        assert_eq!(format_date(0), "1970-01-01");
        assert_eq!(format_date(951_782_400), "2000-02-29");
        assert_eq!(format_timestamp(1_735_689_600 + 3_723), "20250101T010203Z");

        let today = iso_date_today();
        assert_eq!(today.len(), 10);
        let year: u32 = today[..4].parse().unwrap();
        assert!((2020..2100).contains(&year));
        assert_eq!(compact_timestamp().len(), 16);

        assert_eq!(format_rfc3339(1_735_689_600 + 3_723, 45), "2025-01-01T01:02:03.045Z");
        assert_eq!(rfc3339_now().len(), 24);
    }

    #[test]
    fn settings_from_default_config() {
        let settings = RunSettings::from_config(
            &Config::default(),
            Utf8Path::new("/repo"),
            RepoRef::new("o", "r"),
        )
        .unwrap();
        assert_eq!(settings.state_dir, "/repo/.librarian");
        assert_eq!(settings.source_repo.slug(), "googleapis/googleapis");
        assert_eq!(settings.pending_label, "release:pending");
        assert!(settings.image.is_none());
    }
}
