//! The release staging run.
//!
//! Every library goes through collect, derive and stage. Collection
//! attributes commits since the library's last release tag; derivation
//! turns them into the next version; staging lets the container update
//! version files and changelogs. Libraries with nothing releasable are
//! skipped. A staging failure restores the library's source roots and
//! leaves its state untouched.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::attribution::{attribute_commits, resolve_library_ids};
use crate::commit::{CommitParser, ConventionalCommit};
use crate::container::{ContainerRequest, ContainerRunner};
use crate::generate::failure_comment;
use crate::git::VersionControl;
use crate::hosting::{CodeHostingClient, PullRequest, PullRequestSpec};
use crate::notes::{NoteHeader, ReleaseNotes, SectionHeadings, StagedRelease};
use crate::pipeline::{
    BatchError, BatchOutcome, BatchResult, LibraryError, LibraryErrorKind, LibraryPhase,
    LibraryReport, LibraryStatus, PipelineEvent, RunSettings, compact_timestamp, iso_date_today,
};
use crate::state::{
    LibrarianConfig, LibrarianState, Library, ReleaseNoteCommit, load_config, load_state,
    save_state,
};
use crate::version::{ChangeLevel, apply_override, highest_change_level, next_version, parse_version};
use crate::workspace::WorkspaceLock;

/// Options for a staging run.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// Only this library.
    pub library: Option<String>,
    /// Commit the result on a new branch.
    pub commit: bool,
    /// Push the branch and open a release pull request. Implies `commit`.
    pub push: bool,
}

/// A library staged for release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRelease {
    /// Library ID.
    pub id: String,
    /// Version being replaced.
    pub previous_version: String,
    /// Version being released.
    pub version: String,
    /// Tag the release will create.
    pub tag: String,
    /// Highest change level among its commits.
    pub level: ChangeLevel,
}

/// Result of a staging run that did not fail outright.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    /// Per-library results, in processing order.
    pub reports: Vec<LibraryReport>,
    /// IDs by terminal state.
    pub outcome: BatchOutcome,
    /// Staged libraries.
    pub releases: Vec<PlannedRelease>,
    /// Release pull request body.
    pub notes: String,
    /// Branch the change was committed on.
    pub branch: Option<String>,
    /// Commit created.
    pub commit: Option<String>,
    /// Pull request opened.
    pub pull_request: Option<PullRequest>,
}

/// Collaborators for a staging run.
#[derive(Debug)]
pub struct Stager<'a, R: ?Sized, C: ?Sized, H: ?Sized> {
    /// Language repository checkout.
    pub repo: &'a R,
    /// Language container.
    pub container: &'a C,
    /// Hosting service for the language repository.
    pub hosting: &'a H,
    /// Resolved configuration.
    pub settings: &'a RunSettings,
    /// Commit parser.
    pub parser: &'a CommitParser,
    /// Release note sections.
    pub headings: &'a SectionHeadings,
}

impl<R, C, H> Stager<'_, R, C, H>
where
    R: VersionControl + ?Sized,
    C: ContainerRunner + ?Sized,
    H: CodeHostingClient + ?Sized,
{
    /// Run release staging.
    #[instrument(skip_all, fields(library = ?options.library))]
    pub fn execute(
        &self,
        options: &StageOptions,
        mut on_event: impl FnMut(PipelineEvent),
    ) -> BatchResult<StageOutcome> {
        let _lock = WorkspaceLock::acquire(&self.settings.state_dir)?;
        let mut state = load_state(&self.settings.state_dir)?;
        let config = load_config(&self.settings.state_dir)?;

        for lib in &mut state.libraries {
            lib.previous_version = lib.version.clone();
            lib.release_triggered = false;
            lib.changes.clear();
        }
        let targets: Vec<Library> = match &options.library {
            Some(id) => vec![
                state
                    .library(id)
                    .cloned()
                    .ok_or_else(|| BatchError::UnknownLibrary(id.clone()))?,
            ],
            None => state.libraries.clone(),
        };
        info!(targets = targets.len(), "starting release staging");

        let mut reports = Vec::with_capacity(targets.len());
        let mut releases = Vec::new();
        for library in &targets {
            let id = library.id.as_str();
            on_event(PipelineEvent::LibraryStarted(id.to_string()));
            let result = self.stage_library(&mut state, &config, library, &mut on_event);
            let result = match result {
                Ok(Some(release)) => {
                    let message = format!("{} -> {}", release.previous_version, release.version);
                    releases.push(release);
                    Ok(LibraryStatus::Done { message })
                }
                Ok(None) => Ok(LibraryStatus::Skipped {
                    reason: skip_reason(&config, id).to_string(),
                }),
                Err(e) => {
                    warn!(library = %id, error = %e, "library failed");
                    Err(e)
                }
            };
            let report = LibraryReport::from_result(id, result);
            on_event(PipelineEvent::LibraryFinished(report.clone()));
            reports.push(report);
        }

        let outcome = BatchOutcome::from_reports(&reports);
        outcome.ensure_not_total_failure()?;
        save_state(&self.settings.state_dir, &state)?;

        let notes = self.render_notes(&state, &config, &outcome.failed);
        let mut result = StageOutcome {
            reports,
            outcome,
            releases,
            notes,
            branch: None,
            commit: None,
            pull_request: None,
        };
        if (options.commit || options.push) && !result.releases.is_empty() {
            self.propose(&mut result, options.push)?;
        }
        Ok(result)
    }

    /// One library through collect, derive and stage. `None` when skipped.
    fn stage_library(
        &self,
        state: &mut LibrarianState,
        config: &LibrarianConfig,
        library: &Library,
        on_event: &mut impl FnMut(PipelineEvent),
    ) -> Result<Option<PlannedRelease>, LibraryError> {
        let id = library.id.as_str();
        let mut enter = |phase: LibraryPhase| {
            on_event(PipelineEvent::PhaseStarted {
                library: id.to_string(),
                phase,
            });
            phase
        };

        if config.is_release_blocked(id) {
            info!(library = id, "release blocked by configuration");
            return Ok(None);
        }

        let at = enter(LibraryPhase::Collecting);
        let commits = self.collect(library, config).map_err(LibraryError::at(at))?;

        let at = enter(LibraryPhase::Deriving);
        let level = highest_change_level(&commits);
        if level == ChangeLevel::None {
            debug!(library = id, commits = commits.len(), "no releasable changes");
            return Ok(None);
        }
        let current = parse_version(&library.version).map_err(LibraryError::at(at))?;
        let derived = next_version(&current, level).map_err(LibraryError::at(at))?;
        let next = apply_override(derived, level, config.next_version(id))
            .map_err(LibraryError::at(at))?;

        let mut staged = library.clone();
        staged.previous_version = library.version.clone();
        staged.version = next.to_string();
        staged.release_triggered = true;
        staged.changes = release_note_commits(&commits);

        let at = enter(LibraryPhase::Staging);
        let mut candidate = state.clone();
        candidate.upsert(staged.clone());
        let request = ContainerRequest::new(id, &candidate, self.repo.root());
        if let Err(e) = self.container.release_stage(&request) {
            if let Err(restore) = self.repo.restore(&library.source_roots) {
                warn!(library = id, error = %restore, "failed to restore source roots");
            }
            return Err(LibraryError::new(at, e));
        }

        let tag = staged.tag_for(&staged.version, config.tag_format(id));
        let release = PlannedRelease {
            id: id.to_string(),
            previous_version: staged.previous_version.clone(),
            version: staged.version.clone(),
            tag,
            level,
        };
        state.upsert(staged);
        info!(library = id, version = %release.version, "staged release");
        Ok(Some(release))
    }

    /// Commits attributed to `library` since its last release tag.
    fn collect(
        &self,
        library: &Library,
        config: &LibrarianConfig,
    ) -> Result<Vec<ConventionalCommit>, LibraryErrorKind> {
        let tag = library.tag_for(&library.version, config.tag_format(&library.id));
        let since = self.repo.resolve(&tag)?;
        if since.is_none() {
            debug!(%tag, "no release tag, reading full history");
        }
        let raw = self
            .repo
            .commits_between(since.as_deref(), "HEAD", &library.source_roots)?;
        Ok(attribute_commits(self.repo, self.parser, library, &raw)?)
    }

    fn render_notes(&self, state: &LibrarianState, config: &LibrarianConfig, failed: &[String]) -> String {
        let staged: Vec<StagedRelease<'_>> = state
            .libraries
            .iter()
            .filter(|lib| lib.release_triggered)
            .map(|lib| {
                let format = config.tag_format(&lib.id);
                StagedRelease {
                    library: lib,
                    previous_tag: lib.tag_for(&lib.previous_version, format),
                    tag: lib.tag_for(&lib.version, format),
                }
            })
            .collect();
        let image = self.settings.image.as_deref().unwrap_or(state.image.as_str());
        let header = NoteHeader::new(image);
        let date = iso_date_today();
        ReleaseNotes {
            header: &header,
            repo: &self.settings.repo,
            date: &date,
            headings: self.headings,
            bulk_change_threshold: config
                .bulk_change_threshold
                .or(self.settings.bulk_change_threshold),
        }
        .render(&staged, failed)
    }

    fn propose(&self, result: &mut StageOutcome, push: bool) -> BatchResult<()> {
        if self.repo.is_clean()? {
            info!("nothing changed, not committing");
            return Ok(());
        }

        let timestamp = compact_timestamp();
        let title = format!("chore: librarian release pull request: {timestamp}");
        let branch = format!("{}release-{timestamp}", self.settings.branch_prefix);
        self.repo.checkout_branch(&branch)?;
        let commit = self.repo.commit(&format!("{title}\n\n{}", result.notes))?;
        result.branch = Some(branch.clone());
        result.commit = Some(commit);

        if !push {
            return Ok(());
        }
        self.repo
            .push(&branch)
            .map_err(BatchError::external("push"))?;
        let pull_request = self
            .hosting
            .create_pull_request(&PullRequestSpec {
                title,
                body: result.notes.clone(),
                head: branch,
                base: self.settings.base_branch.clone(),
                labels: vec![self.settings.pending_label.clone()],
            })
            .map_err(BatchError::external("create pull request"))?;
        info!(url = %pull_request.url, "opened release pull request");

        if result.outcome.is_partial_failure() {
            let body = failure_comment("Release staging", &result.outcome.failed);
            self.hosting
                .comment(pull_request.number, &body)
                .map_err(BatchError::external("comment"))?;
        }
        result.pull_request = Some(pull_request);
        Ok(())
    }
}

fn skip_reason(config: &LibrarianConfig, id: &str) -> &'static str {
    if config.is_release_blocked(id) {
        "release blocked by configuration"
    } else {
        "no releasable changes"
    }
}

/// Persisted form of `commits`, one entry per `(hash, subject)`.
fn release_note_commits(commits: &[ConventionalCommit]) -> Vec<ReleaseNoteCommit> {
    let mut notes: Vec<ReleaseNoteCommit> = Vec::with_capacity(commits.len());
    for commit in commits {
        let seen = notes
            .iter()
            .any(|n| n.commit_hash == commit.commit_hash && n.subject == commit.subject);
        if !seen {
            notes.push(ReleaseNoteCommit::from_commit(commit, &resolve_library_ids(commit)));
        }
    }
    notes
}
