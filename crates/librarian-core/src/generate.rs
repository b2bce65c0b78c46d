//! The generation run.
//!
//! For each target library: configure it if it is new, decide whether its
//! API surfaces changed, generate into a scratch directory, merge the
//! output into the checkout, then optionally build and test. A build or
//! test failure restores the library's source roots. Once every library
//! has a terminal state the batch is aggregated; unless the whole batch
//! failed, state is saved and the change is committed, pushed and proposed.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::commit::CommitParser;
use crate::container::{ContainerRequest, ContainerRunner};
use crate::freshness::{FreshnessInput, GenerationDecision, decide_generation};
use crate::git::VersionControl;
use crate::hosting::{CodeHostingClient, PullRequest, PullRequestSpec};
use crate::notes::{GenerationChange, NoteHeader, render_generation_notes};
use crate::pipeline::{
    BatchError, BatchOutcome, BatchResult, LibraryError, LibraryErrorKind, LibraryPhase,
    LibraryReport, LibraryStatus, PipelineEvent, RunSettings, compact_timestamp,
};
use crate::state::{LibrarianConfig, LibrarianState, Library, load_config, load_state, save_state};
use crate::version::parse_version;
use crate::workspace::{ScratchDir, WorkspaceLock, merge_output};

/// Options for a generation run.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Only this library. Configured first when absent from state.
    pub library: Option<String>,
    /// API path for a library being configured.
    pub api_path: Option<String>,
    /// Regenerate even when API paths are unchanged.
    pub force: bool,
    /// Build each regenerated library.
    pub build: bool,
    /// Test each regenerated library.
    pub test: bool,
    /// Commit the result on a new branch.
    pub commit: bool,
    /// Push the branch and open a pull request. Implies `commit`.
    pub push: bool,
}

/// Result of a generation run that did not fail outright.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateOutcome {
    /// Per-library results, in processing order.
    pub reports: Vec<LibraryReport>,
    /// IDs by terminal state.
    pub outcome: BatchOutcome,
    /// Pull request body and commit message body.
    pub narrative: String,
    /// Branch the change was committed on.
    pub branch: Option<String>,
    /// Commit created.
    pub commit: Option<String>,
    /// Pull request opened.
    pub pull_request: Option<PullRequest>,
}

/// Collaborators for a generation run.
#[derive(Debug)]
pub struct Generator<'a, R: ?Sized, S: ?Sized, C: ?Sized, H: ?Sized> {
    /// Language repository checkout.
    pub repo: &'a R,
    /// API-source checkout.
    pub source: &'a S,
    /// Language container.
    pub container: &'a C,
    /// Hosting service for the language repository.
    pub hosting: &'a H,
    /// Resolved configuration.
    pub settings: &'a RunSettings,
    /// Commit parser.
    pub parser: &'a CommitParser,
}

/// Everything one library's pass reads besides the collaborators.
struct Pass<'a> {
    config: &'a LibrarianConfig,
    options: &'a GenerateOptions,
    source_head: &'a str,
}

impl<R, S, C, H> Generator<'_, R, S, C, H>
where
    R: VersionControl + ?Sized,
    S: VersionControl + ?Sized,
    C: ContainerRunner + ?Sized,
    H: CodeHostingClient + ?Sized,
{
    /// Run generation.
    ///
    /// Calls `on_event` as each library moves through its phases.
    #[instrument(skip_all, fields(library = ?options.library, force = options.force))]
    pub fn execute(
        &self,
        options: &GenerateOptions,
        mut on_event: impl FnMut(PipelineEvent),
    ) -> BatchResult<GenerateOutcome> {
        let _lock = WorkspaceLock::acquire(&self.settings.state_dir)?;
        let mut state = load_state(&self.settings.state_dir)?;
        let config = load_config(&self.settings.state_dir)?;
        let source_head = self.source.head_hash()?;

        let targets: Vec<String> = match &options.library {
            Some(id) => vec![id.clone()],
            None => state.libraries.iter().map(|lib| lib.id.clone()).collect(),
        };
        info!(targets = targets.len(), %source_head, "starting generation");

        let pass = Pass {
            config: &config,
            options,
            source_head: &source_head,
        };
        let mut reports = Vec::with_capacity(targets.len());
        let mut changes = Vec::new();
        for id in &targets {
            on_event(PipelineEvent::LibraryStarted(id.clone()));
            let result = self.generate_library(&mut state, &pass, id, &mut changes, &mut on_event);
            if let Err(e) = &result {
                warn!(library = %id, error = %e, "library failed");
            }
            let report = LibraryReport::from_result(id, result);
            on_event(PipelineEvent::LibraryFinished(report.clone()));
            reports.push(report);
        }

        let outcome = BatchOutcome::from_reports(&reports);
        outcome.ensure_not_total_failure()?;
        save_state(&self.settings.state_dir, &state)?;

        let image = self.settings.image.as_deref().unwrap_or(&state.image);
        let narrative = render_generation_notes(
            &NoteHeader::new(image),
            &self.settings.source_repo,
            &changes,
            &outcome.failed,
        );

        let mut result = GenerateOutcome {
            reports,
            outcome,
            narrative,
            branch: None,
            commit: None,
            pull_request: None,
        };
        if options.commit || options.push {
            self.propose(&mut result, options.push)?;
        }
        Ok(result)
    }

    /// One library through configure, generate, build and test.
    fn generate_library(
        &self,
        state: &mut LibrarianState,
        pass: &Pass<'_>,
        id: &str,
        changes: &mut Vec<GenerationChange>,
        on_event: &mut impl FnMut(PipelineEvent),
    ) -> Result<LibraryStatus, LibraryError> {
        let mut enter = |phase: LibraryPhase| {
            on_event(PipelineEvent::PhaseStarted {
                library: id.to_string(),
                phase,
            });
            phase
        };

        let mut configured = false;
        if state.library(id).is_none() {
            let at = enter(LibraryPhase::Configuring);
            let library = self.configure(state, id, pass.options.api_path.as_deref(), at)?;
            state.upsert(library);
            configured = true;
        }
        let library = state
            .library(id)
            .cloned()
            .ok_or_else(|| not_configured(id, "missing after configure", LibraryPhase::Configuring))?;

        let at = enter(LibraryPhase::Generating);
        let decision = decide_generation(
            self.source,
            FreshnessInput {
                library: &library,
                head: pass.source_head,
                blocked: pass.config.is_generate_blocked(id),
                force: pass.options.force || configured,
            },
        )
        .map_err(LibraryError::at(at))?;
        let reason = match decision {
            GenerationDecision::Skip { reason } => {
                return Ok(LibraryStatus::Skipped {
                    reason: reason.to_string(),
                });
            }
            GenerationDecision::Regenerate { reason } => reason,
        };

        let upstream = self.upstream_changes(&library, pass.source_head).map_err(LibraryError::at(at))?;

        let output = ScratchDir::new().map_err(LibraryError::at(at))?;
        let request = ContainerRequest {
            api_root: Some(self.source.root()),
            output_dir: Some(output.path()),
            ..ContainerRequest::new(id, state, self.repo.root())
        };
        self.container.generate(&request).map_err(LibraryError::at(at))?;
        let merged = merge_output(
            output.path(),
            self.repo.root(),
            &library,
            &pass.config.global_files_allowlist,
        )
        .map_err(LibraryError::at(at))?;
        debug!(library = id, ?merged, "output merged");

        let request = ContainerRequest::new(id, state, self.repo.root());
        if pass.options.build {
            let at = enter(LibraryPhase::Building);
            self.container
                .build(&request)
                .map_err(|e| self.restore_after(&library, LibraryError::new(at, e)))?;
        }
        if pass.options.test {
            let at = enter(LibraryPhase::Testing);
            self.container
                .test(&request)
                .map_err(|e| self.restore_after(&library, LibraryError::new(at, e)))?;
        }

        if let Some(lib) = state.library_mut(id) {
            lib.last_generated_commit = pass.source_head.to_string();
        }
        changes.extend(upstream);
        Ok(LibraryStatus::Done {
            message: format!("regenerated ({reason})"),
        })
    }

    fn configure(
        &self,
        state: &LibrarianState,
        id: &str,
        api_path: Option<&str>,
        at: LibraryPhase,
    ) -> Result<Library, LibraryError> {
        let api_path = api_path.ok_or_else(|| not_configured(id, "no API path given", at))?;
        let request = ContainerRequest {
            api_root: Some(self.source.root()),
            api_path: Some(api_path),
            ..ContainerRequest::new(id, state, self.repo.root())
        };
        let response = self.container.configure(&request).map_err(LibraryError::at(at))?;
        let mut library = response
            .library
            .ok_or_else(|| not_configured(id, "container returned no library", at))?;
        if library.id != id {
            warn!(requested = id, returned = %library.id, "container renamed library");
            library.id = id.to_string();
        }
        library.version = parse_version(&library.version)
            .map_err(LibraryError::at(at))?
            .to_string();
        info!(library = id, version = %library.version, "configured new library");
        Ok(library)
    }

    /// Upstream commits touching the library's API paths since it was last generated.
    fn upstream_changes(
        &self,
        library: &Library,
        head: &str,
    ) -> Result<Vec<GenerationChange>, LibraryErrorKind> {
        if library.last_generated_commit.is_empty() {
            return Ok(Vec::new());
        }
        let paths: Vec<String> = library.api_paths().into_iter().map(str::to_string).collect();
        let raw = self
            .source
            .commits_between(Some(&library.last_generated_commit), head, &paths)?;

        let mut changes = Vec::new();
        for commit in &raw {
            match self.parser.parse(commit, &library.id) {
                Ok(parsed) => changes.extend(parsed.into_iter().map(|commit| GenerationChange {
                    library_id: library.id.clone(),
                    commit,
                })),
                Err(e) => debug!(error = %e, "skipping upstream commit"),
            }
        }
        Ok(changes)
    }

    /// Restore the library's source roots, keeping `error` as the outcome.
    fn restore_after(&self, library: &Library, error: LibraryError) -> LibraryError {
        if let Err(e) = self.repo.restore(&library.source_roots) {
            warn!(library = %library.id, error = %e, "failed to restore source roots");
        }
        error
    }

    /// Commit on a new branch, then optionally push and open a pull request.
    fn propose(&self, result: &mut GenerateOutcome, push: bool) -> BatchResult<()> {
        if self.repo.is_clean()? {
            info!("nothing changed, not committing");
            return Ok(());
        }

        let timestamp = compact_timestamp();
        let title = format!("chore: librarian generate pull request: {timestamp}");
        let branch = format!("{}generate-{timestamp}", self.settings.branch_prefix);
        self.repo.checkout_branch(&branch)?;
        let commit = self.repo.commit(&format!("{title}\n\n{}", result.narrative))?;
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
                body: result.narrative.clone(),
                head: branch,
                base: self.settings.base_branch.clone(),
                labels: Vec::new(),
            })
            .map_err(BatchError::external("create pull request"))?;
        info!(url = %pull_request.url, "opened pull request");

        if result.outcome.is_partial_failure() {
            let body = failure_comment("Generation", &result.outcome.failed);
            self.hosting
                .comment(pull_request.number, &body)
                .map_err(BatchError::external("comment"))?;
        }
        result.pull_request = Some(pull_request);
        Ok(())
    }
}

fn not_configured(id: &str, why: &str, at: LibraryPhase) -> LibraryError {
    LibraryError::new(
        at,
        LibraryErrorKind::NotConfigured(id.to_string(), why.to_string()),
    )
}

/// Follow-up comment listing failed libraries.
pub(crate) fn failure_comment(what: &str, failed: &[String]) -> String {
    let mut body = format!("{what} failed for {} libraries:\n", failed.len());
    for id in failed {
        body.push_str("- ");
        body.push_str(id);
        body.push('\n');
    }
    body
}
