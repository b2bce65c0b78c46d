//! Tagging and releasing merged release pull requests.
//!
//! A release pull request carries its own plan in the body. Once merged,
//! the body is parsed back into per-library releases, each one is tagged
//! at the merge commit, and the pull request label moves from pending to
//! done so the next run does not see it again.

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::hosting::{CodeHostingClient, PullRequest, ReleaseSpec};
use crate::notes::{LibraryRelease, parse_release_body};
use crate::pipeline::{BatchError, BatchResult, RunSettings};
use crate::state::{
    CONFIG_FILE, DEFAULT_TAG_FORMAT, LibrarianConfig, LibrarianState, STATE_FILE, format_tag,
};
use crate::version::parse_version;

/// Options for a publish run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Resolve tags without creating releases or touching labels.
    pub dry_run: bool,
}

/// One library release, created or planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedRelease {
    /// Pull request the release came from.
    pub pull_request: u64,
    /// Library ID.
    pub id: String,
    /// Released version.
    pub version: String,
    /// Tag created at the merge commit.
    pub tag: String,
    /// Release page, absent on a dry run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Result of a publish run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishOutcome {
    /// Pull requests processed, in listing order.
    pub pull_requests: Vec<u64>,
    /// Releases, grouped by pull request.
    pub releases: Vec<PublishedRelease>,
}

/// Collaborators for a publish run.
#[derive(Debug)]
pub struct Publisher<'a, H: ?Sized> {
    /// Hosting service for the language repository.
    pub hosting: &'a H,
    /// Resolved configuration.
    pub settings: &'a RunSettings,
    /// State directory relative to the repository root, as the hosting
    /// service sees it.
    pub state_path: &'a str,
}

impl<H: CodeHostingClient + ?Sized> Publisher<'_, H> {
    /// Tag and release every merged pull request still labelled pending.
    ///
    /// Any hosting failure aborts the run; pull requests already handled
    /// keep their done label. Tags released by an interrupted earlier run
    /// are reused, so rerunning finishes the remaining ones.
    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub fn execute(&self, options: PublishOptions) -> BatchResult<PublishOutcome> {
        let pending = self
            .hosting
            .merged_pull_requests(&self.settings.pending_label)
            .map_err(BatchError::external("list pull requests"))?;
        info!(count = pending.len(), "found merged release pull requests");

        let mut outcome = PublishOutcome::default();
        for pull_request in &pending {
            let releases = self.publish_pull_request(pull_request, options)?;
            outcome.pull_requests.push(pull_request.number);
            outcome.releases.extend(releases);
        }
        Ok(outcome)
    }

    fn publish_pull_request(
        &self,
        pull_request: &PullRequest,
        options: PublishOptions,
    ) -> BatchResult<Vec<PublishedRelease>> {
        let number = pull_request.number;
        let Some(merge_commit) = pull_request.merge_commit.as_deref() else {
            return Err(BatchError::ExternalService {
                operation: format!("read pull request #{number}"),
                message: "merged pull request has no merge commit".to_string(),
            });
        };

        let libraries = parse_release_body(&pull_request.body)
            .map_err(|source| BatchError::Ingest { number, source })?;
        if libraries.is_empty() {
            debug!(number, "no library sections");
        }
        let formats = self.tag_formats(merge_commit)?;

        let mut published = Vec::with_capacity(libraries.len());
        for library in libraries {
            let tag = formats.tag_for(&library);
            let url = if options.dry_run {
                None
            } else {
                Some(self.release(&library, &tag, merge_commit)?)
            };
            published.push(PublishedRelease {
                pull_request: number,
                id: library.id,
                version: library.version,
                tag,
                url,
            });
        }

        if !options.dry_run {
            self.hosting
                .replace_label(number, &self.settings.pending_label, &self.settings.done_label)
                .map_err(BatchError::external("relabel pull request"))?;
            info!(number, releases = published.len(), "published release pull request");
        }
        Ok(published)
    }

    fn release(&self, library: &LibraryRelease, tag: &str, merge_commit: &str) -> BatchResult<String> {
        if let Some(url) = self
            .hosting
            .release_url(tag)
            .map_err(BatchError::external("look up release"))?
        {
            info!(library = %library.id, %tag, %url, "release already exists");
            return Ok(url);
        }
        let prerelease = parse_version(&library.version).is_ok_and(|v| !v.pre.is_empty());
        let url = self
            .hosting
            .create_release(&ReleaseSpec {
                tag: tag.to_string(),
                target_commit: merge_commit.to_string(),
                title: format!("{} {}", library.id, library.version),
                notes: library.notes.clone(),
                prerelease,
            })
            .map_err(BatchError::external("create release"))?;
        info!(library = %library.id, %tag, %url, "created release");
        Ok(url)
    }

    /// State and config documents as of `merge_commit`.
    fn tag_formats(&self, merge_commit: &str) -> BatchResult<TagFormats> {
        let state = match self.fetch(STATE_FILE, merge_commit)? {
            Some((text, path)) => LibrarianState::from_yaml(&text, &path)?,
            None => {
                debug!(merge_commit, "no state document at merge commit");
                LibrarianState::default()
            }
        };
        let config = match self.fetch(CONFIG_FILE, merge_commit)? {
            Some((text, path)) => LibrarianConfig::from_yaml(&text, &path)?,
            None => LibrarianConfig::default(),
        };
        Ok(TagFormats { state, config })
    }

    fn fetch(&self, file: &str, git_ref: &str) -> BatchResult<Option<(String, String)>> {
        let path = if self.state_path.is_empty() {
            file.to_string()
        } else {
            format!("{}/{file}", self.state_path.trim_end_matches('/'))
        };
        let text = self
            .hosting
            .raw_content(&path, git_ref)
            .map_err(BatchError::external("read file at merge commit"))?;
        Ok(text.map(|text| (text, path)))
    }
}

struct TagFormats {
    state: LibrarianState,
    config: LibrarianConfig,
}

impl TagFormats {
    fn tag_for(&self, release: &LibraryRelease) -> String {
        let override_format = self.config.tag_format(&release.id);
        match self.state.library(&release.id) {
            Some(library) => library.tag_for(&release.version, override_format),
            None => format_tag(
                override_format.unwrap_or(DEFAULT_TAG_FORMAT),
                &release.id,
                &release.version,
            ),
        }
    }
}
