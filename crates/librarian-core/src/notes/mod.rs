//! Release and generation narratives.
//!
//! - [`release`] groups pending changes across a release batch and renders
//!   the release pull request body.
//! - [`generation`] renders the generation pull request body as a nested
//!   commit, so it parses back through [`crate::commit::CommitParser`]
//!   once squash-merged.
//! - [`ingest`] reads a merged release pull request body back into
//!   per-library notes.

pub mod generation;
pub mod ingest;
pub mod release;

use std::fmt::Write;

pub use generation::{GenerationChange, render_generation_notes};
pub use ingest::{IngestError, IngestResult, LibraryRelease, parse_release_body};
pub use release::{BulkChange, ReleaseGrouping, ReleaseNotes, StagedRelease, group_changes};

/// A GitHub repository, for commit and compare links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    /// Owner or organisation.
    pub owner: String,
    /// Repository name.
    pub name: String,
}

impl RepoRef {
    /// Build from owner and name.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(slug: &str) -> Option<Self> {
        let (owner, name) = slug.split_once('/')?;
        (!owner.is_empty() && !name.is_empty() && !name.contains('/'))
            .then(|| Self::new(owner, name))
    }

    /// `owner/name`.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Web URL of a commit.
    pub fn commit_url(&self, sha: &str) -> String {
        format!("https://github.com/{}/{}/commit/{sha}", self.owner, self.name)
    }

    /// Web URL comparing two refs.
    pub fn compare_url(&self, from: &str, to: &str) -> String {
        format!(
            "https://github.com/{}/{}/compare/{from}...{to}",
            self.owner, self.name
        )
    }
}

/// Provenance lines at the top of every narrative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteHeader {
    /// Version of this tool.
    pub librarian_version: String,
    /// Language container image.
    pub image: String,
}

impl NoteHeader {
    /// Header for the running tool and `image`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            librarian_version: crate::LIBRARIAN_VERSION.to_string(),
            image: image.into(),
        }
    }

    fn write_to(&self, out: &mut String) {
        let _ = writeln!(out, "Librarian Version: {}", self.librarian_version);
        let _ = writeln!(out, "Language Image: {}", self.image);
    }
}

/// Commit types rendered in release notes, in section order, with their headings.
///
/// Types without a heading still count toward versioning but never appear
/// in notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeadings {
    sections: Vec<(String, String)>,
}

impl SectionHeadings {
    /// Headings from `(type, heading)` pairs, in order.
    pub fn new<T, H>(sections: impl IntoIterator<Item = (T, H)>) -> Self
    where
        T: Into<String>,
        H: Into<String>,
    {
        Self {
            sections: sections
                .into_iter()
                .map(|(t, h)| (t.into(), h.into()))
                .collect(),
        }
    }

    /// Heading for `commit_type`, if it is rendered.
    pub fn heading(&self, commit_type: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(t, _)| t == commit_type)
            .map(|(_, h)| h.as_str())
    }

    /// Whether `commit_type` is rendered.
    pub fn renders(&self, commit_type: &str) -> bool {
        self.heading(commit_type).is_some()
    }

    /// `(type, heading)` pairs in section order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sections.iter().map(|(t, h)| (t.as_str(), h.as_str()))
    }
}

impl Default for SectionHeadings {
    fn default() -> Self {
        Self::new([
            ("feat", "Features"),
            ("fix", "Bug Fixes"),
            ("perf", "Performance Improvements"),
            ("revert", "Reverts"),
            ("docs", "Documentation"),
        ])
    }
}
