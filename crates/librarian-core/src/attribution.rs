//! Mapping commits and changed files onto libraries.
//!
//! Path matching is segment-aware: the root `ai` owns `ai` and `ai/x.go`
//! but not `aiplatform/file.go`. A root of `.` (or an empty root) owns
//! everything.

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::commit::{CommitParser, ConventionalCommit, LIBRARY_IDS_FOOTER, RawCommit};
use crate::git::{GitError, VersionControl};
use crate::state::Library;

/// Errors from commit attribution.
#[derive(Error, Debug)]
pub enum AttributionError {
    /// Listing the files a commit touched failed.
    #[error("failed to list files changed by {commit}: {source}")]
    ChangedFiles {
        /// Commit being inspected.
        commit: String,
        /// Underlying version-control failure.
        #[source]
        source: GitError,
    },
}

/// Result alias for attribution.
pub type AttributionResult<T> = Result<T, AttributionError>;

fn normalize(path: &str) -> &str {
    let mut path = path.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_end_matches('/')
}

/// Whether `file` lies under `prefix`.
pub fn is_under(file: &str, prefix: &str) -> bool {
    let prefix = normalize(prefix);
    if prefix.is_empty() || prefix == "." {
        return true;
    }
    let file = normalize(file);
    file.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// True iff some file is under a source root and under no exclude path.
pub fn included_for_release<F, R, E>(files: &[F], source_roots: &[R], exclude_paths: &[E]) -> bool
where
    F: AsRef<str>,
    R: AsRef<str>,
    E: AsRef<str>,
{
    files.iter().map(AsRef::as_ref).any(|file| {
        source_roots.iter().any(|root| is_under(file, root.as_ref()))
            && !exclude_paths
                .iter()
                .any(|exclude| is_under(file, exclude.as_ref()))
    })
}

/// True iff some file is under one of the API paths.
pub fn included_for_generation<F, A>(files: &[F], api_paths: &[A]) -> bool
where
    F: AsRef<str>,
    A: AsRef<str>,
{
    files
        .iter()
        .any(|file| api_paths.iter().any(|api| is_under(file.as_ref(), api.as_ref())))
}

/// Library IDs a commit applies to.
///
/// The `Library-IDs` footer wins when present; otherwise the commit's own
/// `library_id`, if any.
pub fn resolve_library_ids(commit: &ConventionalCommit) -> Vec<String> {
    if let Some(ids) = commit.footers.get(LIBRARY_IDS_FOOTER) {
        let mut resolved: Vec<String> = Vec::new();
        for id in ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            if !resolved.iter().any(|seen| seen == id) {
                resolved.push(id.to_string());
            }
        }
        return resolved;
    }
    if commit.library_id.is_empty() {
        Vec::new()
    } else {
        vec![commit.library_id.clone()]
    }
}

/// Conventional commits from `raw_commits` that belong to `library`.
///
/// A commit belongs when it touches a file the library releases and its
/// resolved IDs include the library.
#[instrument(skip_all, fields(library = %library.id, candidates = raw_commits.len()))]
pub fn attribute_commits<V: VersionControl + ?Sized>(
    vcs: &V,
    parser: &CommitParser,
    library: &Library,
    raw_commits: &[RawCommit],
) -> AttributionResult<Vec<ConventionalCommit>> {
    let mut attributed = Vec::new();

    for raw in raw_commits {
        let files = vcs
            .changed_files(&raw.hash)
            .map_err(|source| AttributionError::ChangedFiles {
                commit: raw.hash.clone(),
                source,
            })?;

        if !included_for_release(&files, &library.source_roots, &library.release_exclude_paths) {
            debug!(commit = %raw.hash, "commit does not touch released paths");
            continue;
        }

        let commits = match parser.parse(raw, &library.id) {
            Ok(commits) => commits,
            Err(e) => {
                warn!(error = %e, "skipping commit");
                continue;
            }
        };

        attributed.extend(
            commits
                .into_iter()
                .filter(|commit| resolve_library_ids(commit).contains(&library.id)),
        );
    }

    debug!(count = attributed.len(), "attributed commits");
    Ok(attributed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::Footers;
    use crate::testing::FakeVcs;

    fn commit_with_footer(ids: Option<&str>, library_id: &str) -> ConventionalCommit {
        let mut footers = Footers::default();
        if let Some(ids) = ids {
            footers.insert(LIBRARY_IDS_FOOTER, ids);
        }
        ConventionalCommit {
            commit_type: "feat".into(),
            scope: None,
            subject: "s".into(),
            body: String::new(),
            footers,
            library_id: library_id.into(),
            is_breaking: false,
            is_nested: false,
            commit_hash: "h".into(),
            timestamp: 0,
        }
    }

    #[test]
    fn segment_aware_matching() {
        assert!(is_under("ai", "ai"));
        assert!(is_under("ai/x.go", "ai"));
        assert!(!is_under("aiplatform/file.go", "ai"));
        assert!(is_under("./ai/x.go", "ai/"));
        assert!(is_under("anything/at/all", "."));
        assert!(is_under("anything", ""));
    }

    #[test]
    fn release_inclusion_respects_roots() {
        assert!(!included_for_release(&["aiplatform/file.go"], &["ai"], &[] as &[&str]));
        assert!(included_for_release(&["aiplatform/file.go"], &["."], &[] as &[&str]));
        assert!(!included_for_release(&[] as &[&str], &["."], &[] as &[&str]));
    }

    #[test]
    fn release_inclusion_is_per_file() {
        let roots = ["pkg"];
        let excludes = ["pkg/docs"];
        assert!(!included_for_release(&["pkg/docs/README.md"], &roots, &excludes));
        assert!(included_for_release(
            &["pkg/docs/README.md", "pkg/src/lib.rs"],
            &roots,
            &excludes
        ));
    }

    #[test]
    fn dot_exclude_excludes_everything() {
        assert!(!included_for_release(&["pkg/a"], &["pkg"], &["."]));
    }

    #[test]
    fn generation_inclusion_uses_api_paths() {
        let apis = ["google/cloud/ai/v1"];
        assert!(included_for_generation(&["google/cloud/ai/v1/service.proto"], &apis));
        assert!(!included_for_generation(&["google/cloud/ai/v1beta/service.proto"], &apis));
    }

    #[test]
    fn footer_ids_are_split_and_trimmed() {
        let commit = commit_with_footer(Some("foo, bar,,foo"), "lib");
        assert_eq!(resolve_library_ids(&commit), vec!["foo", "bar"]);
    }

    #[test]
    fn falls_back_to_library_id() {
        assert_eq!(resolve_library_ids(&commit_with_footer(None, "lib")), vec!["lib"]);
        assert!(resolve_library_ids(&commit_with_footer(None, "")).is_empty());
    }

    fn library() -> Library {
        Library {
            id: "foo".into(),
            version: "1.0.0".into(),
            source_roots: vec!["packages/foo".into()],
            release_exclude_paths: vec!["packages/foo/.repo-metadata.json".into()],
            ..Library::default()
        }
    }

    #[test]
    fn attributes_only_matching_commits() {
        let vcs = FakeVcs::new()
            .with_changed_files("c1", &["packages/foo/src/a.rs"])
            .with_changed_files("c2", &["packages/bar/src/a.rs"])
            .with_changed_files("c3", &["packages/foo/.repo-metadata.json"])
            .with_changed_files("c4", &["packages/foo/src/b.rs", "packages/bar/src/b.rs"]);
        let raw = vec![
            RawCommit::new("c1", "feat: foo feature", 1),
            RawCommit::new("c2", "fix: bar fix", 2),
            RawCommit::new("c3", "chore: metadata", 3),
            RawCommit::new("c4", "fix: shared\n\nLibrary-IDs: bar", 4),
        ];

        let commits = attribute_commits(&vcs, &CommitParser::new(), &library(), &raw).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit_hash, "c1");
        assert_eq!(commits[0].library_id, "foo");
    }

    #[test]
    fn empty_messages_are_skipped() {
        let vcs = FakeVcs::new().with_changed_files("c1", &["packages/foo/a"]);
        let raw = vec![RawCommit::new("c1", "", 1)];
        let commits = attribute_commits(&vcs, &CommitParser::new(), &library(), &raw).unwrap();
        assert!(commits.is_empty());
    }

    #[test]
    fn changed_file_failure_is_an_error() {
        let vcs = FakeVcs::new().failing_changed_files("c1");
        let raw = vec![RawCommit::new("c1", "feat: x", 1)];
        let err = attribute_commits(&vcs, &CommitParser::new(), &library(), &raw).unwrap_err();
        assert!(matches!(err, AttributionError::ChangedFiles { ref commit, .. } if commit == "c1"));
    }
}
