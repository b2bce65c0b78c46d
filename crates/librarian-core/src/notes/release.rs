//! Release pull request notes.
//!
//! Changes pending across a release batch are grouped by
//! `(commit_hash, subject)`. A group is a bulk change when its first member
//! already names several libraries, or when it reaches the configured
//! threshold; bulk changes render once in a shared section instead of under
//! every library. Every rendered change lands in exactly one place.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write;

use tracing::{debug, warn};

use super::{NoteHeader, RepoRef, SectionHeadings};
use crate::commit::short_hash;
use crate::state::{Library, ReleaseNoteCommit};

/// A library being released, with the tags its compare link spans.
#[derive(Debug, Clone)]
pub struct StagedRelease<'a> {
    /// Library with its new version and pending changes.
    pub library: &'a Library,
    /// Tag of the version being replaced.
    pub previous_tag: String,
    /// Tag the release will create.
    pub tag: String,
}

/// One change shared by several libraries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkChange {
    /// Conventional commit type.
    pub commit_type: String,
    /// Commit subject.
    pub subject: String,
    /// Commit hash.
    pub commit_hash: String,
    /// Sorted, de-duplicated IDs of the released libraries it applies to.
    pub library_ids: Vec<String>,
}

/// Changes split into bulk and per-library entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseGrouping {
    /// Bulk changes, ordered by commit hash.
    pub bulk: Vec<BulkChange>,
    /// Per-library changes, keyed by library ID, in first-seen order.
    pub per_library: BTreeMap<String, Vec<ReleaseNoteCommit>>,
}

/// Group the pending changes of every triggered library in `libraries`.
///
/// Changes whose type has no heading are left out entirely, as are IDs
/// naming libraries that are not part of this release.
pub fn group_changes<'a>(
    libraries: impl IntoIterator<Item = &'a Library>,
    headings: &SectionHeadings,
    bulk_change_threshold: Option<usize>,
) -> ReleaseGrouping {
    let libraries: Vec<&Library> = libraries
        .into_iter()
        .filter(|lib| lib.release_triggered)
        .collect();
    let triggered: HashSet<&str> = libraries.iter().map(|lib| lib.id.as_str()).collect();

    let mut order: Vec<(&str, &str)> = Vec::new();
    let mut groups: HashMap<(&str, &str), Vec<&ReleaseNoteCommit>> = HashMap::new();
    for change in libraries.iter().flat_map(|lib| &lib.changes) {
        if !headings.renders(&change.commit_type) {
            continue;
        }
        let key = (change.commit_hash.as_str(), change.subject.as_str());
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(change);
    }

    let mut grouping = ReleaseGrouping::default();
    for key in order {
        let Some(members) = groups.get(&key) else {
            continue;
        };
        let Some(first) = members.first() else {
            continue;
        };

        let is_bulk = first.library_id_list().len() > 1
            || bulk_change_threshold.is_some_and(|threshold| members.len() >= threshold);

        if is_bulk {
            let ids: BTreeSet<&str> = members
                .iter()
                .flat_map(|member| member.library_id_list())
                .filter(|id| triggered.contains(id))
                .collect();
            if ids.is_empty() {
                warn!(commit = %first.commit_hash, "bulk change names no released library");
                continue;
            }
            grouping.bulk.push(BulkChange {
                commit_type: first.commit_type.clone(),
                subject: first.subject.clone(),
                commit_hash: first.commit_hash.clone(),
                library_ids: ids.into_iter().map(str::to_string).collect(),
            });
            continue;
        }

        for member in members {
            for id in member.library_id_list() {
                if !triggered.contains(id) {
                    warn!(library = id, commit = %member.commit_hash, "dropping change for library not in this release");
                    continue;
                }
                let entries = grouping.per_library.entry(id.to_string()).or_default();
                let seen = entries
                    .iter()
                    .any(|e| e.commit_hash == member.commit_hash && e.subject == member.subject);
                if !seen {
                    entries.push((*member).clone());
                }
            }
        }
    }

    grouping
        .bulk
        .sort_by(|a, b| a.commit_hash.cmp(&b.commit_hash));
    debug!(
        bulk = grouping.bulk.len(),
        libraries = grouping.per_library.len(),
        "grouped release changes"
    );
    grouping
}

/// Everything the release body needs besides the libraries.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseNotes<'a> {
    /// Provenance header.
    pub header: &'a NoteHeader,
    /// Language repository, for links.
    pub repo: &'a RepoRef,
    /// Release date, `YYYY-MM-DD`.
    pub date: &'a str,
    /// Rendered sections.
    pub headings: &'a SectionHeadings,
    /// Bulk-change member threshold, when configured.
    pub bulk_change_threshold: Option<usize>,
}

impl ReleaseNotes<'_> {
    /// Render the release pull request body.
    ///
    /// `failed` lists libraries whose staging failed; they get a trailing
    /// section of their own.
    pub fn render(&self, releases: &[StagedRelease<'_>], failed: &[String]) -> String {
        let mut releases: Vec<&StagedRelease<'_>> = releases
            .iter()
            .filter(|r| r.library.release_triggered)
            .collect();
        releases.sort_by(|a, b| a.library.id.cmp(&b.library.id));

        let grouping = group_changes(
            releases.iter().map(|r| r.library),
            self.headings,
            self.bulk_change_threshold,
        );

        let mut out = String::new();
        self.header.write_to(&mut out);

        for release in &releases {
            self.write_library(&mut out, release, grouping.per_library.get(&release.library.id));
        }

        if !grouping.bulk.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "<details><summary>Bulk Changes</summary>");
            let _ = writeln!(out);
            for change in &grouping.bulk {
                let _ = writeln!(
                    out,
                    "* {}: {} ([{}]({}))",
                    change.commit_type,
                    change.subject,
                    short_hash(&change.commit_hash),
                    self.repo.commit_url(&change.commit_hash)
                );
                let _ = writeln!(out, "  Libraries: {}", change.library_ids.join(","));
            }
            let _ = writeln!(out, "</details>");
        }

        if !failed.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Release stage failed for");
            for id in failed {
                let _ = writeln!(out, "- {id}");
            }
        }

        out
    }

    fn write_library(
        &self,
        out: &mut String,
        release: &StagedRelease<'_>,
        entries: Option<&Vec<ReleaseNoteCommit>>,
    ) {
        let lib = release.library;
        let _ = writeln!(out);
        let _ = writeln!(out, "<details><summary>{}: {}</summary>", lib.id, lib.version);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "## [{}]({}) ({})",
            lib.version,
            self.repo.compare_url(&release.previous_tag, &release.tag),
            self.date
        );

        let entries = entries.map_or(&[][..], Vec::as_slice);
        for (commit_type, heading) in self.headings.iter() {
            let mut section = entries.iter().filter(|e| e.commit_type == commit_type).peekable();
            if section.peek().is_none() {
                continue;
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "### {heading}");
            let _ = writeln!(out);
            for entry in section {
                let _ = writeln!(
                    out,
                    "* {} ([{}]({}))",
                    entry.subject,
                    short_hash(&entry.commit_hash),
                    self.repo.commit_url(&entry.commit_hash)
                );
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "</details>");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(commit_type: &str, subject: &str, hash: &str, ids: &str) -> ReleaseNoteCommit {
        ReleaseNoteCommit {
            commit_type: commit_type.into(),
            subject: subject.into(),
            commit_hash: hash.into(),
            library_ids: ids.into(),
            ..ReleaseNoteCommit::default()
        }
    }

    fn library(id: &str, version: &str, changes: Vec<ReleaseNoteCommit>) -> Library {
        Library {
            id: id.into(),
            version: version.into(),
            previous_version: "1.0.0".into(),
            release_triggered: true,
            changes,
            ..Library::default()
        }
    }

    #[test]
    fn threshold_collapses_repeated_change() {
        let libs: Vec<Library> = (0..10)
            .map(|i| {
                let id = format!("lib{i}");
                library(&id, "1.1.0", vec![change("feat", "shared", "aaa", &id)])
            })
            .collect();

        let grouping = group_changes(&libs, &SectionHeadings::default(), Some(10));
        assert_eq!(grouping.bulk.len(), 1);
        let expected: Vec<String> = (0..10).map(|i| format!("lib{i}")).collect();
        assert_eq!(grouping.bulk[0].library_ids, expected);
        assert!(grouping.per_library.is_empty());
    }

    #[test]
    fn below_threshold_stays_per_library() {
        let libs = vec![
            library("a", "1.1.0", vec![change("feat", "shared", "aaa", "a")]),
            library("b", "1.1.0", vec![change("feat", "shared", "aaa", "b")]),
        ];
        let grouping = group_changes(&libs, &SectionHeadings::default(), Some(3));
        assert!(grouping.bulk.is_empty());
        assert_eq!(grouping.per_library["a"].len(), 1);
        assert_eq!(grouping.per_library["b"].len(), 1);
    }

    #[test]
    fn multi_library_origin_is_bulk_without_threshold() {
        let libs = vec![
            library("a", "1.1.0", vec![change("fix", "shared", "bbb", "b,a,ghost")]),
            library("b", "1.0.1", vec![change("fix", "shared", "bbb", "b,a,ghost")]),
        ];
        let grouping = group_changes(&libs, &SectionHeadings::default(), None);
        assert_eq!(grouping.bulk.len(), 1);
        assert_eq!(grouping.bulk[0].library_ids, vec!["a", "b"]);
        assert!(grouping.per_library.is_empty());
    }

    #[test]
    fn unrendered_types_and_untriggered_ids_are_dropped() {
        let mut idle = library("idle", "1.0.0", vec![change("feat", "x", "ccc", "idle")]);
        idle.release_triggered = false;
        let libs = vec![
            library(
                "a",
                "1.1.0",
                vec![
                    change("chore", "tidy", "ddd", "a"),
                    change("feat", "new thing", "eee", "a"),
                    change("feat", "new thing", "eee", "a"),
                    change("fix", "elsewhere", "fff", "idle"),
                ],
            ),
            idle,
        ];
        let grouping = group_changes(&libs, &SectionHeadings::default(), None);
        assert!(grouping.bulk.is_empty());
        assert_eq!(grouping.per_library.len(), 1);
        let entries = &grouping.per_library["a"];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "new thing");
    }

    #[test]
    fn bulk_entries_are_ordered_by_hash() {
        let libs = vec![library(
            "a",
            "2.0.0",
            vec![
                change("feat", "later", "zzz", "a,b"),
                change("feat", "earlier", "aaa", "a,b"),
            ],
        )];
        let grouping = group_changes(&libs, &SectionHeadings::default(), None);
        let hashes: Vec<_> = grouping.bulk.iter().map(|b| b.commit_hash.as_str()).collect();
        assert_eq!(hashes, vec!["aaa", "zzz"]);
    }

    #[test]
    fn renders_exact_body() {
        let a = library(
            "a",
            "1.1.0",
            vec![
                change("fix", "repair", "2222222222", "a"),
                change("feat", "add", "1111111111", "a"),
                change("feat", "everywhere", "3333333333", "a,b"),
            ],
        );
        let b = library(
            "b",
            "1.0.1",
            vec![change("feat", "everywhere", "3333333333", "a,b")],
        );
        let releases = vec![
            StagedRelease {
                library: &b,
                previous_tag: "b-v1.0.0".into(),
                tag: "b-v1.0.1".into(),
            },
            StagedRelease {
                library: &a,
                previous_tag: "a-v1.0.0".into(),
                tag: "a-v1.1.0".into(),
            },
        ];
        let header = NoteHeader {
            librarian_version: "0.1.0".into(),
            image: "img:1".into(),
        };
        let repo = RepoRef::new("o", "r");
        let headings = SectionHeadings::default();
        let notes = ReleaseNotes {
            header: &header,
            repo: &repo,
            date: "2025-01-02",
            headings: &headings,
            bulk_change_threshold: None,
        };

        let body = notes.render(&releases, &["c".to_string()]);
        let expected = "\
Librarian Version: 0.1.0
Language Image: img:1

<details><summary>a: 1.1.0</summary>

## [1.1.0](https://github.com/o/r/compare/a-v1.0.0...a-v1.1.0) (2025-01-02)

### Features

* add ([1111111](https://github.com/o/r/commit/1111111111))

### Bug Fixes

* repair ([2222222](https://github.com/o/r/commit/2222222222))

</details>

<details><summary>b: 1.0.1</summary>

## [1.0.1](https://github.com/o/r/compare/b-v1.0.0...b-v1.0.1) (2025-01-02)

</details>

<details><summary>Bulk Changes</summary>

* feat: everywhere ([3333333](https://github.com/o/r/commit/3333333333))
  Libraries: a,b
</details>

## Release stage failed for
- c
";
        assert_eq!(body, expected);
    }
}
