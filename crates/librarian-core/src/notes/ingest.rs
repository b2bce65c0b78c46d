//! Reading a merged release pull request body back into per-library notes.
//!
//! The parser is a line-oriented state machine over the grammar written by
//! [`super::ReleaseNotes::render`]: `<details><summary>id: version</summary>`
//! opens a library section, `<details><summary>Bulk Changes</summary>` opens
//! the shared section, and `</details>` closes either.

use std::fmt::Write;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::version::parse_version;

const SUMMARY_OPEN: &str = "<details><summary>";
const SUMMARY_CLOSE: &str = "</summary>";
const DETAILS_CLOSE: &str = "</details>";
const BULK_SUMMARY: &str = "Bulk Changes";
const LIBRARIES_PREFIX: &str = "Libraries:";

/// Errors from release body parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    /// A section was opened and never closed.
    #[error("section {section:?} opened on line {line} is never closed")]
    Unterminated {
        /// Summary text of the open section.
        section: String,
        /// Line the section opened on.
        line: usize,
    },

    /// A library summary names an invalid version.
    #[error("library {id} on line {line} has invalid version {version:?}")]
    InvalidVersion {
        /// Library ID.
        id: String,
        /// Rejected version.
        version: String,
        /// Line number.
        line: usize,
    },

    /// A line does not fit the grammar.
    #[error("line {line}: {message}")]
    Malformed {
        /// Line number.
        line: usize,
        /// What is wrong.
        message: String,
    },
}

/// Result alias for release body parsing.
pub type IngestResult<T> = Result<T, IngestError>;

/// One library's release, read from a release body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRelease {
    /// Library ID.
    pub id: String,
    /// Version being released.
    pub version: String,
    /// Markdown release notes.
    pub notes: String,
}

struct BulkEntry {
    line: String,
    libraries: Vec<String>,
}

enum Section {
    Outside,
    Library {
        id: String,
        version: String,
        lines: Vec<String>,
        opened: usize,
    },
    Bulk {
        entries: Vec<BulkEntry>,
        opened: usize,
    },
}

fn summary(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(SUMMARY_OPEN)?
        .strip_suffix(SUMMARY_CLOSE)
}

/// Parse a release pull request body.
///
/// Returns one release per library section, in body order. Each bulk
/// entry is appended to the notes of every library it names that has a
/// section.
#[instrument(skip_all)]
pub fn parse_release_body(text: &str) -> IngestResult<Vec<LibraryRelease>> {
    let mut releases: Vec<LibraryRelease> = Vec::new();
    let mut bulk: Vec<BulkEntry> = Vec::new();
    let mut section = Section::Outside;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim_end();
        let trimmed = line.trim();

        section = match section {
            Section::Outside => match summary(line) {
                Some(BULK_SUMMARY) => Section::Bulk {
                    entries: Vec::new(),
                    opened: line_no,
                },
                Some(inner) => {
                    let (id, version) = parse_summary(inner, line_no)?;
                    Section::Library {
                        id,
                        version,
                        lines: Vec::new(),
                        opened: line_no,
                    }
                }
                None if trimmed == DETAILS_CLOSE => {
                    return Err(IngestError::Malformed {
                        line: line_no,
                        message: "closing tag outside any section".to_string(),
                    });
                }
                None => Section::Outside,
            },

            Section::Library {
                id,
                version,
                mut lines,
                opened,
            } => {
                if trimmed == DETAILS_CLOSE {
                    releases.push(LibraryRelease {
                        id,
                        version,
                        notes: trim_blank_lines(&lines),
                    });
                    Section::Outside
                } else if summary(line).is_some() {
                    return Err(IngestError::Unterminated {
                        section: format!("{id}: {version}"),
                        line: opened,
                    });
                } else {
                    lines.push(line.to_string());
                    Section::Library {
                        id,
                        version,
                        lines,
                        opened,
                    }
                }
            }

            Section::Bulk {
                mut entries,
                opened,
            } => {
                if trimmed == DETAILS_CLOSE {
                    bulk.append(&mut entries);
                    Section::Outside
                } else if summary(line).is_some() {
                    return Err(IngestError::Unterminated {
                        section: BULK_SUMMARY.to_string(),
                        line: opened,
                    });
                } else if trimmed.starts_with("* ") {
                    entries.push(BulkEntry {
                        line: trimmed.to_string(),
                        libraries: Vec::new(),
                    });
                    Section::Bulk { entries, opened }
                } else if let Some(ids) = trimmed.strip_prefix(LIBRARIES_PREFIX) {
                    let Some(entry) = entries.last_mut() else {
                        return Err(IngestError::Malformed {
                            line: line_no,
                            message: "library list before any bulk entry".to_string(),
                        });
                    };
                    entry.libraries = ids
                        .split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .collect();
                    Section::Bulk { entries, opened }
                } else if trimmed.is_empty() {
                    Section::Bulk { entries, opened }
                } else {
                    return Err(IngestError::Malformed {
                        line: line_no,
                        message: format!("unexpected line in bulk changes: {trimmed:?}"),
                    });
                }
            }
        };
    }

    match section {
        Section::Outside => {}
        Section::Library {
            id,
            version,
            opened,
            ..
        } => {
            return Err(IngestError::Unterminated {
                section: format!("{id}: {version}"),
                line: opened,
            });
        }
        Section::Bulk { opened, .. } => {
            return Err(IngestError::Unterminated {
                section: BULK_SUMMARY.to_string(),
                line: opened,
            });
        }
    }

    for release in &mut releases {
        let shared: Vec<&BulkEntry> = bulk
            .iter()
            .filter(|entry| entry.libraries.iter().any(|id| *id == release.id))
            .collect();
        if shared.is_empty() {
            continue;
        }
        let _ = write!(release.notes, "\n\n### {BULK_SUMMARY}\n");
        for entry in shared {
            let _ = write!(release.notes, "\n{}", entry.line);
        }
    }

    debug!(releases = releases.len(), bulk = bulk.len(), "parsed release body");
    Ok(releases)
}

fn parse_summary(inner: &str, line: usize) -> IngestResult<(String, String)> {
    let Some((id, version)) = inner.rsplit_once(": ") else {
        return Err(IngestError::Malformed {
            line,
            message: format!("summary {inner:?} is not `id: version`"),
        });
    };
    let (id, version) = (id.trim(), version.trim());
    if id.is_empty() {
        return Err(IngestError::Malformed {
            line,
            message: "summary has an empty library id".to_string(),
        });
    }
    if parse_version(version).is_err() {
        return Err(IngestError::InvalidVersion {
            id: id.to_string(),
            version: version.to_string(),
            line,
        });
    }
    Ok((id.to_string(), version.to_string()))
}

fn trim_blank_lines(lines: &[String]) -> String {
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::{NoteHeader, ReleaseNotes, RepoRef, SectionHeadings, StagedRelease};
    use crate::state::{Library, ReleaseNoteCommit};

    const BODY: &str = "\
Librarian Version: 0.1.0
Language Image: img:1

<details><summary>a: 1.1.0</summary>

## [1.1.0](https://github.com/o/r/compare/a-v1.0.0...a-v1.1.0) (2025-01-02)

### Features

* add ([1111111](https://github.com/o/r/commit/1111111111))

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

    #[test]
    fn parses_library_sections_and_bulk_entries() {
        let releases = parse_release_body(BODY).unwrap();
        assert_eq!(releases.len(), 2);

        assert_eq!(releases[0].id, "a");
        assert_eq!(releases[0].version, "1.1.0");
        assert_eq!(
            releases[0].notes,
            "## [1.1.0](https://github.com/o/r/compare/a-v1.0.0...a-v1.1.0) (2025-01-02)\n\n\
### Features\n\n\
* add ([1111111](https://github.com/o/r/commit/1111111111))\n\n\
### Bulk Changes\n\n\
* feat: everywhere ([3333333](https://github.com/o/r/commit/3333333333))"
        );

        assert_eq!(releases[1].id, "b");
        assert!(releases[1].notes.ends_with("* feat: everywhere ([3333333](https://github.com/o/r/commit/3333333333))"));
    }

    #[test]
    fn unterminated_section_is_an_error() {
        let err = parse_release_body("<details><summary>a: 1.0.0</summary>\n\n* x\n").unwrap_err();
        assert_eq!(
            err,
            IngestError::Unterminated {
                section: "a: 1.0.0".into(),
                line: 1
            }
        );
    }

    #[test]
    fn nested_summary_is_unterminated() {
        let body = "<details><summary>Bulk Changes</summary>\n<details><summary>a: 1.0.0</summary>\n</details>\n";
        assert!(matches!(
            parse_release_body(body),
            Err(IngestError::Unterminated { .. })
        ));
    }

    #[test]
    fn invalid_version_is_an_error() {
        let err = parse_release_body("<details><summary>a: next</summary>\n</details>\n").unwrap_err();
        assert!(matches!(err, IngestError::InvalidVersion { ref version, .. } if version == "next"));
    }

    #[test]
    fn stray_lines_in_bulk_are_errors() {
        let body = "<details><summary>Bulk Changes</summary>\n  Libraries: a\n</details>\n";
        assert!(matches!(
            parse_release_body(body),
            Err(IngestError::Malformed { line: 2, .. })
        ));
    }

    #[test]
    fn text_outside_sections_is_ignored() {
        assert!(parse_release_body("Just a description.\n\nNothing else.").unwrap().is_empty());
    }

    #[test]
    fn synthesized_body_round_trips() {
        let change = |t: &str, subject: &str, hash: &str, ids: &str| ReleaseNoteCommit {
            commit_type: t.into(),
            subject: subject.into(),
            commit_hash: hash.into(),
            library_ids: ids.into(),
            ..ReleaseNoteCommit::default()
        };
        let storage = Library {
            id: "storage".into(),
            version: "2.0.0".into(),
            release_triggered: true,
            changes: vec![change("feat", "drop v1", "aaaaaaaaaa", "storage")],
            ..Library::default()
        };
        let pubsub = Library {
            id: "pubsub".into(),
            version: "1.4.0".into(),
            release_triggered: true,
            changes: vec![
                change("fix", "retry", "bbbbbbbbbb", "pubsub"),
                change("docs", "typo", "cccccccccc", "pubsub,storage"),
            ],
            ..Library::default()
        };
        let header = NoteHeader::new("img");
        let repo = RepoRef::new("o", "r");
        let headings = SectionHeadings::default();
        let body = ReleaseNotes {
            header: &header,
            repo: &repo,
            date: "2025-01-01",
            headings: &headings,
            bulk_change_threshold: None,
        }
        .render(
            &[
                StagedRelease {
                    library: &storage,
                    previous_tag: "storage-v1.9.0".into(),
                    tag: "storage-v2.0.0".into(),
                },
                StagedRelease {
                    library: &pubsub,
                    previous_tag: "pubsub-v1.3.0".into(),
                    tag: "pubsub-v1.4.0".into(),
                },
            ],
            &[],
        );

        let releases = parse_release_body(&body).unwrap();
        let summary: Vec<_> = releases
            .iter()
            .map(|r| (r.id.as_str(), r.version.as_str()))
            .collect();
        assert_eq!(summary, vec![("pubsub", "1.4.0"), ("storage", "2.0.0")]);
        assert!(releases[0].notes.contains("* retry ("));
        assert!(releases[0].notes.contains("* docs: typo ("));
        assert!(releases[1].notes.contains("* drop v1 ("));
        assert!(releases[1].notes.contains("* docs: typo ("));
    }
}
