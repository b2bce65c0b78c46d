//! Generation pull request notes.
//!
//! Upstream commits that caused a regeneration are deduplicated by
//! `(commit_hash, subject)` across libraries and written as nested commits,
//! each naming every library it regenerated in a `Library-IDs` footer.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use super::{NoteHeader, RepoRef};
use crate::commit::{
    ConventionalCommit, LIBRARY_IDS_FOOTER, NestedGrammar, PIPER_REVISION_FOOTER,
    SOURCE_LINK_FOOTER, short_hash,
};

/// An upstream commit that caused `library_id` to be regenerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationChange {
    /// Regenerated library.
    pub library_id: String,
    /// Parsed upstream commit.
    pub commit: ConventionalCommit,
}

/// Group changes into one commit per `(commit_hash, subject)`, with the
/// `Library-IDs` footer set to the sorted union of libraries.
pub fn group_generation_changes(changes: &[GenerationChange]) -> Vec<ConventionalCommit> {
    let mut order: Vec<(&str, &str)> = Vec::new();
    let mut groups: HashMap<(&str, &str), (ConventionalCommit, BTreeSet<&str>)> = HashMap::new();

    for change in changes {
        let key = (
            change.commit.commit_hash.as_str(),
            change.commit.subject.as_str(),
        );
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                (change.commit.clone(), BTreeSet::new())
            })
            .1
            .insert(change.library_id.as_str());
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|(mut commit, ids)| {
            let ids: Vec<&str> = ids.into_iter().collect();
            commit.footers.insert(LIBRARY_IDS_FOOTER, ids.join(","));
            commit
        })
        .collect()
}

/// Render the generation pull request body.
///
/// `source_repo` is the API-source repository the commits came from;
/// `failed` lists libraries whose generation failed.
pub fn render_generation_notes(
    header: &NoteHeader,
    source_repo: &RepoRef,
    changes: &[GenerationChange],
    failed: &[String],
) -> String {
    let grammar = NestedGrammar::STANDARD;
    let mut out = String::new();
    let _ = writeln!(out, "This pull request is generated with proper changes.");
    let _ = writeln!(out);
    header.write_to(&mut out);

    let commits = group_generation_changes(changes);
    if !commits.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", grammar.begin_commit);
        for commit in &commits {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", grammar.begin_nested);
            write_nested(&mut out, commit, source_repo);
            let _ = writeln!(out, "{}", grammar.end_nested);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", grammar.end_commit);
    }

    if !failed.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Generation failed for");
        for id in failed {
            let _ = writeln!(out, "- {id}");
        }
    }

    out
}

fn write_nested(out: &mut String, commit: &ConventionalCommit, source_repo: &RepoRef) {
    let _ = writeln!(out, "{}", commit.header());
    if !commit.body.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", commit.body);
    }
    let _ = writeln!(out);

    let trailing = [PIPER_REVISION_FOOTER, LIBRARY_IDS_FOOTER, SOURCE_LINK_FOOTER];
    for (key, value) in commit.footers.iter() {
        if !trailing.contains(&key) {
            let _ = writeln!(out, "{key}: {value}");
        }
    }
    if let Some(revision) = commit.footers.get(PIPER_REVISION_FOOTER) {
        let _ = writeln!(out, "{PIPER_REVISION_FOOTER}: {revision}");
    }
    if let Some(ids) = commit.footers.get(LIBRARY_IDS_FOOTER) {
        let _ = writeln!(out, "{LIBRARY_IDS_FOOTER}: {ids}");
    }
    let _ = writeln!(
        out,
        "{SOURCE_LINK_FOOTER}: [{}@{}]({})",
        source_repo.slug(),
        short_hash(&commit.commit_hash),
        source_repo.commit_url(&commit.commit_hash)
    );
}
