//! Conventional commit parsing.
//!
//! A raw commit message is either a single conventional commit or a squashed
//! upstream history in the nested form:
//!
//! ```text
//! BEGIN_COMMIT
//! BEGIN_NESTED_COMMIT
//! feat: add Foo
//!
//! Library-IDs: foo
//! END_NESTED_COMMIT
//! BEGIN_NESTED_COMMIT
//! fix: repair Bar
//! END_NESTED_COMMIT
//! END_COMMIT
//! ```
//!
//! in which case every nested block becomes its own [`ConventionalCommit`].
//! A `BEGIN_COMMIT_OVERRIDE`/`END_COMMIT_OVERRIDE` block replaces the whole
//! message with its contents before either grammar is tried.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Footer naming the libraries a commit applies to, comma-separated.
pub const LIBRARY_IDS_FOOTER: &str = "Library-IDs";

/// Footer carrying the upstream revision a nested commit came from.
pub const PIPER_REVISION_FOOTER: &str = "PiperOrigin-RevId";

/// Footer linking a nested commit to its upstream commit.
pub const SOURCE_LINK_FOOTER: &str = "Source-link";

/// Canonical key for breaking-change footers (`BREAKING-CHANGE` is folded into it).
pub const BREAKING_CHANGE_FOOTER: &str = "BREAKING CHANGE";

/// Errors from commit parsing.
///
/// Malformed commit text is not an error; it simply yields no commits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitParseError {
    /// The message was empty or whitespace only.
    #[error("commit {hash} has an empty message")]
    Empty {
        /// Hash of the offending commit.
        hash: String,
    },
}

/// Result alias for commit parsing.
pub type CommitParseResult<T> = Result<T, CommitParseError>;

/// A commit as read from version control, before parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommit {
    /// Full commit hash.
    pub hash: String,
    /// Full message, subject line included.
    pub message: String,
    /// Commit time in unix seconds.
    pub timestamp: i64,
}

impl RawCommit {
    /// Build a raw commit.
    pub fn new(hash: impl Into<String>, message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            hash: hash.into(),
            message: message.into(),
            timestamp,
        }
    }
}

/// Ordered footer map with unique keys.
///
/// Inserting an existing key replaces its value without moving it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footers(Vec<(String, String)>);

impl Footers {
    /// Value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Insert or replace a footer.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Remove a footer, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    /// Footers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of footers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no footers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn append_line(&mut self, key: &str, line: &str) {
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| k == key) {
            if !slot.1.is_empty() {
                slot.1.push('\n');
            }
            slot.1.push_str(line);
        }
    }
}

/// A parsed conventional commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConventionalCommit {
    /// Commit type, lowercased (`feat`, `fix`, `chore`, ...).
    #[serde(rename = "type")]
    pub commit_type: String,
    /// Optional scope from `type(scope): ...`.
    pub scope: Option<String>,
    /// Header text after the colon.
    pub subject: String,
    /// Body text between header and footers, trimmed.
    pub body: String,
    /// Trailing `Key: value` footers.
    pub footers: Footers,
    /// Library the caller was evaluating; used when no `Library-IDs` footer exists.
    pub library_id: String,
    /// Header `!` or a `BREAKING CHANGE` footer.
    pub is_breaking: bool,
    /// Parsed out of a nested commit block.
    pub is_nested: bool,
    /// Hash of the commit that carried this message.
    pub commit_hash: String,
    /// Commit time in unix seconds.
    pub timestamp: i64,
}

impl ConventionalCommit {
    /// Re-render the header line: `type(scope)!: subject`.
    pub fn header(&self) -> String {
        let mut header = self.commit_type.clone();
        if let Some(scope) = &self.scope {
            header.push('(');
            header.push_str(scope);
            header.push(')');
        }
        if self.is_breaking {
            header.push('!');
        }
        header.push_str(": ");
        header.push_str(&self.subject);
        header
    }
}

/// First seven characters of a commit hash.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

/// Sentinel lines recognised by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedGrammar {
    /// Opens a squashed history.
    pub begin_commit: &'static str,
    /// Closes a squashed history.
    pub end_commit: &'static str,
    /// Opens one nested commit.
    pub begin_nested: &'static str,
    /// Closes one nested commit.
    pub end_nested: &'static str,
    /// Opens a replacement message.
    pub begin_override: &'static str,
    /// Closes a replacement message.
    pub end_override: &'static str,
}

impl NestedGrammar {
    /// The sentinels written by the generation narrative.
    pub const STANDARD: Self = Self {
        begin_commit: "BEGIN_COMMIT",
        end_commit: "END_COMMIT",
        begin_nested: "BEGIN_NESTED_COMMIT",
        end_nested: "END_NESTED_COMMIT",
        begin_override: "BEGIN_COMMIT_OVERRIDE",
        end_override: "END_COMMIT_OVERRIDE",
    };
}

impl Default for NestedGrammar {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Turns raw commits into conventional commits.
///
/// Construct once and pass by reference.
#[derive(Debug, Clone, Default)]
pub struct CommitParser {
    grammar: NestedGrammar,
}

impl CommitParser {
    /// Parser using the standard sentinels.
    pub const fn new() -> Self {
        Self {
            grammar: NestedGrammar::STANDARD,
        }
    }

    /// Parser using custom sentinels.
    pub const fn with_grammar(grammar: NestedGrammar) -> Self {
        Self { grammar }
    }

    /// The sentinels this parser recognises.
    pub const fn grammar(&self) -> &NestedGrammar {
        &self.grammar
    }

    /// Parse one raw commit.
    ///
    /// `library_id` is recorded on every produced commit as the fallback
    /// attribution. Returns zero commits for text that is not a conventional
    /// commit, and [`CommitParseError::Empty`] only for an empty message.
    #[instrument(skip_all, fields(hash = %raw.hash))]
    pub fn parse(
        &self,
        raw: &RawCommit,
        library_id: &str,
    ) -> CommitParseResult<Vec<ConventionalCommit>> {
        if raw.message.trim().is_empty() {
            return Err(CommitParseError::Empty {
                hash: raw.hash.clone(),
            });
        }

        let message = block(
            &raw.message,
            0,
            self.grammar.begin_override,
            self.grammar.end_override,
        )
        .map_or(raw.message.as_str(), |(inner, _)| inner);

        if let Some(blocks) = self.nested_blocks(message) {
            let mut commits = Vec::with_capacity(blocks.len());
            for (index, text) in blocks.into_iter().enumerate() {
                match parse_single(text) {
                    Some(parsed) => commits.push(parsed.into_commit(raw, library_id, true)),
                    None => debug!(index, "skipping unparsable nested commit block"),
                }
            }
            debug!(count = commits.len(), "parsed nested commits");
            return Ok(commits);
        }

        let commits: Vec<_> = parse_single(message)
            .map(|parsed| parsed.into_commit(raw, library_id, false))
            .into_iter()
            .collect();
        if commits.is_empty() {
            debug!("message is not a conventional commit");
        }
        Ok(commits)
    }

    /// Inner text of each nested block, or `None` if the message is not nested.
    fn nested_blocks<'m>(&self, message: &'m str) -> Option<Vec<&'m str>> {
        let (outer, _) = block(
            message,
            0,
            self.grammar.begin_commit,
            self.grammar.end_commit,
        )?;

        let mut blocks = Vec::new();
        let mut cursor = 0;
        while let Some((inner, after)) = block(
            outer,
            cursor,
            self.grammar.begin_nested,
            self.grammar.end_nested,
        ) {
            blocks.push(inner);
            cursor = after;
        }

        (!blocks.is_empty()).then_some(blocks)
    }
}

// ──────────────────────────────────────────────
// Grammar helpers
// ──────────────────────────────────────────────

/// Byte span of the first line at or after `from` whose trimmed text is `marker`.
fn find_line(text: &str, from: usize, marker: &str) -> Option<(usize, usize)> {
    let mut offset = from;
    for line in text.get(from..)?.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        if line.trim() == marker {
            return Some((start, offset));
        }
    }
    None
}

/// Text between a `begin` line and the next `end` line, plus the offset after `end`.
fn block<'m>(text: &'m str, from: usize, begin: &str, end: &str) -> Option<(&'m str, usize)> {
    let (_, body_start) = find_line(text, from, begin)?;
    let (body_end, after) = find_line(text, body_start, end)?;
    Some((&text[body_start..body_end], after))
}

struct Parsed {
    commit_type: String,
    scope: Option<String>,
    subject: String,
    body: String,
    footers: Footers,
    breaking: bool,
}

impl Parsed {
    fn into_commit(self, raw: &RawCommit, library_id: &str, nested: bool) -> ConventionalCommit {
        ConventionalCommit {
            commit_type: self.commit_type,
            scope: self.scope,
            subject: self.subject,
            body: self.body,
            footers: self.footers,
            library_id: library_id.to_string(),
            is_breaking: self.breaking,
            is_nested: nested,
            commit_hash: raw.hash.clone(),
            timestamp: raw.timestamp,
        }
    }
}

fn parse_single(text: &str) -> Option<Parsed> {
    let mut lines = text.lines().skip_while(|line| line.trim().is_empty());
    let (commit_type, scope, bang, subject) = parse_header(lines.next()?.trim())?;

    let mut body_lines: Vec<&str> = Vec::new();
    let mut footers = Footers::default();
    let mut last_key: Option<String> = None;
    let mut previous_blank = true;

    for line in lines {
        let line = line.trim_end();
        if let Some(key) = &last_key {
            if line.trim().is_empty() {
                continue;
            }
            match footer_line(line) {
                Some((k, v)) => {
                    footers.insert(k.clone(), v);
                    last_key = Some(k);
                }
                None => footers.append_line(key, line.trim()),
            }
            continue;
        }
        if previous_blank && let Some((k, v)) = footer_line(line) {
            footers.insert(k.clone(), v);
            last_key = Some(k);
            continue;
        }
        previous_blank = line.trim().is_empty();
        body_lines.push(line);
    }

    let breaking = bang || footers.contains_key(BREAKING_CHANGE_FOOTER);
    Some(Parsed {
        commit_type,
        scope,
        subject,
        body: body_lines.join("\n").trim().to_string(),
        footers,
        breaking,
    })
}

/// `type(scope)!: subject` → (type, scope, bang, subject).
fn parse_header(line: &str) -> Option<(String, Option<String>, bool, String)> {
    let (prefix, subject) = line.split_once(':')?;
    let subject = subject.trim();
    if subject.is_empty() {
        return None;
    }

    let (prefix, bang) = match prefix.strip_suffix('!') {
        Some(rest) => (rest, true),
        None => (prefix, false),
    };

    let (commit_type, scope) = match prefix.split_once('(') {
        Some((commit_type, rest)) => {
            let scope = rest.strip_suffix(')')?;
            if scope.is_empty() || scope.contains(['(', ')']) {
                return None;
            }
            (commit_type, Some(scope.to_string()))
        }
        None => (prefix, None),
    };

    let valid_type = !commit_type.is_empty()
        && commit_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid_type {
        return None;
    }

    Some((
        commit_type.to_ascii_lowercase(),
        scope,
        bang,
        subject.to_string(),
    ))
}

/// `Token: value`, `Token #value`, or a breaking-change footer.
fn footer_line(line: &str) -> Option<(String, String)> {
    for synonym in [BREAKING_CHANGE_FOOTER, "BREAKING-CHANGE"] {
        if let Some(value) = line
            .strip_prefix(synonym)
            .and_then(|rest| rest.strip_prefix(':'))
        {
            return Some((BREAKING_CHANGE_FOOTER.to_string(), value.trim().to_string()));
        }
    }

    let (token, value) = match line.split_once(": ") {
        Some((token, value)) => (token, value.trim().to_string()),
        None => {
            let (token, value) = line.split_once(" #")?;
            (token, format!("#{}", value.trim()))
        }
    };

    let valid_token =
        !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    valid_token.then(|| (token.to_string(), value))
}
