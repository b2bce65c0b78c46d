//! Working-tree mutation: the per-run lock and merging container output.
//!
//! After a successful `generate`, each library's source roots are cleaned
//! (files matching `remove_regex` and not `preserve_regex` are deleted),
//! then the container's output tree is copied over the checkout. Only paths
//! under the library's source roots, plus writable allow-listed global
//! files, are copied. Symlinks in the output are recreated as symlinks,
//! never followed.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::attribution::is_under;
use crate::state::{GlobalFile, Library};

/// Lock file name inside the state directory.
pub const LOCK_FILE: &str = "run.lock";

/// Errors from working-tree operations.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// Another run holds the lock.
    #[error("another librarian run is in progress (lock file {0})")]
    Locked(Utf8PathBuf),

    /// A filesystem operation failed.
    #[error("workspace I/O on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Walking a directory tree failed.
    #[error("cannot walk {path}: {source}")]
    Walk {
        /// Directory being walked.
        path: Utf8PathBuf,
        /// Underlying walk error.
        #[source]
        source: walkdir::Error,
    },

    /// A path in a walked tree is not UTF-8.
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    /// A clean pattern does not compile.
    #[error("invalid clean pattern {pattern:?} for {library}: {source}")]
    Pattern {
        /// Library declaring the pattern.
        library: String,
        /// The pattern.
        pattern: String,
        /// Compiler error.
        #[source]
        source: regex::Error,
    },
}

/// Result alias for working-tree operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

fn io_error(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ──────────────────────────────────────────────
// Lock
// ──────────────────────────────────────────────

/// Exclusive claim on a checkout for the duration of a run.
///
/// Released when dropped.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: Utf8PathBuf,
}

impl WorkspaceLock {
    /// Create `<state_dir>/run.lock`, failing if it already exists.
    #[instrument]
    pub fn acquire(state_dir: &Utf8Path) -> WorkspaceResult<Self> {
        std::fs::create_dir_all(state_dir).map_err(io_error(state_dir))?;
        let path = state_dir.join(LOCK_FILE);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::Locked(path));
            }
            Err(e) => return Err(io_error(&path)(e)),
        };
        writeln!(file, "{}", std::process::id()).map_err(io_error(&path))?;

        debug!(%path, "acquired workspace lock");
        Ok(Self { path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path, error = %e, "failed to remove workspace lock");
        }
    }
}

// ──────────────────────────────────────────────
// Scratch directories
// ──────────────────────────────────────────────

/// A temporary directory with a UTF-8 path, removed when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    _dir: tempfile::TempDir,
    path: Utf8PathBuf,
}

impl ScratchDir {
    /// Create a fresh directory under the system temp dir.
    pub fn new() -> WorkspaceResult<Self> {
        let temp_root = Utf8PathBuf::from(std::env::temp_dir().to_string_lossy().into_owned());
        let dir = tempfile::TempDir::new().map_err(io_error(&temp_root))?;
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).map_err(|path| {
            WorkspaceError::Io {
                path: Utf8PathBuf::from(path.to_string_lossy().into_owned()),
                source: std::io::Error::new(ErrorKind::InvalidData, "path is not valid UTF-8"),
            }
        })?;
        Ok(Self { _dir: dir, path })
    }

    /// Directory path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

// ──────────────────────────────────────────────
// Clean and copy
// ──────────────────────────────────────────────

/// Compiled `preserve_regex`/`remove_regex` for one library.
#[derive(Debug, Clone)]
pub struct CleanRules {
    preserve: Vec<Regex>,
    remove: Vec<Regex>,
}

impl CleanRules {
    /// Compile the library's patterns.
    pub fn for_library(library: &Library) -> WorkspaceResult<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).map_err(|source| WorkspaceError::Pattern {
                        library: library.id.clone(),
                        pattern: pattern.clone(),
                        source,
                    })
                })
                .collect::<WorkspaceResult<Vec<_>>>()
        };
        Ok(Self {
            preserve: compile(&library.preserve_regex)?,
            remove: compile(&library.remove_regex)?,
        })
    }

    /// Whether the repository-relative `path` is removed by the clean step.
    pub fn should_remove(&self, path: &str) -> bool {
        self.remove.iter().any(|re| re.is_match(path))
            && !self.preserve.iter().any(|re| re.is_match(path))
    }
}

/// Files copied and skipped by [`merge_output`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Files removed by the clean step.
    pub removed: usize,
    /// Files copied from output.
    pub copied: usize,
    /// Output files outside the library and the allowlist.
    pub skipped: usize,
}

/// Clean `library`'s source roots and copy `output_dir` into `repo_root`.
#[instrument(skip_all, fields(library = %library.id))]
pub fn merge_output(
    output_dir: &Utf8Path,
    repo_root: &Utf8Path,
    library: &Library,
    allowlist: &[GlobalFile],
) -> WorkspaceResult<MergeSummary> {
    let rules = CleanRules::for_library(library)?;
    let mut summary = MergeSummary {
        removed: clean_library(repo_root, library, &rules)?,
        ..MergeSummary::default()
    };

    for file in files_under(output_dir)? {
        let relative = relative_path(output_dir, &file);
        let owned = library
            .source_roots
            .iter()
            .any(|root| is_under(&relative, root));
        let allowed = allowlist
            .iter()
            .any(|global| global.permissions.is_writable() && is_under(&relative, &global.path));

        if !owned && !allowed {
            debug!(path = %relative, "skipping output outside library");
            summary.skipped += 1;
            continue;
        }

        let target = repo_root.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        place(&file, &target)?;
        summary.copied += 1;
    }

    debug!(?summary, "merged output");
    Ok(summary)
}

/// Delete files under the library's source roots that the rules remove.
fn clean_library(repo_root: &Utf8Path, library: &Library, rules: &CleanRules) -> WorkspaceResult<usize> {
    let mut removed = 0;
    for root in &library.source_roots {
        let dir = repo_root.join(root.trim_start_matches("./"));
        if !dir.is_dir() {
            continue;
        }
        for file in files_under(&dir)? {
            let relative = relative_path(repo_root, &file);
            if rules.should_remove(&relative) {
                std::fs::remove_file(&file).map_err(io_error(&file))?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

fn relative_path(base: &Utf8Path, file: &Utf8Path) -> String {
    file.strip_prefix(base)
        .map_or_else(|_| file.to_string(), |rel| rel.as_str().replace('\\', "/"))
}

/// Every file and symlink below `dir`, sorted. Symlinks are listed, not followed.
fn files_under(dir: &Utf8Path) -> WorkspaceResult<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|source| WorkspaceError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let path = Utf8PathBuf::from_path_buf(entry.into_path()).map_err(WorkspaceError::NonUtf8Path)?;
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Copy `source` to `target`, recreating symlinks with the same link text.
fn place(source: &Utf8Path, target: &Utf8Path) -> WorkspaceResult<()> {
    let is_link = source
        .symlink_metadata()
        .map_err(io_error(source))?
        .file_type()
        .is_symlink();
    if !is_link {
        std::fs::copy(source, target).map_err(io_error(target))?;
        return Ok(());
    }
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target).map_err(io_error(target))?;
    }
    link(source, target)
}

#[cfg(unix)]
fn link(source: &Utf8Path, target: &Utf8Path) -> WorkspaceResult<()> {
    let points_to = std::fs::read_link(source).map_err(io_error(source))?;
    std::os::unix::fs::symlink(points_to, target).map_err(io_error(target))
}

#[cfg(not(unix))]
fn link(source: &Utf8Path, target: &Utf8Path) -> WorkspaceResult<()> {
    std::fs::copy(source, target).map_err(io_error(target))?;
    Ok(())
}
