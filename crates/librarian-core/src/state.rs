//! Persisted state and administrative config documents.
//!
//! Both live in the repository's state directory (`.librarian` by default):
//!
//! - `state.yaml` is written by the tool: libraries, versions, pending
//!   release changes, the language container image.
//! - `config.yaml` is written by humans: per-library blocks and overrides,
//!   the bulk-change threshold, globally allow-listed files.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::commit::{ConventionalCommit, PIPER_REVISION_FOOTER};
use crate::version::parse_version;

/// Default state directory, relative to the repository root.
pub const DEFAULT_STATE_DIR: &str = ".librarian";

/// State document file name.
pub const STATE_FILE: &str = "state.yaml";

/// Administrative config document file name.
pub const CONFIG_FILE: &str = "config.yaml";

/// Tag format used when neither state nor config names one.
pub const DEFAULT_TAG_FORMAT: &str = "{id}-v{version}";

/// Smallest usable bulk-change threshold. Below it every change is bulk.
pub const MIN_BULK_CHANGE_THRESHOLD: usize = 2;

/// Errors from reading or writing state documents.
#[derive(Error, Debug)]
pub enum StateError {
    /// Reading or writing a document failed.
    #[error("failed to access {path}: {source}")]
    Io {
        /// Document path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A document is not valid YAML for its schema.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Document path (or ref description for remote content).
        path: String,
        /// Parser message.
        message: String,
    },

    /// Serializing a document failed.
    #[error("failed to serialize state: {0}")]
    Serialize(String),

    /// Two libraries share an ID.
    #[error("duplicate library id {0:?} in state")]
    DuplicateLibrary(String),

    /// A library's version is not valid semver.
    #[error("library {id} has invalid version {version:?}")]
    InvalidVersion {
        /// Library ID.
        id: String,
        /// Rejected version.
        version: String,
    },

    /// The config document's bulk-change threshold is too small.
    #[error("{path}: bulk_change_threshold must be at least 2, got {value}")]
    InvalidThreshold {
        /// Document path.
        path: String,
        /// Rejected threshold.
        value: usize,
    },
}

/// Result alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

// ──────────────────────────────────────────────
// State document
// ──────────────────────────────────────────────

/// The state document: every library in the repository, processed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarianState {
    /// Language container image used for every container call.
    pub image: String,
    /// Libraries, kept sorted by ID on write.
    pub libraries: Vec<Library>,
}

impl LibrarianState {
    /// Library by ID.
    pub fn library(&self, id: &str) -> Option<&Library> {
        self.libraries.iter().find(|lib| lib.id == id)
    }

    /// Mutable library by ID.
    pub fn library_mut(&mut self, id: &str) -> Option<&mut Library> {
        self.libraries.iter_mut().find(|lib| lib.id == id)
    }

    /// Insert or replace a library by ID.
    pub fn upsert(&mut self, library: Library) {
        match self.library_mut(&library.id) {
            Some(existing) => *existing = library,
            None => self.libraries.push(library),
        }
    }

    /// Check invariants: unique IDs and valid versions.
    pub fn validate(&self) -> StateResult<()> {
        let mut seen = HashSet::new();
        for lib in &self.libraries {
            if !seen.insert(lib.id.as_str()) {
                return Err(StateError::DuplicateLibrary(lib.id.clone()));
            }
            if parse_version(&lib.version).is_err() {
                return Err(StateError::InvalidVersion {
                    id: lib.id.clone(),
                    version: lib.version.clone(),
                });
            }
        }
        Ok(())
    }

    /// Parse and validate a state document from YAML text.
    pub fn from_yaml(text: &str, origin: &str) -> StateResult<Self> {
        let state: Self = serde_saphyr::from_str(text).map_err(|e| StateError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        state.validate()?;
        Ok(state)
    }

    /// Serialize to YAML with libraries sorted by ID.
    pub fn to_yaml(&self) -> StateResult<String> {
        let mut sorted = self.clone();
        sorted.libraries.sort_by(|a, b| a.id.cmp(&b.id));
        serde_saphyr::to_string(&sorted).map_err(|e| StateError::Serialize(e.to_string()))
    }
}

/// One generated library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Library {
    /// Unique ID within the repository.
    pub id: String,
    /// Current released (or staged) version.
    pub version: String,
    /// Version before the most recent staging pass.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub previous_version: String,
    /// API-source commit the library was last generated from.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_generated_commit: String,
    /// API surfaces the library is generated from.
    pub apis: Vec<Api>,
    /// Path prefixes the library owns.
    pub source_roots: Vec<String>,
    /// Files kept during the clean step.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preserve_regex: Vec<String>,
    /// Files removed during the clean step.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_regex: Vec<String>,
    /// Paths under the source roots that never trigger a release.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub release_exclude_paths: Vec<String>,
    /// Tag template with `{id}` and `{version}` placeholders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_format: Option<String>,
    /// Set when the last staging pass found a releasable change.
    pub release_triggered: bool,
    /// Changes going into the pending release.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<ReleaseNoteCommit>,
}

impl Library {
    /// API paths, in declaration order.
    pub fn api_paths(&self) -> Vec<&str> {
        self.apis.iter().map(|api| api.path.as_str()).collect()
    }

    /// Tag name for `version`, using `format_override` over the library's own format.
    pub fn tag_for(&self, version: &str, format_override: Option<&str>) -> String {
        let format = format_override
            .or(self.tag_format.as_deref())
            .unwrap_or(DEFAULT_TAG_FORMAT);
        format_tag(format, &self.id, version)
    }
}

/// Expand `{id}` and `{version}` in a tag template.
pub fn format_tag(format: &str, id: &str, version: &str) -> String {
    format.replace("{id}", id).replace("{version}", version)
}

/// An API surface a library is generated from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Api {
    /// Path within the API-source repository.
    pub path: String,
    /// Service config file, relative to `path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_config: Option<String>,
}

/// A change recorded against a pending release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseNoteCommit {
    /// Conventional commit type.
    #[serde(rename = "type")]
    pub commit_type: String,
    /// Commit subject.
    pub subject: String,
    /// Commit body.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// Full hash of the commit that carried the change.
    pub commit_hash: String,
    /// Upstream revision, from the `PiperOrigin-RevId` footer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub piper_revision_id: Option<String>,
    /// Comma-joined IDs of every library the change applies to.
    pub library_ids: String,
}

impl ReleaseNoteCommit {
    /// Record `commit` as applying to `library_ids`.
    pub fn from_commit(commit: &ConventionalCommit, library_ids: &[String]) -> Self {
        Self {
            commit_type: commit.commit_type.clone(),
            subject: commit.subject.clone(),
            body: commit.body.clone(),
            commit_hash: commit.commit_hash.clone(),
            piper_revision_id: commit.footers.get(PIPER_REVISION_FOOTER).map(str::to_string),
            library_ids: library_ids.join(","),
        }
    }

    /// `library_ids` split into tokens, empties dropped.
    pub fn library_id_list(&self) -> Vec<&str> {
        self.library_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect()
    }
}

// ──────────────────────────────────────────────
// Config document
// ──────────────────────────────────────────────

/// Administrative overrides, edited by repository maintainers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarianConfig {
    /// Files outside any library that the container may write.
    pub global_files_allowlist: Vec<GlobalFile>,
    /// Per-library overrides.
    pub libraries: Vec<LibraryConfig>,
    /// Member count at which a repeated change becomes a bulk change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk_change_threshold: Option<usize>,
}

impl LibrarianConfig {
    /// Overrides for `id`, if any.
    pub fn library(&self, id: &str) -> Option<&LibraryConfig> {
        self.libraries.iter().find(|lib| lib.id == id)
    }

    /// Whether generation is blocked for `id`.
    pub fn is_generate_blocked(&self, id: &str) -> bool {
        self.library(id).is_some_and(|lib| lib.generate_blocked)
    }

    /// Whether releases are blocked for `id`.
    pub fn is_release_blocked(&self, id: &str) -> bool {
        self.library(id).is_some_and(|lib| lib.release_blocked)
    }

    /// Tag format override for `id`.
    pub fn tag_format(&self, id: &str) -> Option<&str> {
        self.library(id).and_then(|lib| lib.tag_format.as_deref())
    }

    /// Next-version override for `id`.
    pub fn next_version(&self, id: &str) -> Option<&str> {
        self.library(id).and_then(|lib| lib.next_version.as_deref())
    }

    /// Parse a config document from YAML text.
    pub fn from_yaml(text: &str, origin: &str) -> StateResult<Self> {
        let config: Self = serde_saphyr::from_str(text).map_err(|e| StateError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        if let Some(value) = config
            .bulk_change_threshold
            .filter(|&n| n < MIN_BULK_CHANGE_THRESHOLD)
        {
            return Err(StateError::InvalidThreshold {
                path: origin.to_string(),
                value,
            });
        }
        Ok(config)
    }
}

/// Overrides for one library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Library ID.
    pub id: String,
    /// Skip this library during generation.
    pub generate_blocked: bool,
    /// Skip this library during release staging.
    pub release_blocked: bool,
    /// Tag template override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_format: Option<String>,
    /// Minimum next version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_version: Option<String>,
}

/// A repository file copied verbatim from container output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalFile {
    /// Path relative to the repository root.
    pub path: String,
    /// What the container may do with the file.
    pub permissions: FilePermission,
}

/// Container access to a global file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilePermission {
    /// Visible to the container, never copied back.
    #[default]
    ReadOnly,
    /// Copied back, not provided.
    WriteOnly,
    /// Provided and copied back.
    ReadWrite,
}

impl FilePermission {
    /// Whether container output for the file is copied into the repository.
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

// ──────────────────────────────────────────────
// Loading and saving
// ──────────────────────────────────────────────

/// Load and validate `state.yaml` from `state_dir`.
#[instrument]
pub fn load_state(state_dir: &Utf8Path) -> StateResult<LibrarianState> {
    let path = state_dir.join(STATE_FILE);
    let text = std::fs::read_to_string(&path).map_err(|source| StateError::Io {
        path: path.clone(),
        source,
    })?;
    let state = LibrarianState::from_yaml(&text, path.as_str())?;
    debug!(libraries = state.libraries.len(), "loaded state");
    Ok(state)
}

/// Write `state.yaml` into `state_dir`, sorting libraries by ID.
#[instrument(skip(state))]
pub fn save_state(state_dir: &Utf8Path, state: &LibrarianState) -> StateResult<()> {
    let path = state_dir.join(STATE_FILE);
    let yaml = state.to_yaml()?;
    std::fs::create_dir_all(state_dir).map_err(|source| StateError::Io {
        path: state_dir.to_path_buf(),
        source,
    })?;
    std::fs::write(&path, yaml).map_err(|source| StateError::Io { path, source })?;
    debug!("saved state");
    Ok(())
}

/// Load `config.yaml` from `state_dir`; a missing file is an empty config.
#[instrument]
pub fn load_config(state_dir: &Utf8Path) -> StateResult<LibrarianConfig> {
    let path = state_dir.join(CONFIG_FILE);
    if !path.is_file() {
        debug!("no config document");
        return Ok(LibrarianConfig::default());
    }
    let text = std::fs::read_to_string(&path).map_err(|source| StateError::Io {
        path: path.clone(),
        source,
    })?;
    LibrarianConfig::from_yaml(&text, path.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATE: &str = r"
image: gcr.io/lang/generator:1.0
libraries:
  - id: storage
    version: 1.2.3
    last_generated_commit: abc123
    apis:
      - path: google/storage/v2
        service_config: storage_v2.yaml
    source_roots:
      - packages/storage
    remove_regex:
      - packages/storage/src
  - id: aiplatform
    version: 0.4.0
    source_roots:
      - packages/aiplatform
";

    #[test]
    fn parses_state_document() {
        let state = LibrarianState::from_yaml(STATE, "state.yaml").unwrap();
        assert_eq!(state.image, "gcr.io/lang/generator:1.0");
        assert_eq!(state.libraries.len(), 2);
        let storage = state.library("storage").unwrap();
        assert_eq!(storage.api_paths(), vec!["google/storage/v2"]);
        assert_eq!(
            storage.apis[0].service_config.as_deref(),
            Some("storage_v2.yaml")
        );
        assert!(!storage.release_triggered);
        assert!(state.library("aiplatform").unwrap().apis.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let yaml = "libraries:\n  - id: a\n    version: 1.0.0\n  - id: a\n    version: 2.0.0\n";
        let err = LibrarianState::from_yaml(yaml, "state.yaml").unwrap_err();
        assert!(matches!(err, StateError::DuplicateLibrary(ref id) if id == "a"));
    }

    #[test]
    fn invalid_versions_are_rejected() {
        let yaml = "libraries:\n  - id: a\n    version: one\n";
        let err = LibrarianState::from_yaml(yaml, "state.yaml").unwrap_err();
        assert!(matches!(err, StateError::InvalidVersion { .. }));
    }

    #[test]
    fn save_sorts_libraries_and_round_trips() {
        let tmp = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let state = LibrarianState::from_yaml(STATE, "state.yaml").unwrap();

        save_state(dir, &state).unwrap();
        let loaded = load_state(dir).unwrap();

        let ids: Vec<_> = loaded.libraries.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["aiplatform", "storage"]);
        assert_eq!(loaded.library("storage"), state.library("storage"));
    }

    #[test]
    fn missing_state_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        assert!(matches!(load_state(dir), Err(StateError::Io { .. })));
    }

    #[test]
    fn missing_config_is_empty() {
        let tmp = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        assert_eq!(load_config(dir).unwrap(), LibrarianConfig::default());
    }

    #[test]
    fn config_lookups() {
        let yaml = r"
bulk_change_threshold: 10
global_files_allowlist:
  - path: README.md
    permissions: read-write
libraries:
  - id: storage
    release_blocked: true
    tag_format: 'storage/v{version}'
    next_version: 2.0.0
";
        let config = LibrarianConfig::from_yaml(yaml, "config.yaml").unwrap();
        assert_eq!(config.bulk_change_threshold, Some(10));
        assert!(config.global_files_allowlist[0].permissions.is_writable());
        assert!(config.is_release_blocked("storage"));
        assert!(!config.is_generate_blocked("storage"));
        assert!(!config.is_release_blocked("other"));
        assert_eq!(config.tag_format("storage"), Some("storage/v{version}"));
        assert_eq!(config.next_version("storage"), Some("2.0.0"));
    }

    #[test]
    fn bulk_change_threshold_below_two_is_rejected() {
        for value in [0, 1] {
            let yaml = format!("bulk_change_threshold: {value}\n");
            let err = LibrarianConfig::from_yaml(&yaml, "config.yaml").unwrap_err();
            assert!(matches!(
                err,
                StateError::InvalidThreshold { ref path, value: v } if path == "config.yaml" && v == value
            ));
        }
        let config = LibrarianConfig::from_yaml("bulk_change_threshold: 2\n", "config.yaml").unwrap();
        assert_eq!(config.bulk_change_threshold, Some(MIN_BULK_CHANGE_THRESHOLD));
    }

    #[test]
    fn invalid_threshold_fails_config_load() {
        let tmp = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "bulk_change_threshold: 1\n").unwrap();
        let err = load_config(dir).unwrap_err();
        assert!(matches!(err, StateError::InvalidThreshold { value: 1, .. }));
    }

    #[test]
    fn tag_formatting() {
        let lib = Library {
            id: "storage".into(),
            ..Library::default()
        };
        assert_eq!(lib.tag_for("1.2.3", None), "storage-v1.2.3");
        assert_eq!(lib.tag_for("1.2.3", Some("v{version}")), "v1.2.3");
        let custom = Library {
            tag_format: Some("{id}/{version}".into()),
            ..lib
        };
        assert_eq!(custom.tag_for("1.2.3", None), "storage/1.2.3");
    }

    #[test]
    fn library_id_list_drops_empties() {
        let change = ReleaseNoteCommit {
            library_ids: "a, b,,".into(),
            ..ReleaseNoteCommit::default()
        };
        assert_eq!(change.library_id_list(), vec!["a", "b"]);
    }
}
