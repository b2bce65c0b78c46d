//! Tool configuration: how librarian runs, as opposed to what it manages.
//!
//! The repository's own state and config documents under `.librarian/`
//! describe libraries; this module covers the runtime side (container
//! runtime, labels, branch names, the API-source checkout).
//!
//! Settings are layered over [`Config::default`]. Later layers win:
//!
//! 1. `config.<ext>` in the user config directory (`~/.config/librarian/`)
//! 2. the closest `.librarian.<ext>` or `librarian.<ext>`, searching upward
//!    from the working directory and stopping at the repository root
//! 3. files passed explicitly (`--config`), in order
//!
//! `<ext>` is `toml`, `yaml`, `yml` or `json`. Within one directory the
//! extensions are tried in that order, the dotfile before the plain name.
//!
//! ```no_run
//! use camino::Utf8Path;
//! use librarian_core::config::ConfigLoader;
//!
//! # fn main() -> Result<(), librarian_core::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_project_search(Utf8Path::new("/work/clients"))
//!     .load()?;
//! println!("labels: {} / {}", config.pending_label(), config.done_label());
//! # Ok(())
//! # }
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use figment::Figment;
use figment::providers::{Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::notes::RepoRef;
use crate::state::{DEFAULT_STATE_DIR, MIN_BULK_CHANGE_THRESHOLD};

/// Repository API definitions are generated from, unless configured.
pub const DEFAULT_SOURCE_REPO: &str = "googleapis/googleapis";

/// Prefix of branches created for generation pull requests.
pub const DEFAULT_BRANCH_PREFIX: &str = "librarian-";

/// Branch pull requests target, unless configured.
pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Container runtime binary, unless configured.
pub const DEFAULT_CONTAINER_RUNTIME: &str = "docker";

/// Label on a release pull request awaiting publication.
pub const DEFAULT_PENDING_LABEL: &str = "release:pending";

/// Label on a release pull request whose releases exist.
pub const DEFAULT_DONE_LABEL: &str = "release:done";

/// The configuration for librarian.
///
/// Every section is optional; accessors fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Log level for the application (e.g., "debug", "info", "warn", "error").
    pub log_level: LogLevel,
    /// Directory for JSONL log files (falls back to platform defaults if unset).
    pub log_dir: Option<Utf8PathBuf>,
    /// Language and API-source repository layout.
    pub repo: Option<RepoConfig>,
    /// Language container invocation.
    pub container: Option<ContainerConfig>,
    /// Defaults for `librarian generate`.
    pub generate: Option<GenerateConfig>,
    /// Release staging and publishing.
    pub release: Option<ReleaseConfig>,
    /// Code hosting overrides.
    pub hosting: Option<HostingConfig>,
}

/// Repository layout.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RepoConfig {
    /// State directory, relative to the language repository root
    /// (default `.librarian`).
    pub state_dir: Option<Utf8PathBuf>,
    /// API-source repository as `owner/name`, for commit links.
    pub source_repo: Option<String>,
    /// Local checkout of the API-source repository.
    pub source_dir: Option<Utf8PathBuf>,
    /// Prefix for generation branches (default `librarian-`).
    pub branch_prefix: Option<String>,
}

/// Language container invocation.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Runtime binary (default `docker`).
    pub runtime: Option<String>,
    /// Image override; the state document's image is used otherwise.
    pub image: Option<String>,
    /// `uid:gid` to run the container as.
    pub user: Option<String>,
}

/// Defaults for generation runs. Command-line flags win.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GenerateConfig {
    /// Build each regenerated library.
    pub build: Option<bool>,
    /// Test each regenerated library.
    pub test: Option<bool>,
}

/// Release staging and publishing.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReleaseConfig {
    /// Member count at which a repeated change becomes a bulk change.
    ///
    /// The repository's config document takes precedence when it sets one.
    pub bulk_change_threshold: Option<usize>,
    /// Label for staged release pull requests (default `release:pending`).
    pub pending_label: Option<String>,
    /// Label once releases are published (default `release:done`).
    pub done_label: Option<String>,
}

/// Code hosting overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct HostingConfig {
    /// Language repository as `owner/name`; detected from the remote otherwise.
    pub repo: Option<String>,
    /// Branch pull requests target (default `main`).
    pub base_branch: Option<String>,
}

impl Config {
    /// State directory as configured, relative paths unresolved.
    pub fn state_dir(&self) -> Utf8PathBuf {
        self.repo
            .as_ref()
            .and_then(|r| r.state_dir.clone())
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_STATE_DIR))
    }

    /// State directory resolved against `repo_root`.
    pub fn state_dir_in(&self, repo_root: &Utf8Path) -> Utf8PathBuf {
        let dir = self.state_dir();
        if dir.is_absolute() {
            dir
        } else {
            repo_root.join(dir)
        }
    }

    /// API-source repository slug.
    pub fn source_repo(&self) -> &str {
        self.repo
            .as_ref()
            .and_then(|r| r.source_repo.as_deref())
            .unwrap_or(DEFAULT_SOURCE_REPO)
    }

    /// Local API-source checkout, if configured.
    pub fn source_dir(&self) -> Option<&Utf8Path> {
        self.repo.as_ref().and_then(|r| r.source_dir.as_deref())
    }

    /// Generation branch prefix.
    pub fn branch_prefix(&self) -> &str {
        self.repo
            .as_ref()
            .and_then(|r| r.branch_prefix.as_deref())
            .unwrap_or(DEFAULT_BRANCH_PREFIX)
    }

    /// Container runtime binary.
    pub fn container_runtime(&self) -> &str {
        self.container
            .as_ref()
            .and_then(|c| c.runtime.as_deref())
            .unwrap_or(DEFAULT_CONTAINER_RUNTIME)
    }

    /// Image override.
    pub fn container_image(&self) -> Option<&str> {
        self.container.as_ref().and_then(|c| c.image.as_deref())
    }

    /// Container user.
    pub fn container_user(&self) -> Option<&str> {
        self.container.as_ref().and_then(|c| c.user.as_deref())
    }

    /// Whether generation builds by default.
    pub fn generate_build(&self) -> bool {
        self.generate.as_ref().and_then(|g| g.build).unwrap_or(false)
    }

    /// Whether generation tests by default.
    pub fn generate_test(&self) -> bool {
        self.generate.as_ref().and_then(|g| g.test).unwrap_or(false)
    }

    /// Bulk-change threshold from tool configuration.
    pub fn bulk_change_threshold(&self) -> Option<usize> {
        self.release.as_ref().and_then(|r| r.bulk_change_threshold)
    }

    /// Pending release label.
    pub fn pending_label(&self) -> &str {
        self.release
            .as_ref()
            .and_then(|r| r.pending_label.as_deref())
            .unwrap_or(DEFAULT_PENDING_LABEL)
    }

    /// Published release label.
    pub fn done_label(&self) -> &str {
        self.release
            .as_ref()
            .and_then(|r| r.done_label.as_deref())
            .unwrap_or(DEFAULT_DONE_LABEL)
    }

    /// Language repository override.
    pub fn hosting_repo(&self) -> Option<&str> {
        self.hosting.as_ref().and_then(|h| h.repo.as_deref())
    }

    /// Pull request base branch.
    pub fn base_branch(&self) -> &str {
        self.hosting
            .as_ref()
            .and_then(|h| h.base_branch.as_deref())
            .unwrap_or(DEFAULT_BASE_BRANCH)
    }

    /// Reject values that deserialize but cannot be used.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(threshold) = self
            .bulk_change_threshold()
            .filter(|&n| n < MIN_BULK_CHANGE_THRESHOLD)
        {
            return Err(ConfigError::Invalid {
                field: "release.bulk_change_threshold",
                reason: format!("must be at least {MIN_BULK_CHANGE_THRESHOLD}, got {threshold}"),
            });
        }
        if RepoRef::parse(self.source_repo()).is_none() {
            return Err(ConfigError::Invalid {
                field: "repo.source_repo",
                reason: format!("{:?} is not owner/name", self.source_repo()),
            });
        }
        if let Some(repo) = self.hosting_repo()
            && RepoRef::parse(repo).is_none()
        {
            return Err(ConfigError::Invalid {
                field: "hosting.repo",
                reason: format!("{repo:?} is not owner/name"),
            });
        }
        for (field, label) in [
            ("release.pending_label", self.pending_label()),
            ("release.done_label", self.done_label()),
        ] {
            if label.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "label must not be empty".to_string(),
                });
            }
        }
        if self.pending_label() == self.done_label() {
            return Err(ConfigError::Invalid {
                field: "release.done_label",
                reason: "must differ from release.pending_label".to_string(),
            });
        }
        Ok(())
    }
}

/// Verbosity of the log file.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including per-phase detail.
    Debug,
    /// Progress per library.
    #[default]
    Info,
    /// Recoverable problems, such as a skipped library.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Lowercase name, as accepted by an `EnvFilter`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

// ──────────────────────────────────────────────
// Loading
// ──────────────────────────────────────────────

const APP_NAME: &str = "librarian";

/// Recognised extensions, most preferred first.
const CONFIG_EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

/// Directory entry marking the top of a checkout.
const REPO_MARKER: &str = ".git";

/// One file contributing to the effective configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLayer {
    /// From the user config directory.
    User(Utf8PathBuf),
    /// Discovered from the working directory.
    Project(Utf8PathBuf),
    /// Named on the command line.
    Explicit(Utf8PathBuf),
}

impl ConfigLayer {
    /// File backing this layer.
    pub fn path(&self) -> &Utf8Path {
        match self {
            Self::User(path) | Self::Project(path) | Self::Explicit(path) => path,
        }
    }

    fn provide(&self, figment: Figment) -> Figment {
        let path = self.path().as_str();
        match self.path().extension() {
            Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
            Some("json") => figment.merge(Json::file_exact(path)),
            _ => figment.merge(Toml::file_exact(path)),
        }
    }
}

/// Collects configuration layers, then merges and validates them.
#[derive(Debug)]
pub struct ConfigLoader {
    search_from: Option<Utf8PathBuf>,
    user_config: bool,
    stop_at_repo_root: bool,
    explicit: Vec<Utf8PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader that reads the user config and no project config.
    pub const fn new() -> Self {
        Self {
            search_from: None,
            user_config: true,
            stop_at_repo_root: true,
            explicit: Vec::new(),
        }
    }

    /// Search for a project config upward from `dir`.
    pub fn with_project_search<P: AsRef<Utf8Path>>(mut self, dir: P) -> Self {
        self.search_from = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Whether to read `~/.config/librarian/config.<ext>`.
    pub const fn with_user_config(mut self, include: bool) -> Self {
        self.user_config = include;
        self
    }

    /// Keep searching past the repository root, up to the filesystem root.
    pub const fn search_past_repo_root(mut self) -> Self {
        self.stop_at_repo_root = false;
        self
    }

    /// Layer `path` on top of everything discovered.
    pub fn with_file<P: AsRef<Utf8Path>>(mut self, path: P) -> Self {
        self.explicit.push(path.as_ref().to_path_buf());
        self
    }

    /// Layers that exist, lowest precedence first.
    pub fn layers(&self) -> Vec<ConfigLayer> {
        let user = self
            .user_config
            .then(user_config_file)
            .flatten()
            .map(ConfigLayer::User);
        let project = self
            .search_from
            .as_deref()
            .and_then(|dir| self.discover(dir))
            .map(ConfigLayer::Project);
        user.into_iter()
            .chain(project)
            .chain(self.explicit.iter().cloned().map(ConfigLayer::Explicit))
            .collect()
    }

    /// Merge every layer over the defaults and validate the result.
    #[tracing::instrument(skip(self), fields(search_from = ?self.search_from))]
    pub fn load(self) -> ConfigResult<Config> {
        let layers = self.layers();
        let figment = layers.iter().fold(
            Figment::from(Serialized::defaults(Config::default())),
            |figment, layer| layer.provide(figment),
        );
        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Deserialize(Box::new(e)))?;
        config.validate()?;
        tracing::debug!(
            layers = ?layers.iter().map(ConfigLayer::path).collect::<Vec<_>>(),
            log_level = config.log_level.as_str(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Closest project config at or above `start`.
    fn discover(&self, start: &Utf8Path) -> Option<Utf8PathBuf> {
        for dir in start.ancestors() {
            let mut candidates = CONFIG_EXTENSIONS.iter().flat_map(|ext| {
                [
                    dir.join(format!(".{APP_NAME}.{ext}")),
                    dir.join(format!("{APP_NAME}.{ext}")),
                ]
            });
            if let Some(found) = candidates.find(|path| path.is_file()) {
                return Some(found);
            }
            if self.stop_at_repo_root && dir.join(REPO_MARKER).exists() {
                break;
            }
        }
        None
    }
}

/// Path of the project config that applies at `start`, if any.
pub fn find_project_config<P: AsRef<Utf8Path>>(start: P) -> Option<Utf8PathBuf> {
    ConfigLoader::new().discover(start.as_ref())
}

fn user_config_file() -> Option<Utf8PathBuf> {
    let dir = user_config_dir()?;
    CONFIG_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("config.{ext}")))
        .find(|path| path.is_file())
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// User config directory (`~/.config/librarian/` on Linux).
pub fn user_config_dir() -> Option<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(project_dirs()?.config_dir().to_path_buf()).ok()
}

/// User data directory (`~/.local/share/librarian/` on Linux).
pub fn user_data_dir() -> Option<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(project_dirs()?.data_dir().to_path_buf()).ok()
}
