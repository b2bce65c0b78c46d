//! Language container invocation.
//!
//! Every language-specific step (configure, generate, build, test, release
//! staging) runs inside the language container. A request file is written
//! to a scratch `librarian/` directory mounted at `/librarian`; the
//! container answers in `librarian/<command>-response.json`. A response
//! with a non-empty `error` is a failure even when the container exited 0.

use std::fmt;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::state::{LibrarianState, Library};

/// Errors from container calls.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Preparing or reading the request directory failed.
    #[error("container request I/O on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The container runtime could not be started.
    #[error("failed to run {runtime}: {source}")]
    Exec {
        /// Runtime binary.
        runtime: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The container runtime is not installed.
    #[error("{0} not found on PATH")]
    MissingTool(String),

    /// The container exited unsuccessfully.
    #[error("{command} for {library} exited with {status}: {stderr}")]
    Exit {
        /// Command that ran.
        command: ContainerCommand,
        /// Library it ran for.
        library: String,
        /// Exit status description.
        status: String,
        /// Captured stderr.
        stderr: String,
    },

    /// The container reported an error in its response.
    #[error("{command} for {library} reported: {message}")]
    Reported {
        /// Command that ran.
        command: ContainerCommand,
        /// Library it ran for.
        library: String,
        /// Reported message.
        message: String,
    },

    /// Encoding the request or decoding the response failed.
    #[error("malformed container message {path}: {message}")]
    Message {
        /// Request or response file.
        path: Utf8PathBuf,
        /// Decoder message.
        message: String,
    },
}

/// Result alias for container calls.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Language container commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerCommand {
    /// Set up a library that is new to the repository.
    Configure,
    /// Generate library code from API definitions.
    Generate,
    /// Build generated code.
    Build,
    /// Run the library's tests.
    Test,
    /// Update version files and changelogs for a release.
    ReleaseStage,
}

impl ContainerCommand {
    /// Name passed to the container entrypoint.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::Generate => "generate",
            Self::Build => "build",
            Self::Test => "test",
            Self::ReleaseStage => "release-stage",
        }
    }
}

impl fmt::Display for ContainerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a container call operates on.
#[derive(Debug, Clone, Copy)]
pub struct ContainerRequest<'a> {
    /// Library the call is for.
    pub library_id: &'a str,
    /// The persisted batch, as the container should see it.
    pub state: &'a LibrarianState,
    /// Language repository checkout.
    pub repo_dir: &'a Utf8Path,
    /// API-source checkout, when the command reads API definitions.
    pub api_root: Option<&'a Utf8Path>,
    /// Directory the container writes generated output into.
    pub output_dir: Option<&'a Utf8Path>,
    /// API path for a library being configured.
    pub api_path: Option<&'a str>,
}

impl<'a> ContainerRequest<'a> {
    /// Request for `library_id` with no API root or output directory.
    pub const fn new(library_id: &'a str, state: &'a LibrarianState, repo_dir: &'a Utf8Path) -> Self {
        Self {
            library_id,
            state,
            repo_dir,
            api_root: None,
            output_dir: None,
            api_path: None,
        }
    }
}

/// Container answer, read from `<command>-response.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContainerResponse {
    /// Non-empty when the command failed.
    pub error: String,
    /// Library as configured by the container (configure only).
    pub library: Option<Library>,
}

/// Runs language container commands.
///
/// Implementations provide [`run`](Self::run); the named methods are
/// conveniences over it.
pub trait ContainerRunner {
    /// Run `command` for `request`.
    fn run(
        &self,
        command: ContainerCommand,
        request: &ContainerRequest<'_>,
    ) -> ContainerResult<ContainerResponse>;

    /// Configure a new library.
    fn configure(&self, request: &ContainerRequest<'_>) -> ContainerResult<ContainerResponse> {
        self.run(ContainerCommand::Configure, request)
    }

    /// Generate library code into `request.output_dir`.
    fn generate(&self, request: &ContainerRequest<'_>) -> ContainerResult<ContainerResponse> {
        self.run(ContainerCommand::Generate, request)
    }

    /// Build the library in the repository checkout.
    fn build(&self, request: &ContainerRequest<'_>) -> ContainerResult<ContainerResponse> {
        self.run(ContainerCommand::Build, request)
    }

    /// Test the library in the repository checkout.
    fn test(&self, request: &ContainerRequest<'_>) -> ContainerResult<ContainerResponse> {
        self.run(ContainerCommand::Test, request)
    }

    /// Stage a release of the library.
    fn release_stage(&self, request: &ContainerRequest<'_>) -> ContainerResult<ContainerResponse> {
        self.run(ContainerCommand::ReleaseStage, request)
    }
}

// ──────────────────────────────────────────────
// Docker
// ──────────────────────────────────────────────

/// [`ContainerRunner`] backed by `docker run --rm`.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    runtime: String,
    image: String,
    user: Option<String>,
}

#[derive(Serialize)]
struct RequestFile<'a> {
    command: ContainerCommand,
    library_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    library: Option<&'a Library>,
    state: &'a LibrarianState,
}

impl DockerRunner {
    /// Run `image` with the `docker` binary.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            runtime: "docker".to_string(),
            image: image.into(),
            user: None,
        }
    }

    /// Use a different runtime binary (e.g. `podman`).
    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Run the container as `user` (`uid:gid`).
    #[must_use]
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Image this runner starts.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Fail early if the runtime binary is not installed.
    pub fn ensure_available(&self) -> ContainerResult<()> {
        which::which(&self.runtime)
            .map(|_| ())
            .map_err(|_| ContainerError::MissingTool(self.runtime.clone()))
    }

    /// Arguments for `<runtime> run`.
    fn run_args(
        &self,
        command: ContainerCommand,
        request: &ContainerRequest<'_>,
        librarian_dir: &Utf8Path,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{librarian_dir}:/librarian"),
            "-v".to_string(),
            format!("{}:/repo", request.repo_dir),
        ];
        if let Some(api_root) = request.api_root {
            args.push("-v".to_string());
            args.push(format!("{api_root}:/source:ro"));
        }
        if let Some(output) = request.output_dir {
            args.push("-v".to_string());
            args.push(format!("{output}:/output"));
        }
        if let Some(user) = &self.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        args.push(self.image.clone());
        args.push(command.as_str().to_string());
        args.push("--librarian=/librarian".to_string());
        args.push("--repo=/repo".to_string());
        if request.api_root.is_some() {
            args.push("--source=/source".to_string());
        }
        if request.output_dir.is_some() {
            args.push("--output=/output".to_string());
        }
        args.push(format!("--library-id={}", request.library_id));
        args
    }
}

impl ContainerRunner for DockerRunner {
    #[instrument(skip(self, request), fields(library = %request.library_id, image = %self.image))]
    fn run(
        &self,
        command: ContainerCommand,
        request: &ContainerRequest<'_>,
    ) -> ContainerResult<ContainerResponse> {
        let scratch = tempfile::TempDir::new().map_err(|source| ContainerError::Io {
            path: Utf8PathBuf::from(std::env::temp_dir().to_string_lossy().into_owned()),
            source,
        })?;
        let scratch_root =
            Utf8PathBuf::from_path_buf(scratch.path().to_path_buf()).map_err(|path| {
                ContainerError::Message {
                    path: Utf8PathBuf::from(path.to_string_lossy().into_owned()),
                    message: "scratch directory is not valid UTF-8".to_string(),
                }
            })?;
        let librarian_dir = scratch_root.join("librarian");
        std::fs::create_dir_all(&librarian_dir).map_err(|source| ContainerError::Io {
            path: librarian_dir.clone(),
            source,
        })?;

        write_request(&librarian_dir, command, request)?;

        let args = self.run_args(command, request, &librarian_dir);
        debug!(runtime = %self.runtime, ?args, "starting container");
        let output = Command::new(&self.runtime)
            .args(&args)
            .output()
            .map_err(|source| ContainerError::Exec {
                runtime: self.runtime.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ContainerError::Exit {
                command,
                library: request.library_id.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        read_response(&librarian_dir, command, request.library_id)
    }
}

fn write_request(
    librarian_dir: &Utf8Path,
    command: ContainerCommand,
    request: &ContainerRequest<'_>,
) -> ContainerResult<()> {
    let path = librarian_dir.join(format!("{command}-request.json"));
    let body = RequestFile {
        command,
        library_id: request.library_id,
        api_path: request.api_path,
        library: request.state.library(request.library_id),
        state: request.state,
    };
    let json = serde_json::to_string_pretty(&body).map_err(|e| ContainerError::Message {
        path: path.clone(),
        message: e.to_string(),
    })?;
    std::fs::write(&path, json).map_err(|source| ContainerError::Io { path, source })
}

/// Read `<command>-response.json`; a missing file is an empty, successful response.
fn read_response(
    librarian_dir: &Utf8Path,
    command: ContainerCommand,
    library_id: &str,
) -> ContainerResult<ContainerResponse> {
    let path = librarian_dir.join(format!("{command}-response.json"));
    if !path.is_file() {
        debug!(%path, "no response file");
        return Ok(ContainerResponse::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|source| ContainerError::Io {
        path: path.clone(),
        source,
    })?;
    let response: ContainerResponse =
        serde_json::from_str(&text).map_err(|e| ContainerError::Message {
            path: path.clone(),
            message: e.to_string(),
        })?;

    if !response.error.trim().is_empty() {
        return Err(ContainerError::Reported {
            command,
            library: library_id.to_string(),
            message: response.error,
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap()
    }

    #[test]
    fn command_names() {
        assert_eq!(ContainerCommand::ReleaseStage.to_string(), "release-stage");
        assert_eq!(ContainerCommand::Generate.as_str(), "generate");
        assert_eq!(
            serde_json::to_string(&ContainerCommand::ReleaseStage).unwrap(),
            "\"release-stage\""
        );
    }

    #[test]
    fn docker_args_mount_every_directory() {
        let state = LibrarianState::default();
        let request = ContainerRequest {
            api_root: Some(Utf8Path::new("/src/googleapis")),
            output_dir: Some(Utf8Path::new("/tmp/out")),
            ..ContainerRequest::new("storage", &state, Utf8Path::new("/work/repo"))
        };
        let runner = DockerRunner::new("gcr.io/lang/gen:1").with_user(Some("1000:1000".into()));
        let args = runner.run_args(ContainerCommand::Generate, &request, Utf8Path::new("/tmp/lib"));

        assert_eq!(&args[..2], ["run", "--rm"]);
        assert!(args.contains(&"/tmp/lib:/librarian".to_string()));
        assert!(args.contains(&"/work/repo:/repo".to_string()));
        assert!(args.contains(&"/src/googleapis:/source:ro".to_string()));
        assert!(args.contains(&"/tmp/out:/output".to_string()));
        let image = args.iter().position(|a| a == "gcr.io/lang/gen:1").unwrap();
        assert_eq!(args[image + 1], "generate");
        assert!(args.iter().position(|a| a == "--user").unwrap() < image);
        assert_eq!(args.last().unwrap(), "--library-id=storage");
    }

    #[test]
    fn docker_args_without_optional_mounts() {
        let state = LibrarianState::default();
        let request = ContainerRequest::new("storage", &state, Utf8Path::new("/work/repo"));
        let args = DockerRunner::new("img").run_args(
            ContainerCommand::Build,
            &request,
            Utf8Path::new("/tmp/lib"),
        );
        assert!(!args.iter().any(|a| a.contains("/source") || a.contains("/output")));
    }

    #[test]
    fn request_file_carries_library_and_state() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8(&tmp);
        let state = LibrarianState {
            image: "img".into(),
            libraries: vec![Library {
                id: "storage".into(),
                version: "1.0.0".into(),
                ..Library::default()
            }],
        };
        let request = ContainerRequest::new("storage", &state, Utf8Path::new("/repo"));
        write_request(&dir, ContainerCommand::Build, &request).unwrap();

        let text = std::fs::read_to_string(dir.join("build-request.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["command"], "build");
        assert_eq!(json["library"]["id"], "storage");
        assert_eq!(json["state"]["image"], "img");
    }

    #[test]
    fn missing_response_is_success() {
        let tmp = TempDir::new().unwrap();
        let response = read_response(&utf8(&tmp), ContainerCommand::Build, "lib").unwrap();
        assert_eq!(response, ContainerResponse::default());
    }

    #[test]
    fn response_error_is_a_failure() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8(&tmp);
        std::fs::write(dir.join("test-response.json"), r#"{"error": "3 tests failed"}"#).unwrap();
        let err = read_response(&dir, ContainerCommand::Test, "lib").unwrap_err();
        assert!(matches!(err, ContainerError::Reported { ref message, .. } if message == "3 tests failed"));
    }

    #[test]
    fn configure_response_carries_library() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8(&tmp);
        std::fs::write(
            dir.join("configure-response.json"),
            r#"{"library": {"id": "new", "version": "0.1.0", "source_roots": ["packages/new"]}}"#,
        )
        .unwrap();
        let response = read_response(&dir, ContainerCommand::Configure, "new").unwrap();
        let library = response.library.unwrap();
        assert_eq!(library.id, "new");
        assert_eq!(library.source_roots, vec!["packages/new"]);
    }

    #[test]
    fn malformed_response_is_reported() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8(&tmp);
        std::fs::write(dir.join("build-response.json"), "not json").unwrap();
        assert!(matches!(
            read_response(&dir, ContainerCommand::Build, "lib"),
            Err(ContainerError::Message { .. })
        ));
    }

    #[test]
    fn missing_runtime_is_detected() {
        let runner = DockerRunner::new("img").with_runtime("definitely-not-a-container-runtime");
        assert!(matches!(
            runner.ensure_available(),
            Err(ContainerError::MissingTool(_))
        ));
    }
}
