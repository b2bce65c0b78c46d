//! Code hosting: pull requests, labels, releases.
//!
//! [`GhCli`] shells out to the GitHub CLI, so authentication is whatever
//! `gh auth` already has.

use std::io::Write;
use std::process::{Command, Stdio};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors from the hosting service.
#[derive(Error, Debug)]
pub enum HostingError {
    /// Failed to execute `gh`.
    #[error("failed to run gh: {0}")]
    Exec(#[from] std::io::Error),

    /// `gh` returned a non-zero exit code.
    #[error("gh {command} failed: {stderr}")]
    Command {
        /// The subcommand that failed (e.g. "pr create").
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// `gh` is not installed.
    #[error("gh not found on PATH")]
    MissingTool,

    /// `gh` output could not be interpreted.
    #[error("unexpected gh output: {0}")]
    Output(String),
}

/// Result alias for hosting operations.
pub type HostingResult<T> = Result<T, HostingError>;

/// A pull request to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestSpec {
    /// Title.
    pub title: String,
    /// Markdown body.
    pub body: String,
    /// Branch with the changes.
    pub head: String,
    /// Branch to merge into.
    pub base: String,
    /// Labels to apply on creation.
    pub labels: Vec<String>,
}

/// A pull request known to the hosting service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    /// Number within the repository.
    pub number: u64,
    /// Web URL.
    pub url: String,
    /// Markdown body.
    pub body: String,
    /// Merge commit hash, once merged.
    pub merge_commit: Option<String>,
    /// Current labels.
    pub labels: Vec<String>,
}

/// A release (and tag) to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseSpec {
    /// Tag name; created if it does not exist.
    pub tag: String,
    /// Commit the tag points at.
    pub target_commit: String,
    /// Release title.
    pub title: String,
    /// Markdown notes.
    pub notes: String,
    /// Mark as a pre-release.
    pub prerelease: bool,
}

/// Operations against the repository's hosting service.
pub trait CodeHostingClient {
    /// Open a pull request.
    fn create_pull_request(&self, spec: &PullRequestSpec) -> HostingResult<PullRequest>;

    /// Add labels to a pull request.
    fn add_labels(&self, number: u64, labels: &[String]) -> HostingResult<()>;

    /// Swap one label for another on a pull request.
    fn replace_label(&self, number: u64, remove: &str, add: &str) -> HostingResult<()>;

    /// Comment on a pull request.
    fn comment(&self, number: u64, body: &str) -> HostingResult<()>;

    /// Merged pull requests carrying `label`.
    fn merged_pull_requests(&self, label: &str) -> HostingResult<Vec<PullRequest>>;

    /// URL of the release for `tag`, `None` when there is none.
    fn release_url(&self, tag: &str) -> HostingResult<Option<String>>;

    /// Create a release and its tag, returning the release URL.
    fn create_release(&self, spec: &ReleaseSpec) -> HostingResult<String>;

    /// Content of `path` at `git_ref`, `None` when it does not exist there.
    fn raw_content(&self, path: &str, git_ref: &str) -> HostingResult<Option<String>>;
}

/// [`CodeHostingClient`] backed by the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhCli {
    root: Utf8PathBuf,
    repo: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: u64,
    url: String,
    #[serde(default)]
    body: String,
    merge_commit: Option<GhCommit>,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Deserialize)]
struct GhCommit {
    oid: String,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

impl From<GhPullRequest> for PullRequest {
    fn from(pr: GhPullRequest) -> Self {
        Self {
            number: pr.number,
            url: pr.url,
            body: pr.body,
            merge_commit: pr.merge_commit.map(|c| c.oid),
            labels: pr.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

impl GhCli {
    /// Run `gh` from `root`, letting it infer the repository from the checkout.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            repo: None,
        }
    }

    /// Target `owner/name` explicitly.
    #[must_use]
    pub fn with_repo(mut self, repo: Option<String>) -> Self {
        self.repo = repo;
        self
    }

    /// Fail early if `gh` is not installed.
    pub fn ensure_available() -> HostingResult<()> {
        which::which("gh")
            .map(|_| ())
            .map_err(|_| HostingError::MissingTool)
    }

    /// Run `gh` with `args`, optionally feeding `stdin`, and return stdout.
    fn gh(&self, args: &[&str], stdin: Option<&str>) -> HostingResult<String> {
        let mut command = Command::new("gh");
        command.args(args).current_dir(&self.root);
        if let Some(repo) = &self.repo
            && args.first() != Some(&"api")
        {
            command.args(["--repo", repo.as_str()]);
        }

        let mut child = command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(HostingError::Command {
                command: args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn repo_path(&self) -> &str {
        self.repo.as_deref().unwrap_or("{owner}/{repo}")
    }
}

impl CodeHostingClient for GhCli {
    #[instrument(skip(self, spec), fields(head = %spec.head))]
    fn create_pull_request(&self, spec: &PullRequestSpec) -> HostingResult<PullRequest> {
        let mut args = vec![
            "pr",
            "create",
            "--title",
            spec.title.as_str(),
            "--body-file",
            "-",
            "--head",
            spec.head.as_str(),
            "--base",
            spec.base.as_str(),
        ];
        for label in &spec.labels {
            args.push("--label");
            args.push(label);
        }
        let url = self.gh(&args, Some(&spec.body))?.trim().to_string();
        let number = pull_request_number(&url)?;
        debug!(number, %url, "created pull request");
        Ok(PullRequest {
            number,
            url,
            body: spec.body.clone(),
            merge_commit: None,
            labels: spec.labels.clone(),
        })
    }

    #[instrument(skip(self))]
    fn add_labels(&self, number: u64, labels: &[String]) -> HostingResult<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let number = number.to_string();
        let joined = labels.join(",");
        self.gh(&["pr", "edit", &number, "--add-label", &joined], None)?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn replace_label(&self, number: u64, remove: &str, add: &str) -> HostingResult<()> {
        let number = number.to_string();
        self.gh(
            &["pr", "edit", &number, "--remove-label", remove, "--add-label", add],
            None,
        )?;
        Ok(())
    }

    #[instrument(skip(self, body))]
    fn comment(&self, number: u64, body: &str) -> HostingResult<()> {
        let number = number.to_string();
        self.gh(&["pr", "comment", &number, "--body-file", "-"], Some(body))?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn merged_pull_requests(&self, label: &str) -> HostingResult<Vec<PullRequest>> {
        let output = self.gh(
            &[
                "pr",
                "list",
                "--state",
                "merged",
                "--label",
                label,
                "--json",
                "number,url,body,mergeCommit,labels",
            ],
            None,
        )?;
        let prs: Vec<GhPullRequest> =
            serde_json::from_str(&output).map_err(|e| HostingError::Output(e.to_string()))?;
        debug!(count = prs.len(), "merged pull requests");
        Ok(prs.into_iter().map(PullRequest::from).collect())
    }

    #[instrument(skip(self, spec), fields(tag = %spec.tag))]
    fn create_release(&self, spec: &ReleaseSpec) -> HostingResult<String> {
        let mut args = vec![
            "release",
            "create",
            spec.tag.as_str(),
            "--target",
            spec.target_commit.as_str(),
            "--title",
            spec.title.as_str(),
            "--notes-file",
            "-",
        ];
        if spec.prerelease {
            args.push("--prerelease");
        }
        let url = self.gh(&args, Some(&spec.notes))?.trim().to_string();
        debug!(%url, "created release");
        Ok(url)
    }

    #[instrument(skip(self))]
    fn release_url(&self, tag: &str) -> HostingResult<Option<String>> {
        match self.gh(&["release", "view", tag, "--json", "url", "--jq", ".url"], None) {
            Ok(url) => Ok(Some(url.trim().to_string())),
            Err(HostingError::Command { stderr, .. }) if stderr.contains("release not found") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    fn raw_content(&self, path: &str, git_ref: &str) -> HostingResult<Option<String>> {
        let endpoint = format!("repos/{}/contents/{path}?ref={git_ref}", self.repo_path());
        match self.gh(
            &["api", "-H", "Accept: application/vnd.github.raw", &endpoint],
            None,
        ) {
            Ok(content) => Ok(Some(content)),
            Err(HostingError::Command { stderr, .. }) if stderr.contains("404") => {
                debug!("no such content");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Pull request number from a URL like `https://github.com/o/r/pull/42`.
fn pull_request_number(url: &str) -> HostingResult<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|tail| tail.parse().ok())
        .ok_or_else(|| HostingError::Output(format!("no pull request number in {url:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_from_url() {
        assert_eq!(
            pull_request_number("https://github.com/googleapis/repo/pull/42\n".trim()).unwrap(),
            42
        );
        assert_eq!(
            pull_request_number("https://github.com/googleapis/repo/pull/7/").unwrap(),
            7
        );
        assert!(pull_request_number("created").is_err());
    }

    #[test]
    fn gh_json_converts() {
        let json = r#"[{
            "number": 12,
            "url": "https://github.com/o/r/pull/12",
            "body": "notes",
            "mergeCommit": {"oid": "abc123"},
            "labels": [{"name": "release:pending"}]
        }, {
            "number": 13,
            "url": "https://github.com/o/r/pull/13",
            "mergeCommit": null
        }]"#;
        let prs: Vec<PullRequest> = serde_json::from_str::<Vec<GhPullRequest>>(json)
            .unwrap()
            .into_iter()
            .map(PullRequest::from)
            .collect();
        assert_eq!(prs[0].merge_commit.as_deref(), Some("abc123"));
        assert_eq!(prs[0].labels, vec!["release:pending"]);
        assert_eq!(prs[1].merge_commit, None);
        assert!(prs[1].body.is_empty());
    }

    #[test]
    fn repo_path_placeholder() {
        let gh = GhCli::new("/tmp");
        assert_eq!(gh.repo_path(), "{owner}/{repo}");
        let gh = gh.with_repo(Some("googleapis/google-cloud-go".into()));
        assert_eq!(gh.repo_path(), "googleapis/google-cloud-go");
    }
}
