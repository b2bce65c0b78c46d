//! Version control.
//!
//! [`VersionControl`] is everything the pipelines ask of a repository.
//! [`SystemGit`] implements it by shelling out to `git`, which inherits the
//! user's SSH keys, signing setup, and hooks.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::commit::RawCommit;
use crate::workspace::LOCK_FILE;

/// Errors from git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// Failed to execute the `git` command.
    #[error("failed to run git: {0}")]
    Exec(#[from] std::io::Error),

    /// `git` returned a non-zero exit code.
    #[error("git {command} failed: {stderr}")]
    Command {
        /// The git subcommand that failed (e.g., "status").
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// Not inside a git repository.
    #[error("not a git repository (or any parent up to mount point)")]
    NotARepo,

    /// `git` produced output we could not interpret.
    #[error("unexpected git output: {0}")]
    Output(String),
}

/// Result alias for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Repository operations used by the pipelines.
pub trait VersionControl {
    /// Working tree root.
    fn root(&self) -> &Utf8Path;

    /// Hash of `HEAD`.
    fn head_hash(&self) -> GitResult<String>;

    /// Resolve a revision (branch, tag, hash) to a commit hash, `None` if unknown.
    fn resolve(&self, rev: &str) -> GitResult<Option<String>>;

    /// Paths touched by `commit`, relative to the root.
    fn changed_files(&self, commit: &str) -> GitResult<Vec<String>>;

    /// Object ID of `path` at `commit`; empty when the path does not exist there.
    fn content_hash(&self, commit: &str, path: &str) -> GitResult<String>;

    /// Commits reachable from `to` but not `from`, newest first, limited to
    /// those touching `paths` (all commits when `paths` is empty).
    fn commits_between(
        &self,
        from: Option<&str>,
        to: &str,
        paths: &[String],
    ) -> GitResult<Vec<RawCommit>>;

    /// Create and switch to `branch`.
    fn checkout_branch(&self, branch: &str) -> GitResult<()>;

    /// Stage everything and commit, returning the new commit hash.
    fn commit(&self, message: &str) -> GitResult<String>;

    /// Push `branch` to the configured remote.
    fn push(&self, branch: &str) -> GitResult<()>;

    /// Whether the working tree has no uncommitted changes.
    fn is_clean(&self) -> GitResult<bool>;

    /// Reset `paths` to `HEAD`, removing untracked files under them.
    fn restore(&self, paths: &[String]) -> GitResult<()>;
}

/// [`VersionControl`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct SystemGit {
    root: Utf8PathBuf,
    remote: String,
}

impl SystemGit {
    /// Operate on the repository at `root`, pushing to `origin`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            remote: "origin".to_string(),
        }
    }

    /// Push to `remote` instead of `origin`.
    #[must_use]
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Check whether `root` is inside a git work tree.
    #[instrument(skip(self))]
    pub fn is_inside_repo(&self) -> GitResult<bool> {
        match self.git(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(output) => Ok(output.trim() == "true"),
            Err(GitError::Command { .. } | GitError::NotARepo) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Root of the work tree containing `root`.
    #[instrument(skip(self))]
    pub fn toplevel(&self) -> GitResult<Utf8PathBuf> {
        let top = self.git(&["rev-parse", "--show-toplevel"])?;
        let top = top.trim();
        if top.is_empty() {
            return Err(GitError::Output("empty --show-toplevel".to_string()));
        }
        Ok(Utf8PathBuf::from(top))
    }

    /// URL of the configured remote, `None` if it does not exist.
    #[instrument(skip(self))]
    pub fn remote_url(&self) -> GitResult<Option<String>> {
        match self.git(&["remote", "get-url", &self.remote]) {
            Ok(url) => {
                let url = url.trim().to_string();
                debug!(remote = %self.remote, %url, "remote URL");
                Ok(Some(url))
            }
            Err(GitError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run a git command in the repository root and return its stdout.
    fn git(&self, args: &[&str]) -> GitResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

            if stderr.contains("not a git repository") {
                return Err(GitError::NotARepo);
            }

            Err(GitError::Command {
                command: args.first().unwrap_or(&"").to_string(),
                stderr,
            })
        }
    }
}

/// Field and record separators for `git log` output.
const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

impl VersionControl for SystemGit {
    fn root(&self) -> &Utf8Path {
        &self.root
    }

    #[instrument(skip(self))]
    fn head_hash(&self) -> GitResult<String> {
        let head = self.git(&["rev-parse", "HEAD"])?.trim().to_string();
        debug!(%head, "head");
        Ok(head)
    }

    #[instrument(skip(self))]
    fn resolve(&self, rev: &str) -> GitResult<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        match self.git(&["rev-parse", "--verify", "--quiet", &spec]) {
            Ok(hash) => Ok(Some(hash.trim().to_string())),
            Err(GitError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    fn changed_files(&self, commit: &str) -> GitResult<Vec<String>> {
        let output = self.git(&[
            "diff-tree",
            "--no-commit-id",
            "--name-only",
            "-r",
            "--root",
            commit,
        ])?;
        let files: Vec<String> = output
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(count = files.len(), "changed files");
        Ok(files)
    }

    #[instrument(skip(self))]
    fn content_hash(&self, commit: &str, path: &str) -> GitResult<String> {
        if self.resolve(commit)?.is_none() {
            return Err(GitError::Command {
                command: "rev-parse".to_string(),
                stderr: format!("unknown revision {commit}"),
            });
        }
        let spec = format!("{commit}:{}", path.trim_end_matches('/'));
        match self.git(&["rev-parse", "--verify", "--quiet", &spec]) {
            Ok(hash) => Ok(hash.trim().to_string()),
            Err(GitError::Command { .. }) => {
                debug!("path absent at commit");
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    fn commits_between(
        &self,
        from: Option<&str>,
        to: &str,
        paths: &[String],
    ) -> GitResult<Vec<RawCommit>> {
        let range = from.map_or_else(|| to.to_string(), |from| format!("{from}..{to}"));
        let format = format!("--format=%H{FIELD_SEP}%ct{FIELD_SEP}%B{RECORD_SEP}");

        let mut args = vec!["log", range.as_str(), format.as_str()];
        if !paths.is_empty() {
            args.push("--");
            args.extend(paths.iter().map(String::as_str));
        }

        let output = self.git(&args)?;
        let commits = parse_log(&output)?;
        debug!(count = commits.len(), "commits in range");
        Ok(commits)
    }

    #[instrument(skip(self))]
    fn checkout_branch(&self, branch: &str) -> GitResult<()> {
        self.git(&["checkout", "-b", branch])?;
        Ok(())
    }

    #[instrument(skip(self, message))]
    fn commit(&self, message: &str) -> GitResult<String> {
        let exclude = lock_exclude();
        self.git(&["add", "--all", "--", ".", exclude.as_str()])?;
        self.git(&["commit", "--quiet", "--message", message])?;
        self.head_hash()
    }

    #[instrument(skip(self))]
    fn push(&self, branch: &str) -> GitResult<()> {
        self.git(&["push", "--set-upstream", &self.remote, branch])?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn is_clean(&self) -> GitResult<bool> {
        let exclude = lock_exclude();
        let output = self.git(&[
            "status",
            "--porcelain",
            "--untracked-files=all",
            "--",
            ".",
            exclude.as_str(),
        ])?;
        let clean = output.trim().is_empty();
        debug!(clean, "working tree status");
        Ok(clean)
    }

    #[instrument(skip(self))]
    fn restore(&self, paths: &[String]) -> GitResult<()> {
        for path in paths {
            let tracked = self.git(&["ls-files", "--", path])?;
            if !tracked.trim().is_empty() {
                self.git(&[
                    "restore",
                    "--source=HEAD",
                    "--staged",
                    "--worktree",
                    "--",
                    path,
                ])?;
            }
            self.git(&["clean", "-fdq", "--", path])?;
        }
        debug!(count = paths.len(), "restored paths");
        Ok(())
    }
}

/// Pathspec keeping the workspace lock out of status and commits.
fn lock_exclude() -> String {
    format!(":(exclude,glob)**/{LOCK_FILE}")
}

fn parse_log(output: &str) -> GitResult<Vec<RawCommit>> {
    output
        .split(RECORD_SEP)
        .map(|record| record.trim_start_matches('\n'))
        .filter(|record| !record.trim().is_empty())
        .map(|record| {
            let mut fields = record.splitn(3, FIELD_SEP);
            let (Some(hash), Some(time), Some(message)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(GitError::Output(format!("malformed log record: {record:?}")));
            };
            let timestamp = time
                .trim()
                .parse::<i64>()
                .map_err(|e| GitError::Output(format!("bad commit time {time:?}: {e}")))?;
            Ok(RawCommit::new(hash.trim(), message.trim_end(), timestamp))
        })
        .collect()
}

/// Parse owner and repo from a git remote URL.
///
/// Handles both HTTPS and SSH formats:
/// - `https://github.com/owner/repo.git`
/// - `git@github.com:owner/repo.git`
///
/// Returns `None` if the URL cannot be parsed.
pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let path = url.strip_prefix("git@").map_or_else(
        || {
            url.split("//")
                .nth(1)
                .and_then(|after_scheme| after_scheme.split_once('/').map(|(_, path)| path))
        },
        |rest| rest.split_once(':').map(|(_, path)| path),
    )?;

    let path = path.strip_suffix(".git").unwrap_or(path);
    let (owner, repo) = path.split_once('/')?;

    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }

    Some((owner.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A scratch repository with an identity configured, or `None` when git is missing.
    fn scratch_repo() -> Option<(TempDir, SystemGit)> {
        which::which("git").ok()?;
        let tmp = TempDir::new().ok()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).ok()?;
        let git = SystemGit::new(root);
        git.git(&["init", "--quiet"]).ok()?;
        git.git(&["config", "user.name", "Librarian Test"]).ok()?;
        git.git(&["config", "user.email", "test@example.com"]).ok()?;
        git.git(&["config", "commit.gpgsign", "false"]).ok()?;
        Some((tmp, git))
    }

    fn write(git: &SystemGit, path: &str, contents: &str) {
        let full = git.root().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }

    #[test]
    fn parse_log_records() {
        let output = "aaa\x1f100\x1ffeat: one\n\nbody\n\x1e\nbbb\x1f200\x1ffix: two\n\x1e\n";
        let commits = parse_log(output).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0], RawCommit::new("aaa", "feat: one\n\nbody", 100));
        assert_eq!(commits[1], RawCommit::new("bbb", "fix: two", 200));
    }

    #[test]
    fn parse_log_rejects_garbage() {
        assert!(parse_log("just text").is_err());
        assert!(parse_log("").unwrap().is_empty());
    }

    #[test]
    fn repository_round_trip() {
        let Some((_tmp, git)) = scratch_repo() else {
            return;
        };

        write(&git, "apis/foo/v1/foo.proto", "v1");
        let first = git.commit("feat: add foo").unwrap();
        write(&git, "apis/bar/v1/bar.proto", "v1");
        let second = git.commit("fix: add bar\n\nLibrary-IDs: bar").unwrap();

        assert!(git.is_clean().unwrap());
        assert_eq!(git.head_hash().unwrap(), second);
        assert_eq!(git.changed_files(&second).unwrap(), vec!["apis/bar/v1/bar.proto"]);

        let all = git.commits_between(None, "HEAD", &[]).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].hash, second);
        assert_eq!(all[0].message, "fix: add bar\n\nLibrary-IDs: bar");

        let since = git.commits_between(Some(&first), "HEAD", &[]).unwrap();
        assert_eq!(since.len(), 1);

        let foo_only = git
            .commits_between(None, "HEAD", &["apis/foo".to_string()])
            .unwrap();
        assert_eq!(foo_only.len(), 1);
        assert_eq!(foo_only[0].hash, first);

        let foo_before = git.content_hash(&first, "apis/foo").unwrap();
        let foo_after = git.content_hash(&second, "apis/foo/").unwrap();
        assert!(!foo_before.is_empty());
        assert_eq!(foo_before, foo_after);
        assert_eq!(git.content_hash(&first, "apis/bar").unwrap(), "");
        assert!(git.content_hash("0000000000000000000000000000000000000000", "apis").is_err());
    }

    #[test]
    fn restore_discards_changes_under_paths() {
        let Some((_tmp, git)) = scratch_repo() else {
            return;
        };

        write(&git, "pkg/a.txt", "original");
        git.commit("chore: seed").unwrap();

        write(&git, "pkg/a.txt", "changed");
        write(&git, "pkg/new.txt", "untracked");
        write(&git, "fresh/b.txt", "never committed");
        assert!(!git.is_clean().unwrap());

        git.restore(&["pkg".to_string(), "fresh".to_string()]).unwrap();
        assert!(git.is_clean().unwrap());
        assert_eq!(
            std::fs::read_to_string(git.root().join("pkg/a.txt")).unwrap(),
            "original"
        );
    }

    #[test]
    fn workspace_lock_is_invisible() {
        let Some((_tmp, git)) = scratch_repo() else {
            return;
        };
        write(&git, "a", "a");
        git.commit("chore: seed").unwrap();

        write(&git, ".librarian/run.lock", "1234");
        assert!(git.is_clean().unwrap());

        write(&git, ".librarian/state.yaml", "libraries: []");
        assert!(!git.is_clean().unwrap());
        git.commit("chore: state").unwrap();
        assert!(git.is_clean().unwrap());
        let files = git.changed_files(&git.head_hash().unwrap()).unwrap();
        assert_eq!(files, vec![".librarian/state.yaml"]);
    }

    #[test]
    fn resolve_unknown_revision() {
        let Some((_tmp, git)) = scratch_repo() else {
            return;
        };
        write(&git, "a", "a");
        git.commit("chore: seed").unwrap();
        assert!(git.resolve("no-such-tag").unwrap().is_none());
        assert!(git.resolve("HEAD").unwrap().is_some());
    }

    #[test]
    fn toplevel_from_subdirectory() {
        let Some((_tmp, git)) = scratch_repo() else {
            return;
        };
        write(&git, "packages/a/x", "x");
        let nested = SystemGit::new(git.root().join("packages/a"));
        let top = nested.toplevel().unwrap();
        assert_eq!(top.file_name(), git.root().file_name());
    }

    #[test]
    fn parse_owner_repo_https() {
        let result = parse_owner_repo("https://github.com/googleapis/google-cloud-go.git");
        assert_eq!(result, Some(("googleapis".into(), "google-cloud-go".into())));
    }

    #[test]
    fn parse_owner_repo_ssh() {
        let result = parse_owner_repo("git@github.com:googleapis/google-cloud-go");
        assert_eq!(result, Some(("googleapis".into(), "google-cloud-go".into())));
    }

    #[test]
    fn parse_owner_repo_invalid() {
        assert!(parse_owner_repo("not-a-url").is_none());
        assert!(parse_owner_repo("").is_none());
    }
}
