//! In-memory doubles for the collaborator traits.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};

use crate::attribution::is_under;
use crate::commit::RawCommit;
use crate::container::{
    ContainerCommand, ContainerError, ContainerRequest, ContainerResponse, ContainerResult,
    ContainerRunner,
};
use crate::git::{GitError, GitResult, VersionControl};
use crate::hosting::{
    CodeHostingClient, HostingError, HostingResult, PullRequest, PullRequestSpec, ReleaseSpec,
};
use crate::state::Library;

// ──────────────────────────────────────────────
// Version control
// ──────────────────────────────────────────────

/// Scripted repository. History is kept oldest first.
#[derive(Debug)]
pub struct FakeVcs {
    root: Utf8PathBuf,
    head: String,
    history: Vec<RawCommit>,
    changed: HashMap<String, Vec<String>>,
    failing_changed: HashSet<String>,
    hashes: HashMap<(String, String), String>,
    failing_hashes: bool,
    refs: HashMap<String, String>,
    failing_push: bool,
    clean: Cell<bool>,
    pub commits: RefCell<Vec<String>>,
    pub branches: RefCell<Vec<String>>,
    pub pushes: RefCell<Vec<String>>,
    pub restores: RefCell<Vec<Vec<String>>>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::at(".")
    }

    pub fn at(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            head: "head".to_string(),
            history: Vec::new(),
            changed: HashMap::new(),
            failing_changed: HashSet::new(),
            hashes: HashMap::new(),
            failing_hashes: false,
            refs: HashMap::new(),
            failing_push: false,
            clean: Cell::new(true),
            commits: RefCell::new(Vec::new()),
            branches: RefCell::new(Vec::new()),
            pushes: RefCell::new(Vec::new()),
            restores: RefCell::new(Vec::new()),
        }
    }

    pub fn with_head(mut self, head: &str) -> Self {
        self.head = head.to_string();
        self
    }

    /// Append a commit to history and make it `HEAD`.
    pub fn with_commit(mut self, hash: &str, message: &str, files: &[&str]) -> Self {
        let timestamp = i64::try_from(self.history.len()).unwrap_or_default() + 1;
        self.history.push(RawCommit::new(hash, message, timestamp));
        self.head = hash.to_string();
        self.with_changed_files(hash, files)
    }

    pub fn with_changed_files(mut self, commit: &str, files: &[&str]) -> Self {
        self.changed.insert(
            commit.to_string(),
            files.iter().map(|f| (*f).to_string()).collect(),
        );
        self
    }

    pub fn failing_changed_files(mut self, commit: &str) -> Self {
        self.failing_changed.insert(commit.to_string());
        self
    }

    pub fn with_content_hash(mut self, commit: &str, path: &str, hash: &str) -> Self {
        self.hashes
            .insert((commit.to_string(), path.to_string()), hash.to_string());
        self
    }

    pub fn failing_content_hash(mut self) -> Self {
        self.failing_hashes = true;
        self
    }

    pub fn with_ref(mut self, name: &str, hash: &str) -> Self {
        self.refs.insert(name.to_string(), hash.to_string());
        self
    }

    pub fn failing_push(mut self) -> Self {
        self.failing_push = true;
        self
    }

    /// Report uncommitted changes until the next commit.
    pub fn dirty(self) -> Self {
        self.clean.set(false);
        self
    }

    fn position(&self, hash: &str) -> Option<usize> {
        self.history.iter().position(|c| c.hash == hash)
    }
}

fn command_failed(command: &str) -> GitError {
    GitError::Command {
        command: command.to_string(),
        stderr: "scripted failure".to_string(),
    }
}

impl VersionControl for FakeVcs {
    fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn head_hash(&self) -> GitResult<String> {
        Ok(self.head.clone())
    }

    fn resolve(&self, rev: &str) -> GitResult<Option<String>> {
        if let Some(hash) = self.refs.get(rev) {
            return Ok(Some(hash.clone()));
        }
        Ok(self.position(rev).map(|_| rev.to_string()))
    }

    fn changed_files(&self, commit: &str) -> GitResult<Vec<String>> {
        if self.failing_changed.contains(commit) {
            return Err(command_failed("diff-tree"));
        }
        Ok(self.changed.get(commit).cloned().unwrap_or_default())
    }

    fn content_hash(&self, commit: &str, path: &str) -> GitResult<String> {
        if self.failing_hashes {
            return Err(command_failed("rev-parse"));
        }
        Ok(self
            .hashes
            .get(&(commit.to_string(), path.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn commits_between(
        &self,
        from: Option<&str>,
        to: &str,
        paths: &[String],
    ) -> GitResult<Vec<RawCommit>> {
        let end = self
            .position(to)
            .map_or(self.history.len(), |index| index + 1);
        let start = from
            .and_then(|hash| self.position(hash))
            .map_or(0, |index| index + 1);
        let selected = self.history[start.min(end)..end]
            .iter()
            .rev()
            .filter(|commit| {
                paths.is_empty()
                    || self.changed.get(&commit.hash).is_some_and(|files| {
                        files
                            .iter()
                            .any(|file| paths.iter().any(|path| is_under(file, path)))
                    })
            })
            .cloned()
            .collect();
        Ok(selected)
    }

    fn checkout_branch(&self, branch: &str) -> GitResult<()> {
        self.branches.borrow_mut().push(branch.to_string());
        Ok(())
    }

    fn commit(&self, message: &str) -> GitResult<String> {
        let mut commits = self.commits.borrow_mut();
        commits.push(message.to_string());
        self.clean.set(true);
        Ok(format!("local{}", commits.len()))
    }

    fn push(&self, branch: &str) -> GitResult<()> {
        if self.failing_push {
            return Err(command_failed("push"));
        }
        self.pushes.borrow_mut().push(branch.to_string());
        Ok(())
    }

    fn is_clean(&self) -> GitResult<bool> {
        Ok(self.clean.get())
    }

    fn restore(&self, paths: &[String]) -> GitResult<()> {
        self.restores.borrow_mut().push(paths.to_vec());
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Container
// ──────────────────────────────────────────────

/// Scripted container: records calls, fails where told to, and writes
/// canned output on `generate`.
#[derive(Debug, Default)]
pub struct FakeContainer {
    failures: HashMap<(ContainerCommand, String), String>,
    configured: HashMap<String, Library>,
    outputs: HashMap<String, Vec<(String, String)>>,
    pub calls: RefCell<Vec<(ContainerCommand, String)>>,
}

impl FakeContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, command: ContainerCommand, library: &str, message: &str) -> Self {
        self.failures
            .insert((command, library.to_string()), message.to_string());
        self
    }

    pub fn configures(mut self, library: Library) -> Self {
        self.configured.insert(library.id.clone(), library);
        self
    }

    pub fn generates(mut self, library: &str, path: &str, contents: &str) -> Self {
        self.outputs
            .entry(library.to_string())
            .or_default()
            .push((path.to_string(), contents.to_string()));
        self
    }

    pub fn calls_for(&self, command: ContainerCommand) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|(c, _)| *c == command)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

impl ContainerRunner for FakeContainer {
    fn run(
        &self,
        command: ContainerCommand,
        request: &ContainerRequest<'_>,
    ) -> ContainerResult<ContainerResponse> {
        let library = request.library_id.to_string();
        self.calls.borrow_mut().push((command, library.clone()));

        if let Some(message) = self.failures.get(&(command, library.clone())) {
            return Err(ContainerError::Reported {
                command,
                library,
                message: message.clone(),
            });
        }

        match command {
            ContainerCommand::Configure => Ok(ContainerResponse {
                error: String::new(),
                library: self.configured.get(&library).cloned(),
            }),
            ContainerCommand::Generate => {
                if let (Some(out), Some(files)) = (request.output_dir, self.outputs.get(&library)) {
                    for (path, contents) in files {
                        let target = out.join(path);
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent).map_err(|source| {
                                ContainerError::Io {
                                    path: parent.to_path_buf(),
                                    source,
                                }
                            })?;
                        }
                        std::fs::write(&target, contents)
                            .map_err(|source| ContainerError::Io { path: target, source })?;
                    }
                }
                Ok(ContainerResponse::default())
            }
            _ => Ok(ContainerResponse::default()),
        }
    }
}

// ──────────────────────────────────────────────
// Hosting
// ──────────────────────────────────────────────

/// Scripted hosting service that records every mutation.
#[derive(Debug, Default)]
pub struct FakeHosting {
    merged: Vec<PullRequest>,
    raw: HashMap<(String, String), String>,
    failing_pull_requests: bool,
    failing_releases: bool,
    failing_once: RefCell<HashSet<String>>,
    pub pull_requests: RefCell<Vec<PullRequestSpec>>,
    pub comments: RefCell<Vec<(u64, String)>>,
    pub labels: RefCell<Vec<(u64, String)>>,
    pub replaced: RefCell<Vec<(u64, String, String)>>,
    pub releases: RefCell<Vec<ReleaseSpec>>,
}

impl FakeHosting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merged(mut self, pull_request: PullRequest) -> Self {
        self.merged.push(pull_request);
        self
    }

    pub fn with_raw_content(mut self, path: &str, git_ref: &str, content: &str) -> Self {
        self.raw
            .insert((path.to_string(), git_ref.to_string()), content.to_string());
        self
    }

    pub fn failing_pull_requests(mut self) -> Self {
        self.failing_pull_requests = true;
        self
    }

    pub fn failing_releases(mut self) -> Self {
        self.failing_releases = true;
        self
    }

    /// The first attempt to release `tag` fails; later attempts succeed.
    pub fn failing_release_once(self, tag: &str) -> Self {
        self.failing_once.borrow_mut().insert(tag.to_string());
        self
    }
}

fn hosting_failed(command: &str) -> HostingError {
    HostingError::Command {
        command: command.to_string(),
        stderr: "scripted failure".to_string(),
    }
}

impl CodeHostingClient for FakeHosting {
    fn create_pull_request(&self, spec: &PullRequestSpec) -> HostingResult<PullRequest> {
        if self.failing_pull_requests {
            return Err(hosting_failed("pr create"));
        }
        let mut created = self.pull_requests.borrow_mut();
        created.push(spec.clone());
        let number = 100 + created.len() as u64;
        Ok(PullRequest {
            number,
            url: format!("https://github.com/o/r/pull/{number}"),
            body: spec.body.clone(),
            merge_commit: None,
            labels: spec.labels.clone(),
        })
    }

    fn add_labels(&self, number: u64, labels: &[String]) -> HostingResult<()> {
        let mut added = self.labels.borrow_mut();
        added.extend(labels.iter().map(|label| (number, label.clone())));
        Ok(())
    }

    fn replace_label(&self, number: u64, remove: &str, add: &str) -> HostingResult<()> {
        self.replaced
            .borrow_mut()
            .push((number, remove.to_string(), add.to_string()));
        Ok(())
    }

    fn comment(&self, number: u64, body: &str) -> HostingResult<()> {
        self.comments.borrow_mut().push((number, body.to_string()));
        Ok(())
    }

    fn merged_pull_requests(&self, label: &str) -> HostingResult<Vec<PullRequest>> {
        Ok(self
            .merged
            .iter()
            .filter(|pr| pr.labels.iter().any(|l| l == label))
            .cloned()
            .collect())
    }

    fn release_url(&self, tag: &str) -> HostingResult<Option<String>> {
        let exists = self.releases.borrow().iter().any(|r| r.tag == tag);
        Ok(exists.then(|| format!("https://github.com/o/r/releases/tag/{tag}")))
    }

    fn create_release(&self, spec: &ReleaseSpec) -> HostingResult<String> {
        if self.failing_releases || self.failing_once.borrow_mut().remove(&spec.tag) {
            return Err(hosting_failed("release create"));
        }
        self.releases.borrow_mut().push(spec.clone());
        Ok(format!("https://github.com/o/r/releases/tag/{}", spec.tag))
    }

    fn raw_content(&self, path: &str, git_ref: &str) -> HostingResult<Option<String>> {
        Ok(self
            .raw
            .get(&(path.to_string(), git_ref.to_string()))
            .cloned())
    }
}
