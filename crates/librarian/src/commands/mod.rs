//! Command implementations

pub mod doctor;

pub mod generate;

pub mod info;

pub mod publish;

pub mod stage;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tracing::debug;

use librarian_core::config::Config;
use librarian_core::container::DockerRunner;
use librarian_core::git::{SystemGit, parse_owner_repo};
use librarian_core::hosting::{GhCli, PullRequest};
use librarian_core::notes::RepoRef;
use librarian_core::pipeline::{BatchOutcome, LibraryReport, LibraryStatus, PipelineEvent, RunSettings};
use librarian_core::state::{DEFAULT_STATE_DIR, load_state};

/// The language repository a command operates on.
pub struct Workspace {
    /// Work tree root.
    pub root: Utf8PathBuf,
    /// The checkout.
    pub git: SystemGit,
    /// Configuration resolved against the checkout.
    pub settings: RunSettings,
}

impl Workspace {
    /// Find the repository containing `cwd` and resolve `config` against it.
    pub fn open(config: &Config, cwd: &Utf8Path) -> anyhow::Result<Self> {
        let root = SystemGit::new(cwd)
            .toplevel()
            .with_context(|| format!("{cwd} is not inside a git repository"))?;
        let git = SystemGit::new(root.clone());
        let repo = hosted_repo(config, &git)?;
        debug!(%root, repo = %repo.slug(), "opened workspace");
        let settings = RunSettings::from_config(config, &root, repo)
            .context("invalid configuration")?;
        Ok(Self { root, git, settings })
    }

    /// `gh` client for this repository.
    pub fn hosting(&self) -> GhCli {
        GhCli::new(self.root.clone()).with_repo(Some(self.settings.repo.slug()))
    }

    /// Container runner for the configured image, or the state document's.
    pub fn container(&self, config: &Config) -> anyhow::Result<DockerRunner> {
        let image = match &self.settings.image {
            Some(image) => image.clone(),
            None => load_state(&self.settings.state_dir)
                .context("failed to read state")?
                .image,
        };
        if image.is_empty() {
            bail!("no container image; set container.image or image in the state document");
        }
        let runner = DockerRunner::new(image)
            .with_runtime(config.container_runtime())
            .with_user(config.container_user().map(str::to_string));
        runner
            .ensure_available()
            .context("container runtime unavailable")?;
        Ok(runner)
    }

    /// State directory relative to the root, as stored in the repository.
    pub fn state_path(&self) -> String {
        self.settings
            .state_dir
            .strip_prefix(&self.root)
            .map_or_else(|_| DEFAULT_STATE_DIR.to_string(), |p| p.as_str().to_string())
    }
}

/// `hosting.repo` if configured, else the `origin` remote.
fn hosted_repo(config: &Config, git: &SystemGit) -> anyhow::Result<RepoRef> {
    if let Some(slug) = config.hosting_repo() {
        return RepoRef::parse(slug).with_context(|| format!("hosting.repo {slug:?} is not owner/name"));
    }
    let Some(url) = git.remote_url().context("failed to read remote")? else {
        bail!("no origin remote; set hosting.repo in configuration");
    };
    match parse_owner_repo(&url) {
        Some((owner, name)) => Ok(RepoRef::new(owner, name)),
        None => bail!("cannot read owner/name from remote {url}; set hosting.repo"),
    }
}

/// Resolve `path` against `cwd` unless it is absolute.
pub fn absolutize(cwd: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

// ──────────────────────────────────────────────
// Progress
// ──────────────────────────────────────────────

/// Spinner per library while a batch runs; one result line when it ends.
#[derive(Default)]
pub struct BatchProgress {
    quiet: bool,
    spinner: Option<ProgressBar>,
}

impl BatchProgress {
    /// Progress display, or nothing when `quiet`.
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            spinner: None,
        }
    }

    /// Render one pipeline event.
    pub fn handle(&mut self, event: PipelineEvent) {
        if self.quiet {
            return;
        }
        match event {
            PipelineEvent::LibraryStarted(id) => {
                let spinner = ProgressBar::new_spinner();
                spinner.set_style(
                    ProgressStyle::with_template("  {spinner:.cyan} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                spinner.set_message(id);
                spinner.enable_steady_tick(std::time::Duration::from_millis(80));
                self.spinner = Some(spinner);
            }
            PipelineEvent::PhaseStarted { library, phase } => {
                if let Some(spinner) = &self.spinner {
                    spinner.set_message(format!("{library}: {phase}..."));
                }
            }
            PipelineEvent::LibraryFinished(report) => {
                if let Some(spinner) = self.spinner.take() {
                    spinner.finish_and_clear();
                }
                print_report(&report);
            }
        }
    }
}

fn print_report(report: &LibraryReport) {
    match &report.status {
        LibraryStatus::Done { message } => {
            println!("  {} {} {}", "✓".green(), report.id.bold(), message.dimmed());
        }
        LibraryStatus::Skipped { reason } => {
            println!(
                "  {} {} {}",
                "–".yellow(),
                report.id.bold(),
                format!("skipped: {reason}").dimmed()
            );
        }
        LibraryStatus::Failed { phase, message } => {
            println!("  {} {} {phase} failed: {message}", "✗".red(), report.id.bold());
        }
    }
}

/// Counts line plus the pull request, if one was opened.
pub fn print_batch_summary(what: &str, outcome: &BatchOutcome, pull_request: Option<&PullRequest>) {
    println!();
    let counts = format!(
        "{} succeeded, {} skipped, {} failed",
        outcome.succeeded.len(),
        outcome.skipped.len(),
        outcome.failed.len()
    );
    if outcome.failed.is_empty() {
        println!("{} {what}: {counts}", "✓".green().bold());
    } else {
        println!("{} {what}: {counts}", "!".yellow().bold());
    }
    if let Some(pr) = pull_request {
        println!("  {}: {}", "Pull request".dimmed(), pr.url.cyan());
    }
}
