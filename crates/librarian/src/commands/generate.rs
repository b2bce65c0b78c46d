//! Generate command: thin CLI layer over `librarian_core::generate`.

use anyhow::{Context, bail};
use camino::Utf8PathBuf;
use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use librarian_core::commit::CommitParser;
use librarian_core::config::Config;
use librarian_core::generate::{GenerateOptions, Generator};
use librarian_core::git::SystemGit;
use librarian_core::hosting::GhCli;

use super::{BatchProgress, Workspace, absolutize, print_batch_summary};

/// Arguments for the `generate` subcommand.
#[derive(Args, Debug, Default)]
pub struct GenerateArgs {
    /// Only this library (configured first when new)
    #[arg(long, value_name = "ID")]
    pub library: Option<String>,

    /// API path for a library being configured
    #[arg(long, value_name = "PATH", requires = "library")]
    pub api_path: Option<String>,

    /// Local checkout of the API-source repository (overrides repo.source_dir)
    #[arg(long, value_name = "DIR")]
    pub source: Option<Utf8PathBuf>,

    /// Regenerate even when API definitions are unchanged
    #[arg(long)]
    pub force: bool,

    /// Build each regenerated library
    #[arg(long)]
    pub build: bool,

    /// Test each regenerated library
    #[arg(long)]
    pub test: bool,

    /// Commit the result on a new branch
    #[arg(long)]
    pub commit: bool,

    /// Push the branch and open a pull request (implies --commit)
    #[arg(long)]
    pub push: bool,
}

impl GenerateArgs {
    fn options(&self, config: &Config) -> GenerateOptions {
        GenerateOptions {
            library: self.library.clone(),
            api_path: self.api_path.clone(),
            force: self.force,
            build: self.build || config.generate_build(),
            test: self.test || config.generate_test(),
            commit: self.commit || self.push,
            push: self.push,
        }
    }
}

/// Execute the generate command.
#[instrument(name = "cmd_generate", skip_all)]
pub fn cmd_generate(
    args: GenerateArgs,
    global_json: bool,
    config: &Config,
    cwd: &camino::Utf8Path,
) -> anyhow::Result<()> {
    let options = args.options(config);
    debug!(json_output = global_json, ?options, "executing generate command");

    let workspace = Workspace::open(config, cwd)?;
    let Some(source_dir) = args.source.as_deref().or(config.source_dir()) else {
        bail!("no API-source checkout; pass --source or set repo.source_dir");
    };
    let source = SystemGit::new(absolutize(cwd, source_dir));
    let container = workspace.container(config)?;
    let hosting = workspace.hosting();
    if options.push {
        GhCli::ensure_available().context("pull requests need the gh CLI")?;
    }

    let parser = CommitParser::new();
    let generator = Generator {
        repo: &workspace.git,
        source: &source,
        container: &container,
        hosting: &hosting,
        settings: &workspace.settings,
        parser: &parser,
    };

    if !global_json {
        println!("{} {}", "Generating".bold(), workspace.settings.repo.slug().cyan());
    }
    let mut progress = BatchProgress::new(global_json);
    let outcome = generator
        .execute(&options, |event| progress.handle(event))
        .context("generation failed")?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_batch_summary("Generation", &outcome.outcome, outcome.pull_request.as_ref());
        if let (Some(branch), None) = (&outcome.branch, &outcome.pull_request) {
            println!("  {}: {}", "Branch".dimmed(), branch.cyan());
        }
    }
    Ok(())
}
