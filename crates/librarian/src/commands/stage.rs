//! Stage command: thin CLI layer over `librarian_core::stage`.

use anyhow::Context;
use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use librarian_core::commit::CommitParser;
use librarian_core::config::Config;
use librarian_core::hosting::GhCli;
use librarian_core::notes::SectionHeadings;
use librarian_core::stage::{StageOptions, Stager};

use super::{BatchProgress, Workspace, print_batch_summary};

/// Arguments for the `stage` subcommand.
#[derive(Args, Debug, Default)]
pub struct StageArgs {
    /// Only this library
    #[arg(long, value_name = "ID")]
    pub library: Option<String>,

    /// Commit the result on a new branch
    #[arg(long)]
    pub commit: bool,

    /// Push the branch and open a release pull request (implies --commit)
    #[arg(long)]
    pub push: bool,

    /// Print the release pull request body
    #[arg(long)]
    pub show_notes: bool,
}

/// Execute the stage command.
#[instrument(name = "cmd_stage", skip_all)]
pub fn cmd_stage(
    args: StageArgs,
    global_json: bool,
    config: &Config,
    cwd: &camino::Utf8Path,
) -> anyhow::Result<()> {
    let options = StageOptions {
        library: args.library,
        commit: args.commit || args.push,
        push: args.push,
    };
    debug!(json_output = global_json, ?options, "executing stage command");

    let workspace = Workspace::open(config, cwd)?;
    let container = workspace.container(config)?;
    let hosting = workspace.hosting();
    if options.push {
        GhCli::ensure_available().context("pull requests need the gh CLI")?;
    }

    let parser = CommitParser::new();
    let headings = SectionHeadings::default();
    let stager = Stager {
        repo: &workspace.git,
        container: &container,
        hosting: &hosting,
        settings: &workspace.settings,
        parser: &parser,
        headings: &headings,
    };

    if !global_json {
        println!("{} {}", "Staging releases for".bold(), workspace.settings.repo.slug().cyan());
    }
    let mut progress = BatchProgress::new(global_json);
    let outcome = stager
        .execute(&options, |event| progress.handle(event))
        .context("release staging failed")?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if !outcome.releases.is_empty() {
        println!();
        println!("{}", "Releases".bold().underline());
        for release in &outcome.releases {
            println!(
                "  {} {} → {} {}",
                release.id.bold(),
                release.previous_version.dimmed(),
                release.version.green(),
                format!("({}, {})", release.level, release.tag).dimmed()
            );
        }
    }
    print_batch_summary("Release staging", &outcome.outcome, outcome.pull_request.as_ref());
    if args.show_notes {
        println!();
        print!("{}", outcome.notes);
    }
    Ok(())
}
