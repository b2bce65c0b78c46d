//! Publish command: tag and release merged release pull requests.

use anyhow::Context;
use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use librarian_core::config::Config;
use librarian_core::hosting::GhCli;
use librarian_core::publish::{PublishOptions, Publisher};

use super::Workspace;

/// Arguments for the `publish` subcommand.
#[derive(Args, Debug, Default)]
pub struct PublishArgs {
    /// Show the releases that would be created without creating them
    #[arg(long)]
    pub dry_run: bool,
}

/// Execute the publish command.
#[instrument(name = "cmd_publish", skip_all)]
pub fn cmd_publish(
    args: PublishArgs,
    global_json: bool,
    config: &Config,
    cwd: &camino::Utf8Path,
) -> anyhow::Result<()> {
    debug!(json_output = global_json, dry_run = args.dry_run, "executing publish command");

    GhCli::ensure_available().context("publishing needs the gh CLI")?;
    let workspace = Workspace::open(config, cwd)?;
    let hosting = workspace.hosting();
    let state_path = workspace.state_path();
    let publisher = Publisher {
        hosting: &hosting,
        settings: &workspace.settings,
        state_path: &state_path,
    };

    let outcome = publisher
        .execute(PublishOptions {
            dry_run: args.dry_run,
        })
        .context("publishing failed")?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if args.dry_run {
        println!("\n{}", "DRY RUN: nothing will be created".yellow().bold());
    }
    if outcome.pull_requests.is_empty() {
        println!(
            "{} No merged pull requests labelled {}",
            "○".dimmed(),
            workspace.settings.pending_label.cyan()
        );
        return Ok(());
    }
    for number in &outcome.pull_requests {
        println!("{} #{number}", "Pull request".bold());
        for release in outcome.releases.iter().filter(|r| r.pull_request == *number) {
            let mark = if args.dry_run { "○" } else { "✓" };
            print!("  {} {} {}", mark.green(), release.tag.bold(), release.version.dimmed());
            match &release.url {
                Some(url) => println!(" {}", url.cyan()),
                None => println!(),
            }
        }
    }
    Ok(())
}
