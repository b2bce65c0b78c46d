//! Maintenance tasks for the librarian workspace.
//!
//! - `completions` writes shell completions for the `librarian` binary
//! - `man` writes man pages for the binary and each subcommand
//! - `dist` does both into the default `dist/share` layout
//!
//! Run `cargo xtask --help` to see available commands.

#![deny(unsafe_code)]

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "xtask")]
#[command(about = "Project maintenance tasks")]
struct Xtask {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand, Debug)]
enum Task {
    /// Generate shell completions for the librarian CLI.
    Completions(commands::completions::CompletionsArgs),

    /// Generate man pages for the librarian CLI.
    Man(commands::man::ManArgs),

    /// Generate completions for every shell and all man pages.
    Dist,
}

fn main() -> Result<(), String> {
    match Xtask::parse().command {
        Task::Completions(args) => commands::completions::cmd_completions(args),
        Task::Man(args) => commands::man::cmd_man(args),
        Task::Dist => {
            commands::completions::cmd_completions(commands::completions::CompletionsArgs::default())?;
            commands::man::cmd_man(commands::man::ManArgs::default())
        }
    }
}

/// The workspace root, one level above this crate.
pub fn workspace_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir.parent().unwrap_or(&manifest_dir).to_path_buf()
}
