use std::path::PathBuf;

use clap::Args;
use clap_complete::{Shell, generate_to};

use super::{BIN_NAME, prepare_dir};

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Output directory, relative to the workspace root
    #[arg(long = "out-dir", default_value = "dist/share/completions")]
    pub out_dir: PathBuf,

    /// Only this shell (default: bash, zsh, fish and PowerShell)
    #[arg(long, value_enum)]
    pub shell: Option<Shell>,
}

impl Default for CompletionsArgs {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("dist/share/completions"),
            shell: None,
        }
    }
}

pub fn cmd_completions(args: CompletionsArgs) -> Result<(), String> {
    let out_dir = prepare_dir(&args.out_dir)?;
    let mut cmd = librarian::command();

    let shells = match args.shell {
        Some(shell) => vec![shell],
        None => vec![Shell::Bash, Shell::Zsh, Shell::Fish, Shell::PowerShell],
    };
    for shell in shells {
        let path = generate_to(shell, &mut cmd, BIN_NAME, &out_dir)
            .map_err(|e| format!("{shell} completions: {e}"))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}
