use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;

use super::{BIN_NAME, prepare_dir};

#[derive(Args, Debug)]
pub struct ManArgs {
    /// Output directory, relative to the workspace root
    #[arg(long = "out-dir", default_value = "dist/share/man/man1")]
    pub out_dir: PathBuf,
}

impl Default for ManArgs {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("dist/share/man/man1"),
        }
    }
}

pub fn cmd_man(args: ManArgs) -> Result<(), String> {
    let out_dir = prepare_dir(&args.out_dir)?;
    let cmd = librarian::command();

    render(cmd.clone(), &out_dir.join(format!("{BIN_NAME}.1")))?;
    // One page per pipeline command, named the way `git` names its pages.
    for sub in cmd.get_subcommands().filter(|s| s.get_name() != "help") {
        let page = out_dir.join(format!("{BIN_NAME}-{}.1", sub.get_name()));
        render(sub.clone(), &page)?;
    }
    Ok(())
}

fn render(cmd: clap::Command, path: &Path) -> Result<(), String> {
    let mut buffer = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buffer)
        .map_err(|e| format!("render {}: {e}", path.display()))?;
    fs::write(path, buffer).map_err(|e| format!("{}: {e}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}
