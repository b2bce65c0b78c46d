//! Info command: show package, configuration and repository state.

use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use librarian_core::config::{self, Config};
use librarian_core::state::load_state;

use super::Workspace;

/// Arguments for the `info` subcommand.
#[derive(Args, Debug, Default)]
pub struct InfoArgs {
    // No subcommand-specific arguments; uses global --json flag
}

#[derive(Serialize)]
struct PackageInfo {
    name: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    description: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    repository: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    license: &'static str,
}

impl PackageInfo {
    const fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            description: env!("CARGO_PKG_DESCRIPTION"),
            repository: env!("CARGO_PKG_REPOSITORY"),
            license: env!("CARGO_PKG_LICENSE"),
        }
    }
}

#[derive(Serialize)]
struct ConfigInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    config_file: Option<String>,
    log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_dir: Option<String>,
    source_repo: String,
    container_runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    container_image: Option<String>,
    pending_label: String,
    done_label: String,
}

impl ConfigInfo {
    fn from_config(config: &Config, cwd: &camino::Utf8Path) -> Self {
        Self {
            config_file: config::find_project_config(cwd).map(|p| p.to_string()),
            log_level: config.log_level.as_str().to_string(),
            log_dir: config.log_dir.as_ref().map(|p| p.to_string()),
            source_repo: config.source_repo().to_string(),
            container_runtime: config.container_runtime().to_string(),
            container_image: config.container_image().map(str::to_string),
            pending_label: config.pending_label().to_string(),
            done_label: config.done_label().to_string(),
        }
    }
}

#[derive(Serialize)]
struct RepositoryInfo {
    root: String,
    repo: String,
    state_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    libraries: Vec<LibraryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_error: Option<String>,
}

#[derive(Serialize)]
struct LibraryInfo {
    id: String,
    version: String,
    apis: usize,
}

impl RepositoryInfo {
    /// `None` outside a repository librarian can resolve.
    fn gather(config: &Config, cwd: &camino::Utf8Path) -> Option<Self> {
        let workspace = match Workspace::open(config, cwd) {
            Ok(workspace) => workspace,
            Err(e) => {
                debug!(error = %e, "no workspace");
                return None;
            }
        };
        let mut info = Self {
            root: workspace.root.to_string(),
            repo: workspace.settings.repo.slug(),
            state_dir: workspace.settings.state_dir.to_string(),
            image: None,
            libraries: Vec::new(),
            state_error: None,
        };
        match load_state(&workspace.settings.state_dir) {
            Ok(state) => {
                info.image = Some(state.image);
                info.libraries = state
                    .libraries
                    .into_iter()
                    .map(|lib| LibraryInfo {
                        apis: lib.apis.len(),
                        id: lib.id,
                        version: lib.version,
                    })
                    .collect();
            }
            Err(e) => info.state_error = Some(e.to_string()),
        }
        Some(info)
    }
}

#[derive(Serialize)]
struct FullInfo {
    #[serde(flatten)]
    package: PackageInfo,
    config: ConfigInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    repository: Option<RepositoryInfo>,
}

/// Print package, configuration and repository information.
#[instrument(name = "cmd_info", skip_all, fields(json_output))]
pub fn cmd_info(
    _args: InfoArgs,
    global_json: bool,
    config: &Config,
    cwd: &camino::Utf8Path,
) -> anyhow::Result<()> {
    debug!(json_output = global_json, "executing info command");

    let info = FullInfo {
        package: PackageInfo::new(),
        config: ConfigInfo::from_config(config, cwd),
        repository: RepositoryInfo::gather(config, cwd),
    };

    if global_json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{} {}", info.package.name.bold(), info.package.version.green());
    if !info.package.description.is_empty() {
        println!("{}", info.package.description);
    }
    if !info.package.license.is_empty() {
        println!("{}: {}", "License".dimmed(), info.package.license);
    }
    if !info.package.repository.is_empty() {
        println!("{}: {}", "Repository".dimmed(), info.package.repository.cyan());
    }

    println!();
    println!("{}", "Configuration".bold().underline());
    match &info.config.config_file {
        Some(path) => println!("{}: {}", "Config file".dimmed(), path.cyan()),
        None => println!("{}: {}", "Config file".dimmed(), "none loaded".yellow()),
    }
    println!("{}: {}", "Log level".dimmed(), info.config.log_level);
    if let Some(dir) = &info.config.log_dir {
        println!("{}: {}", "Log directory".dimmed(), dir);
    }
    println!("{}: {}", "API source".dimmed(), info.config.source_repo.cyan());
    println!("{}: {}", "Container runtime".dimmed(), info.config.container_runtime);
    if let Some(image) = &info.config.container_image {
        println!("{}: {}", "Image override".dimmed(), image.cyan());
    }
    println!(
        "{}: {} → {}",
        "Release labels".dimmed(),
        info.config.pending_label,
        info.config.done_label
    );

    println!();
    println!("{}", "Repository".bold().underline());
    let Some(repo) = &info.repository else {
        println!("  {} {}", "○".yellow(), "Not inside a librarian repository".yellow());
        return Ok(());
    };
    println!("{}: {} ({})", "Root".dimmed(), repo.root, repo.repo.cyan());
    println!("{}: {}", "State".dimmed(), repo.state_dir);
    if let Some(err) = &repo.state_error {
        println!("  {} {}", "✗".red(), err);
        return Ok(());
    }
    if let Some(image) = &repo.image {
        println!("{}: {}", "Image".dimmed(), image.cyan());
    }
    println!("{}: {}", "Libraries".dimmed(), repo.libraries.len());
    for lib in &repo.libraries {
        println!(
            "  {} {} {}",
            lib.id.bold(),
            lib.version.green(),
            format!("({} APIs)", lib.apis).dimmed()
        );
    }
    Ok(())
}
