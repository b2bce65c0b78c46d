//! Doctor command: diagnose configuration, tools and environment.

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Confirm;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use librarian_core::config::{self, Config};
use librarian_core::container::DockerRunner;
use librarian_core::git::SystemGit;
use librarian_core::hosting::GhCli;

/// Arguments for the `doctor` subcommand.
#[derive(Args, Debug, Default)]
pub struct DoctorArgs {
    /// Never offer to create a config file
    #[arg(long)]
    pub no_prompt: bool,
}

#[derive(Serialize)]
struct DoctorReport {
    config: ConfigStatus,
    tools: Vec<ToolStatus>,
    directories: DirectoryPaths,
    environment: Vec<EnvVar>,
}

#[derive(Serialize)]
struct ConfigStatus {
    file: Option<String>,
    found: bool,
}

#[derive(Serialize)]
struct ToolStatus {
    name: String,
    purpose: &'static str,
    available: bool,
}

#[derive(Serialize)]
struct DirectoryPaths {
    config: Option<String>,
    data: Option<String>,
}

#[derive(Serialize)]
struct EnvVar {
    name: &'static str,
    value: Option<String>,
}

const ENV_VARS: [&str; 5] = [
    "LIBRARIAN_LOG_PATH",
    "LIBRARIAN_LOG_DIR",
    "RUST_LOG",
    "XDG_CONFIG_HOME",
    "GH_TOKEN",
];

impl DoctorReport {
    fn gather(config: &Config, cwd: &camino::Utf8Path) -> Self {
        let config_file = config::find_project_config(cwd);
        let runtime = config.container_runtime();

        Self {
            config: ConfigStatus {
                found: config_file.is_some(),
                file: config_file.map(|p| p.to_string()),
            },
            tools: vec![
                ToolStatus {
                    name: "git".to_string(),
                    purpose: "history, branches, commits",
                    available: SystemGit::new(cwd).is_inside_repo().is_ok(),
                },
                ToolStatus {
                    name: runtime.to_string(),
                    purpose: "language containers",
                    available: DockerRunner::new("")
                        .with_runtime(runtime)
                        .ensure_available()
                        .is_ok(),
                },
                ToolStatus {
                    name: "gh".to_string(),
                    purpose: "pull requests and releases",
                    available: GhCli::ensure_available().is_ok(),
                },
            ],
            directories: DirectoryPaths {
                config: config::user_config_dir().map(|p| p.to_string()),
                data: config::user_data_dir().map(|p| p.to_string()),
            },
            environment: ENV_VARS
                .iter()
                .map(|&name| EnvVar {
                    name,
                    value: std::env::var(name).ok().map(|v| mask(name, v)),
                })
                .collect(),
        }
    }
}

/// Hide secrets, keep the fact that they are set.
fn mask(name: &str, value: String) -> String {
    if name.ends_with("_TOKEN") {
        "(set)".to_string()
    } else {
        value
    }
}

/// Run diagnostics and report configuration status.
#[instrument(name = "cmd_doctor", skip_all, fields(json_output))]
pub fn cmd_doctor(
    args: DoctorArgs,
    global_json: bool,
    config: &Config,
    cwd: &camino::Utf8Path,
) -> anyhow::Result<()> {
    debug!(json_output = global_json, "executing doctor command");

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message("Gathering diagnostics...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    let report = DoctorReport::gather(config, cwd);
    spinner.finish_and_clear();

    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "Configuration".bold().underline());
    match &report.config.file {
        Some(file) => println!("  {} Config file: {}", "✓".green(), file.cyan()),
        None => {
            println!("  {} No config file found", "○".yellow());
            if !args.no_prompt {
                offer_config_creation()?;
            }
        }
    }
    println!();

    println!("{}", "Tools".bold().underline());
    for tool in &report.tools {
        if tool.available {
            println!("  {} {} {}", "✓".green(), tool.name.bold(), tool.purpose.dimmed());
        } else {
            println!(
                "  {} {} {}",
                "✗".red(),
                tool.name.bold(),
                format!("not found, needed for {}", tool.purpose).dimmed()
            );
        }
    }
    println!();

    println!("{}", "Directories".bold().underline());
    print_dir("  Config", report.directories.config.as_deref());
    print_dir("  Data", report.directories.data.as_deref());
    println!();

    println!("{}", "Environment".bold().underline());
    println!("  {}: {}", "Working directory".dimmed(), cwd.cyan());
    let set: Vec<_> = report.environment.iter().filter(|v| v.value.is_some()).collect();
    if set.is_empty() {
        println!("  {} No logging or XDG overrides set", "○".dimmed());
    }
    for var in set {
        println!("  {}: {}", var.name.dimmed(), var.value.as_deref().unwrap_or("").cyan());
    }

    Ok(())
}

fn print_dir(label: &str, path: Option<&str>) {
    print!("{}: ", label.dimmed());
    match path {
        Some(p) => println!("{}", p.cyan()),
        None => println!("{}", "(unavailable)".yellow()),
    }
}

/// Offer to write the default configuration to the user config directory.
fn offer_config_creation() -> anyhow::Result<()> {
    if !std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        return Ok(());
    }
    let Some(config_dir) = config::user_config_dir() else {
        return Ok(());
    };
    let config_path = config_dir.join("config.yaml");

    let create = Confirm::new("Create a default config file?")
        .with_default(false)
        .with_help_message(&format!("Will create {config_path}"))
        .prompt();
    if !matches!(create, Ok(true)) {
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    let yaml = serde_saphyr::to_string(&Config::default())?;
    std::fs::write(&config_path, yaml)?;
    println!("  {} Created {}", "✓".green(), config_path.cyan());
    Ok(())
}
