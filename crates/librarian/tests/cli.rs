//! End-to-end CLI integration tests
//!
//! These tests invoke the compiled binary as a subprocess to verify
//! that the CLI behaves correctly from a user's perspective.

use std::fs;
use std::path::Path;
use std::process::Command as StdCommand;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Returns a Command configured to run our binary, logging into a temp dir
/// and ignoring the invoking user's config.
///
/// Note: `cargo_bin` is marked deprecated for edge cases involving custom
/// cargo build directories, but works correctly for standard project layouts.
#[allow(deprecated)]
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap();
    let scratch = std::env::temp_dir().join("librarian-cli-tests");
    cmd.env("LIBRARIAN_LOG_DIR", scratch.join("logs"));
    cmd.env("XDG_CONFIG_HOME", scratch.join("xdg"));
    cmd
}

fn git(dir: &Path, args: &[&str]) -> bool {
    StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .is_ok_and(|out| out.status.success())
}

/// A git checkout with a two-library state document, or `None` without git.
fn language_repo() -> Option<TempDir> {
    let tmp = TempDir::new().ok()?;
    if !git(tmp.path(), &["init", "--quiet"]) {
        return None;
    }
    fs::create_dir_all(tmp.path().join(".librarian")).ok()?;
    fs::write(
        tmp.path().join(".librarian/state.yaml"),
        r"image: example/lang:1.0
libraries:
  - id: pubsub
    version: 1.4.0
    apis:
      - path: google/pubsub/v1
    source_roots: [pubsub]
  - id: storage
    version: 2.0.0
    source_roots: [storage]
",
    )
    .ok()?;
    fs::write(
        tmp.path().join(".librarian.toml"),
        "[hosting]\nrepo = \"acme/clients\"\n",
    )
    .ok()?;
    Some(tmp)
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_lists_subcommands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("generate"))
        .stdout(predicate::str::contains("stage"))
        .stdout(predicate::str::contains("publish"))
        .stdout(predicate::str::contains("doctor"));
}

#[test]
fn long_help_mentions_log_environment() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("LIBRARIAN_LOG_DIR"));
}

#[test]
fn version_flag_shows_version() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn generate_help_shows_options() {
    cmd()
        .args(["generate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--api-path"))
        .stdout(predicate::str::contains("--push"));
}

// =============================================================================
// Info Command
// =============================================================================

#[test]
fn info_shows_package_name_and_version() {
    let tmp = TempDir::new().unwrap();
    cmd()
        .args(["-C", tmp.path().to_str().unwrap(), "info"])
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_NAME")))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn info_json_outputs_valid_json() {
    let tmp = TempDir::new().unwrap();
    let output = cmd()
        .args(["-C", tmp.path().to_str().unwrap(), "info", "--json"])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&output.get_output().stdout);
    let json: serde_json::Value =
        serde_json::from_str(&stdout).expect("info --json should output valid JSON");

    assert_eq!(json["name"], env!("CARGO_PKG_NAME"));
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["config"]["source_repo"], "googleapis/googleapis");
    assert_eq!(json["config"]["pending_label"], "release:pending");
}

#[test]
fn info_json_reports_repository_state() {
    let Some(repo) = language_repo() else {
        return;
    };
    let output = cmd()
        .args(["-C", repo.path().to_str().unwrap(), "info", "--json"])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&output.get_output().stdout);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let repository = &json["repository"];
    assert_eq!(repository["repo"], "acme/clients");
    assert_eq!(repository["image"], "example/lang:1.0");
    assert_eq!(repository["libraries"][0]["id"], "pubsub");
    assert_eq!(repository["libraries"][0]["apis"], 1);
    assert_eq!(repository["libraries"][1]["version"], "2.0.0");
}

// =============================================================================
// Pipeline commands
// =============================================================================

#[test]
fn generate_outside_a_repository_fails() {
    let tmp = TempDir::new().unwrap();
    if git(tmp.path(), &["rev-parse", "--is-inside-work-tree"]) {
        return;
    }
    cmd()
        .args(["-C", tmp.path().to_str().unwrap(), "generate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not inside a git repository"));
}

#[test]
fn generate_without_source_checkout_fails() {
    let Some(repo) = language_repo() else {
        return;
    };
    cmd()
        .args(["-C", repo.path().to_str().unwrap(), "generate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no API-source checkout"));
}

#[test]
fn stage_without_remote_or_configured_repo_fails() {
    let Some(repo) = language_repo() else {
        return;
    };
    fs::remove_file(repo.path().join(".librarian.toml")).unwrap();
    cmd()
        .args(["-C", repo.path().to_str().unwrap(), "stage"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("set hosting.repo"));
}

#[test]
fn stage_reports_missing_state() {
    let Some(repo) = language_repo() else {
        return;
    };
    fs::remove_file(repo.path().join(".librarian/state.yaml")).unwrap();
    cmd()
        .args(["-C", repo.path().to_str().unwrap(), "stage"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read state"));
}

#[test]
fn api_path_requires_library() {
    cmd()
        .args(["generate", "--api-path", "google/foo/v1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--library"));
}

// =============================================================================
// Doctor
// =============================================================================

#[test]
fn doctor_json_lists_tools() {
    let tmp = TempDir::new().unwrap();
    let output = cmd()
        .args(["-C", tmp.path().to_str().unwrap(), "doctor", "--no-prompt", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let names: Vec<_> = json["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["git", "docker", "gh"]);
}

// =============================================================================
// Global Flags
// =============================================================================

#[test]
fn global_flags_accepted() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().to_str().unwrap();
    let cases: [&[&str]; 6] = [
        &["--quiet"],
        &["-q"],
        &["-v"],
        &["-vv"],
        &["--color", "always"],
        &["--color", "never"],
    ];
    for flags in cases {
        cmd().args(["-C", dir]).args(flags).arg("info").assert().success();
    }
}

// =============================================================================
// Error Cases
// =============================================================================

#[test]
fn no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn invalid_subcommand_shows_error() {
    cmd()
        .arg("not-a-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn chdir_nonexistent_fails() {
    cmd()
        .args(["-C", "/nonexistent/path/that/does/not/exist", "info"])
        .assert()
        .failure();
}
