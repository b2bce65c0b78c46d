//! Core library for librarian.
//!
//! This crate holds the engine behind the `librarian` CLI: it decides which
//! generated client libraries need regeneration, derives their next semantic
//! version from commit history, writes release narratives, and drives each
//! library through a generate, build, test and release pipeline.
//!
//! # Modules
//!
//! - [`commit`] - Conventional commit parsing, including nested commits
//! - [`attribution`] - Mapping commits and changed files onto libraries
//! - [`version`] - Change levels and next-version derivation
//! - [`freshness`] - Whether a library needs regeneration
//! - [`notes`] - Release and generation narratives, and release PR ingestion
//! - [`pipeline`] - Per-library phases and batch outcome aggregation
//! - [`generate`], [`stage`], [`publish`] - The three pipeline runs
//! - [`state`] - Persisted state and administrative config documents
//! - [`git`], [`container`], [`hosting`] - External collaborators
//! - [`workspace`] - Output merge and the per-run lock
//! - [`config`] - Tool configuration loading
//! - [`error`] - Configuration error types
//!
//! # Deriving a version
//!
//! ```
//! use librarian_core::commit::{CommitParser, RawCommit};
//! use librarian_core::version::{ChangeLevel, highest_change_level, next_version, parse_version};
//!
//! let raw = RawCommit::new("a1b2c3d", "feat(pubsub): add ordering keys", 0);
//! let commits = CommitParser::new().parse(&raw, "pubsub").unwrap();
//! let level = highest_change_level(&commits);
//! assert_eq!(level, ChangeLevel::Minor);
//!
//! let current = parse_version("v1.4.2").unwrap();
//! assert_eq!(next_version(&current, level).unwrap().to_string(), "1.5.0");
//! ```
#![deny(unsafe_code)]

pub mod attribution;

pub mod commit;

pub mod config;

pub mod container;

pub mod error;

pub mod freshness;

pub mod generate;

pub mod git;

pub mod hosting;

pub mod notes;

pub mod pipeline;

pub mod publish;

pub mod stage;

pub mod state;

pub mod version;

pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, ConfigLoader, LogLevel};

pub use error::{ConfigError, ConfigResult};

// Re-export semver so downstream crates don't need a direct dependency.
pub use semver;

/// Version of the tool, embedded in every narrative it writes.
pub const LIBRARIAN_VERSION: &str = env!("CARGO_PKG_VERSION");
