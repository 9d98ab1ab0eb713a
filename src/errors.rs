//! Typed error hierarchy for the monitor.
//!
//! Three top-level enums cover the three subsystems:
//! - `MonitorError`: registry and persisted-state failures
//! - `InstallError`: release lookup, download, checksum and extraction failures
//! - `SupervisorError`: per-start failures of a supervised server

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the registry and the persisted state file.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Invalid or non-existent server id {id}")]
    InvalidServer { id: i64 },

    #[error("A user with that name already exists.")]
    UserExists { name: String },

    #[error("User {name} not found")]
    UserNotFound { name: String },

    #[error("Registry lock poisoned")]
    LockPoisoned,

    #[error("Failed to read state file at {path}: {source}")]
    StateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file at {path}: {source}")]
    StateWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed state file at {path}: {source}")]
    StateParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from binary acquisition.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Version validation failed, {version} is not in any release catalog")]
    UnknownVersion { version: String },

    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Release server returned an empty version string for {url}")]
    EmptyVersion { url: String },

    #[error("Checksum validation failed for {version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        version: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to extract archive into {path}: {source}")]
    Extract {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown record type in archive entry {entry}")]
    UnsupportedEntry { entry: String },

    #[error("Archive entry {entry} escapes the install directory")]
    UnsafeEntry { entry: String },

    #[error(transparent)]
    Registry(#[from] MonitorError),
}

/// Errors from a single start attempt of a supervised server.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("downloading binaries: {0}")]
    Install(#[from] InstallError),

    #[error("preparing data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("attaching {0} pipe")]
    PipeUnavailable(&'static str),

    #[error(transparent)]
    Registry(#[from] MonitorError),
}
