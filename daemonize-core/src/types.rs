//! Manifest types.
//!
//! A manifest lists the daemons a host program should keep running. All types
//! are serializable/deserializable via serde + serde_yaml.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a daemon that can be stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DaemonName(pub String);

impl fmt::Display for DaemonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DaemonName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DaemonName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How each daemon call is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// On the async runtime; the command is awaited.
    #[default]
    Async,
    /// On the blocking thread pool; the command is waited on synchronously.
    Blocking,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Async => write!(f, "async"),
            RunMode::Blocking => write!(f, "blocking"),
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest structs
// ---------------------------------------------------------------------------

pub const DEFAULT_INTERVAL_MS: u64 = 1000;

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_replicas() -> u32 {
    1
}

/// One daemon definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSpec {
    /// Omitted for anonymous daemons, which only stop with the whole pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<DaemonName>,
    /// Shell command run once per call (`sh -c`).
    pub command: String,
    /// Pause after each run of the command.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub mode: RunMode,
    /// Number of identical copies; anonymous daemons only.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

impl DaemonSpec {
    /// `name`, or `<anonymous>`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.0.clone(),
            None => "<anonymous>".to_string(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Root of a daemon manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub daemons: Vec<DaemonSpec>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
