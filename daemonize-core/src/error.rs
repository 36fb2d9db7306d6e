//! Error types for daemonize-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::DaemonName;

/// All errors that can arise from loading or validating a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O failure other than a missing file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest file did not exist.
    #[error("manifest not found at {path}")]
    NotFound { path: PathBuf },

    /// YAML parse error — includes file path and line context from serde_yaml.
    #[error("failed to parse manifest at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unsupported manifest version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Two daemons share a name; names must be unique within a pool.
    #[error("duplicate daemon name '{0}'")]
    DuplicateName(DaemonName),

    /// A daemon definition is unusable; `daemon` is its label.
    #[error("invalid daemon '{daemon}': {reason}")]
    InvalidDaemon { daemon: String, reason: String },
}

/// Convenience constructor for [`ManifestError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ManifestError {
    ManifestError::Io {
        path: path.into(),
        source,
    }
}
