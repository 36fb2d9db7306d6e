//! Manifest loading and validation.
//!
//! ```yaml
//! version: 1
//! daemons:
//!   - name: heartbeat
//!     command: "echo tick >> /tmp/heartbeat.log"
//!     interval_ms: 500
//!   - command: "date"
//!     mode: blocking
//!     replicas: 3
//! ```

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{io_err, ManifestError};
use crate::types::{DaemonSpec, Manifest};

/// The only manifest version this crate understands.
pub const MANIFEST_VERSION: u32 = 1;

/// Load and validate the manifest at `path`.
///
/// Returns `ManifestError::NotFound` if absent,
/// `ManifestError::Parse` (with path + line context) if malformed YAML.
pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ManifestError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(io_err(path, err)),
    };
    let manifest: Manifest = serde_yaml::from_str(&contents).map_err(|e| ManifestError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    manifest.validate()?;
    Ok(manifest)
}

impl Manifest {
    /// Parse and validate a manifest held in memory. Parse errors report
    /// `<inline>` as their path.
    pub fn from_yaml(yaml: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(yaml).map_err(|e| ManifestError::Parse {
            path: "<inline>".into(),
            source: e,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check every daemon definition and reject duplicate names.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                found: self.version,
                expected: MANIFEST_VERSION,
            });
        }

        let mut seen = HashSet::new();
        for spec in &self.daemons {
            validate_spec(spec)?;
            if let Some(name) = &spec.name {
                if !seen.insert(name) {
                    return Err(ManifestError::DuplicateName(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Total number of pool daemons this manifest starts, counting replicas.
    pub fn daemon_count(&self) -> usize {
        self.daemons.iter().map(|spec| spec.replicas as usize).sum()
    }
}

fn validate_spec(spec: &DaemonSpec) -> Result<(), ManifestError> {
    let invalid = |reason: &str| ManifestError::InvalidDaemon {
        daemon: spec.label(),
        reason: reason.to_string(),
    };

    if let Some(name) = &spec.name {
        if name.0.trim().is_empty() {
            return Err(invalid("name must not be blank"));
        }
    }
    if spec.command.trim().is_empty() {
        return Err(invalid("command must not be empty"));
    }
    if spec.interval_ms == 0 {
        return Err(invalid("interval_ms must be greater than zero"));
    }
    if spec.replicas == 0 {
        return Err(invalid("replicas must be at least 1"));
    }
    if spec.name.is_some() && spec.replicas > 1 {
        return Err(invalid("named daemons cannot have replicas"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
