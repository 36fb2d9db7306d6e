//! Daemonize core library — manifest types, loading, validation.
//!
//! - [`types`] — newtypes and manifest structs
//! - [`error`] — [`ManifestError`]
//! - [`manifest`] — load / parse / validate

pub mod error;
pub mod manifest;
pub mod types;

pub use error::ManifestError;
pub use manifest::{load_manifest, MANIFEST_VERSION};
pub use types::{DaemonName, DaemonSpec, Manifest, RunMode};
