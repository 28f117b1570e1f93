use std::path::PathBuf;

use thiserror::Error;

/// Failures callers need to tell apart from generic I/O or decode errors.
///
/// Functions in this crate return `anyhow::Result`; match on these with
/// `err.downcast_ref::<KuralError>()`.
#[derive(Debug, Error)]
pub enum KuralError {
    #[error(
        "Required file not found: {}\nRun the offline preparation pipeline to build {label} first.",
        path.display()
    )]
    MissingArtifact { label: &'static str, path: PathBuf },

    #[error("{what} dimension mismatch: expected {expected}, found {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid {label}: {reason}")]
    InvalidArtifact { label: &'static str, reason: String },

    #[error("models are not loaded. Call load_models() before retrieving.")]
    NotInitialized,

    #[error("unknown Pal '{0}' (expected All, Virtue, Wealth or Love)")]
    UnknownPal(String),

    #[error("unsupported device '{0}' (expected cpu, cuda or cuda:N)")]
    UnsupportedDevice(String),
}
