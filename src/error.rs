//! Error taxonomy for the probe.
//!
//! None of these are fatal. Denials and verification failures drive backoff, query failures fall
//! back to conservative values, and storage failures leave the run in memory only.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The OS (or allocator) declined the request.
    #[error("allocation of {size} bytes denied")]
    AllocationDenied { size: usize },

    /// A sentinel written into fresh memory did not read back.
    #[error("verification failed at offset {offset} of a {size}-byte allocation")]
    VerificationFailed { size: usize, offset: usize },

    /// OS memory counters could not be read.
    #[error("device query failed: {0}")]
    DeviceQueryFailed(String),

    /// The run ledger could not be written or read.
    #[error("storage unavailable at {path}: {reason}")]
    StorageUnavailable { path: PathBuf, reason: String },

    /// A configuration value could not be parsed.
    #[error("invalid configuration for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },
}

impl ProbeError {
    /// True for the two refusals a probe run expects. The run backs off from any allocation error,
    /// but anything else is also logged as a warning.
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::AllocationDenied { .. } | Self::VerificationFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;
