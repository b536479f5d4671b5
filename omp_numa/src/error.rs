//! Error types for NUMA coordination.

use common::config::ConfigError;
use thiserror::Error;

/// Errors that can occur while coordinating placement across processes.
#[derive(Error, Debug)]
pub enum Error {
    /// The host exposes no NUMA topology.
    #[error("NUMA support is not available on this host")]
    Unavailable,

    /// Both the combined and the split placement variables are set.
    #[error("conflicting placement environment (combined and split node lists both set)")]
    ConflictingConfig,

    /// A node list string does not follow the `"i,j-k"` grammar.
    #[error("malformed node list: {input:?}")]
    Parse {
        /// The offending input string.
        input: String,
    },

    /// A node index is outside the configured or allowed node set.
    #[error("node {node} is outside the configured or allowed node set")]
    InvalidNode {
        /// The rejected node index.
        node: usize,
    },

    /// A caller-supplied execution spec violates its invariants.
    #[error("invalid execution spec: {reason}")]
    InvalidSpec {
        /// Which invariant was violated.
        reason: String,
    },

    /// The shared region already exists (shepherd role).
    #[error("shared region already exists: {region}")]
    AlreadyExists {
        /// Region name.
        region: String,
    },

    /// The shared region does not exist (worker role).
    #[error("shared region not found: {region} (is the shepherd running?)")]
    NotFound {
        /// Region name.
        region: String,
    },

    /// The shared region exists but the shepherd has not finished
    /// initializing it. Workers must retry or be ordered externally.
    #[error("shared region not initialized yet: {region}")]
    NotReady {
        /// Region name.
        region: String,
    },

    /// IO error.
    #[error("IO error: {source}")]
    Io {
        /// Source IO error.
        #[from]
        source: std::io::Error,
    },

    /// Mapping the shared region into the process failed.
    #[error("could not map shared region: {source}")]
    MapFailed {
        /// Source IO error.
        source: std::io::Error,
    },

    /// The in-region process-shared lock could not be initialized.
    #[error("could not initialize in-region lock (errno {errno})")]
    LockInitFailed {
        /// Raw OS errno.
        errno: i32,
    },

    /// Counters would underflow: a cleanup did not match a prior mapping.
    #[error("registry counters stale (cleanup without matching map_tasks)")]
    RegistryStale,
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ConflictingPlacement => Error::ConflictingConfig,
            ConfigError::Parse { input } => Error::Parse { input },
        }
    }
}

/// Result type for NUMA coordination operations.
pub type Result<T> = std::result::Result<T, Error>;
