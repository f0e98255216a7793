//! Error types for opening and reading a store.
//!
//! Only conditions that stop a reader from starting are errors. Queue
//! overflow, gaps and write contention are handled inside the polling loops
//! and surface as metrics, never through these types.

use crate::metadata::IdAddressing;
use std::io;

/// Errors raised while opening, validating or writing a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Header magic mismatch or structurally invalid metadata.
    #[error("store is corrupt: {reason}")]
    CorruptStore {
        /// What failed validation.
        reason: String,
    },

    /// The store was written with an incompatible layout version.
    #[error("incompatible store layout version {found:#06x} (expected major version {expected})")]
    IncompatibleVersion {
        /// Version found in the header.
        found: u16,
        /// Major version this library understands.
        expected: u16,
    },

    /// The underlying file or shared-memory object could not be opened,
    /// created or mapped.
    #[error("failed to {op} store '{location}': {source}")]
    OpenFailure {
        /// The operation that failed (`open`, `mmap`, ...).
        op: &'static str,
        /// Store location as given by the caller.
        location: String,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// A record id outside `[base_id, max_id]`.
    #[error("invalid record id {id} (valid range {base_id}..={max_id})")]
    InvalidId {
        /// Requested id.
        id: i64,
        /// Lowest valid id.
        base_id: i64,
        /// Highest valid id.
        max_id: i64,
    },

    /// A value larger than the store's value size.
    #[error("value of {len} bytes exceeds record value size {value_size}")]
    ValueTooLarge {
        /// Length of the rejected value.
        len: usize,
        /// Value size of the store.
        value_size: usize,
    },

    /// Parameters passed to store creation are unusable.
    #[error("invalid store layout: {0}")]
    InvalidLayout(String),

    /// The store was created with another id addressing mode than the
    /// one required.
    #[error("store uses {found:?} id addressing, expected {expected:?}")]
    AddressingMismatch {
        /// Mode recorded in the header.
        found: IdAddressing,
        /// Mode the caller required.
        expected: IdAddressing,
    },

    /// A write was attempted through a read-only mapping.
    #[error("store is mapped read-only")]
    ReadOnly,
}

impl StoreError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptStore {
            reason: reason.into(),
        }
    }

    pub(crate) fn open_failure(op: &'static str, location: &str, source: io::Error) -> Self {
        Self::OpenFailure {
            op,
            location: location.to_owned(),
            source,
        }
    }

    /// Check if this error prevents the store from being used at all.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CorruptStore { .. }
                | Self::IncompatibleVersion { .. }
                | Self::OpenFailure { .. }
                | Self::AddressingMismatch { .. }
        )
    }
}

/// Errors raised while loading a [`ReaderConfig`](crate::ReaderConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// Path of the configuration file.
        path: String,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// The configuration is not valid TOML or has unknown fields.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by [`CacheReader`](crate::CacheReader).
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Opening the store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid reader configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The discovery thread could not be started.
    #[error("failed to spawn new-record discovery thread: {0}")]
    Spawn(#[source] io::Error),

    /// A new-record listener panicked on the discovery thread.
    #[error("new-record discovery thread panicked")]
    DiscoveryPanicked,
}
