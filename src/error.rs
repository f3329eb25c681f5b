//! Error types for the `easyflake` crate.

use std::time::Duration;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while generating IDs or coordinating node-ID leases.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// All sequence values for the given bit-width are in use.
    #[error("the sequence has reached the maximum value of {max}")]
    SequenceOverflow {
        /// Bit-width of the exhausted sequence space.
        bits: u32,
        /// Largest value of that space, `2^bits - 1`.
        max: u64,
    },

    /// A sequence value lies outside its bit-width.
    #[error("value {value} exceeds the maximum value {max}")]
    ValueOutOfRange {
        /// The offending value.
        value: u64,
        /// Largest admissible value.
        max: u64,
    },

    /// No node ID arrived within the pool timeout.
    #[error("no node ID was received within {0:?}")]
    Timeout(Duration),

    /// The lease worker gave up; the node-ID source is unusable.
    #[error("failed to listen to the node-ID source: {0}")]
    Connection(String),

    /// Invalid construction parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Coordination-file I/O error.
    #[error("coordination file error: {0}")]
    Io(#[from] std::io::Error),

    /// The lease server rejected or aborted a call.
    #[error("lease RPC failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The lease channel could not be established or broke down.
    #[error("lease transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl Error {
    /// Overflow of the `bits`-wide sequence space.
    #[must_use]
    pub fn sequence_overflow(bits: u32) -> Self {
        Self::SequenceOverflow {
            bits,
            max: (1u64 << bits) - 1,
        }
    }

    /// True for conditions that a lease worker retries instead of
    /// surfacing to callers.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SequenceOverflow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_reports_max_value() {
        let err = Error::sequence_overflow(8);
        assert_eq!(
            err.to_string(),
            "the sequence has reached the maximum value of 255"
        );
    }

    #[test]
    fn overflow_is_transient() {
        assert!(Error::sequence_overflow(2).is_transient());
        assert!(!Error::Timeout(Duration::from_secs(5)).is_transient());
    }
}
