//! Error handling helpers for the transport crate.
//!
//! The transport layer keeps its error surface small: capacity validation,
//! allocation failures and malformed region bindings. Protocol-level failures
//! (timeouts, busy rings) belong to the client crate.

use thiserror::Error;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Errors surfaced by low-level transport helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Requested ring capacity or slot size is below the minimum or not properly aligned.
    #[error("capacity {requested} is invalid: must be at least {minimum} and a multiple of it")]
    InvalidCapacity { requested: usize, minimum: usize },

    /// Allocation of a shared region failed for the given size/alignment pair.
    #[error("failed to allocate shared region of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    /// A caller-provided region does not satisfy the ring layout requirements.
    #[error("invalid region layout: {0}")]
    InvalidLayout(&'static str),
}
