use std::time::Duration;

use tee_transport::{RingCommand, TransportError};
use thiserror::Error;

pub type TeeResult<T> = Result<T, TeeError>;

/// Failures of the ring handshake or of acquiring ring memory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IoError {
    #[error("{command} was not acknowledged within {timeout:?}")]
    HandshakeTimeout {
        command: RingCommand,
        timeout: Duration,
    },

    #[error("remote rejected {command} with status {status:#x}")]
    HandshakeRejected { command: RingCommand, status: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Why a submission was turned away without waiting on the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    /// The slot at the write cursor stayed occupied for the whole retry budget.
    RingFull,
    /// The remote is marked dead and the last issued slot is still pending.
    RemoteUnresponsive,
}

/// Errors returned by [`crate::CommandClient::submit`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TeeError {
    #[error("payload of {len} bytes exceeds slot capacity of {capacity}")]
    InvalidArgument { len: usize, capacity: usize },

    #[error("command ring busy: {reason:?}")]
    Busy { reason: BusyReason },

    #[error("remote did not complete command {command_id:#x} within {timeout:?}")]
    Timeout { command_id: u32, timeout: Duration },

    #[error("ring i/o error: {0}")]
    Io(#[from] IoError),
}

impl TeeError {
    pub(crate) fn busy(reason: BusyReason) -> Self {
        TeeError::Busy { reason }
    }
}
