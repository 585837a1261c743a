//! Register-level signalling between the host and the remote.
//!
//! The concrete register map belongs to the platform; the protocol only needs
//! the handful of operations on [`Doorbell`].

use std::fmt;

/// Reserved commands written to the doorbell command register.
///
/// These never travel through a ring slot; they frame the ring's lifetime.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RingCommand {
    /// Adopt the ring whose base and size were just written.
    RingInit = 0x1,
    /// Stop using the ring; the host is about to release it.
    RingDestroy = 0x2,
}

impl RingCommand {
    /// Register encoding of the command.
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Decodes a command register value.
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0x1 => Some(RingCommand::RingInit),
            0x2 => Some(RingCommand::RingDestroy),
            _ => None,
        }
    }
}

impl fmt::Display for RingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingCommand::RingInit => f.write_str("ring-init"),
            RingCommand::RingDestroy => f.write_str("ring-destroy"),
        }
    }
}

/// Ack status reported by a remote that accepted a command.
pub const ACK_OK: u32 = 0;

/// Notify/ack primitive used by the ring manager and the command client.
pub trait Doorbell: Send + Sync {
    /// Writes the ring base address (low half, then high half).
    fn write_ring_base(&self, addr: u64);

    /// Writes the ring size in bytes.
    fn write_ring_size(&self, bytes: u32);

    /// Writes a reserved command, clearing any previous acknowledgement.
    fn issue(&self, cmd: RingCommand);

    /// Reads the ack register: `Some(status)` once the remote acknowledged.
    fn poll_ack(&self) -> Option<u32>;

    /// Tells the remote that slots up to `write_cursor` (a byte offset) are published.
    fn notify(&self, write_cursor: u32);
}

impl<T: Doorbell + ?Sized> Doorbell for std::sync::Arc<T> {
    fn write_ring_base(&self, addr: u64) {
        (**self).write_ring_base(addr)
    }

    fn write_ring_size(&self, bytes: u32) {
        (**self).write_ring_size(bytes)
    }

    fn issue(&self, cmd: RingCommand) {
        (**self).issue(cmd)
    }

    fn poll_ack(&self) -> Option<u32> {
        (**self).poll_ack()
    }

    fn notify(&self, write_cursor: u32) {
        (**self).notify(write_cursor)
    }
}

/// Splits a 64-bit address into the (low, high) register halves.
pub fn split_address(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

/// Joins (low, high) register halves back into an address.
pub fn join_address(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}
