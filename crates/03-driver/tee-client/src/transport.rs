//! Where the ring memory comes from.
//!
//! The protocol is identical for both variants; they only differ in how the
//! memory is obtained and in what the bring-up handshake has to say about it.

use tee_transport::{SharedRegion, TransportError, TransportResult};

/// Alignment of host-allocated rings.
pub const HOST_RING_ALIGNMENT: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Host allocates the ring and announces its address to the remote.
    HostAllocated,
    /// The ring lives in a fixed, pre-mapped window the remote already knows.
    FixedRegion,
}

impl TransportKind {
    /// Whether bring-up sends base/size and a `RingInit` command.
    pub fn announces_address(self) -> bool {
        matches!(self, TransportKind::HostAllocated)
    }
}

/// Source of ring memory.
pub trait RingTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Returns a region of at least `len` bytes; the caller zero-fills it.
    fn acquire(&self, len: usize) -> TransportResult<SharedRegion>;
}

/// Host-allocated, page-aligned ring memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostRing;

impl RingTransport for HostRing {
    fn kind(&self) -> TransportKind {
        TransportKind::HostAllocated
    }

    fn acquire(&self, len: usize) -> TransportResult<SharedRegion> {
        SharedRegion::new_zeroed(len, HOST_RING_ALIGNMENT)
    }
}

/// A statically mapped window, bound but never released.
#[derive(Debug)]
pub struct MappedRing {
    base: *mut u8,
    len: usize,
}

// SAFETY: `MappedRing` only carries the window coordinates; the `new`
// contract makes the memory valid from any thread.
unsafe impl Send for MappedRing {}
// SAFETY: see above.
unsafe impl Sync for MappedRing {}

impl MappedRing {
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// any ring bound through this transport is alive.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }
}

impl RingTransport for MappedRing {
    fn kind(&self) -> TransportKind {
        TransportKind::FixedRegion
    }

    fn acquire(&self, len: usize) -> TransportResult<SharedRegion> {
        if len > self.len {
            return Err(TransportError::InvalidCapacity {
                requested: len,
                minimum: self.len,
            });
        }
        // SAFETY: upheld by the contract of `MappedRing::new`.
        unsafe { SharedRegion::from_raw_parts(self.base, len) }
    }
}
