//! Memory backing for the command ring.
//!
//! The ring lives in memory that both the host and the remote can see. On a
//! host-allocated ring we own that memory (anonymous `mmap` on native targets,
//! aligned heap allocation otherwise); on the fixed-region variant we merely
//! bind to a region that was mapped for us and never release it. Both present
//! the same [`SharedRegion`] surface so the protocol code never branches on
//! where the bytes came from.

use crate::{TransportError, TransportResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};

/// Minimum alignment accepted for a caller-mapped region.
pub const MAPPED_REGION_ALIGNMENT: usize = 8;

#[cfg(not(target_arch = "wasm32"))]
type NativeMap = memmap2::MmapMut;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Native(#[allow(dead_code)] NativeMap),
    Owned {
        layout: Layout,
    },
    Mapped,
}

/// Contiguous byte region shared with the remote side.
///
/// All access after construction goes through raw pointers handed out by
/// [`SharedRegion::base_ptr`]; the slot protocol decides who may touch which
/// bytes and when.
#[derive(Debug)]
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region is plain memory; concurrent access is coordinated by the
// slot state machine using atomics, never through references into the region.
unsafe impl Send for SharedRegion {}
// SAFETY: see above.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a zero-filled region of `len` bytes aligned to `alignment`.
    ///
    /// Native builds first try an anonymous `mmap` (page aligned). If the
    /// mapping cannot satisfy the alignment we fall back to the heap.
    pub fn new_zeroed(len: usize, alignment: usize) -> TransportResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(region) = Self::mmap_backed(len, alignment)? {
                return Ok(region);
            }
        }

        Self::heap_backed(len, alignment)
    }

    /// Binds a region that was mapped by someone else (for example a fixed
    /// hardware window). The region is never released by this handle.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the returned handle (and anything derived from it) is alive, and no
    /// other host code may create Rust references into it meanwhile.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> TransportResult<Self> {
        let base = NonNull::new(ptr).ok_or(TransportError::InvalidLayout("null region base"))?;
        if len == 0 {
            return Err(TransportError::InvalidLayout("empty region"));
        }
        if ptr as usize % MAPPED_REGION_ALIGNMENT != 0 {
            return Err(TransportError::InvalidLayout(
                "region base must be 8-byte aligned",
            ));
        }
        Ok(Self {
            base,
            len,
            alignment: MAPPED_REGION_ALIGNMENT,
            backing: Backing::Mapped,
        })
    }

    fn heap_backed(len: usize, alignment: usize) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        // SAFETY: `layout` has a non-zero size, checked in `new_zeroed`.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            base,
            len,
            alignment,
            backing: Backing::Owned { layout },
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed(len: usize, alignment: usize) -> TransportResult<Option<Self>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let ptr = map.as_mut_ptr();
        if ptr as usize % alignment != 0 {
            return Ok(None);
        }
        let Some(base) = NonNull::new(ptr) else {
            return Ok(None);
        };

        // SAFETY: the anonymous mapping exposes `len` writable bytes.
        unsafe { ptr::write_bytes(ptr, 0, len) };

        Ok(Some(Self {
            base,
            len,
            alignment,
            backing: Backing::Native(map),
        }))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated (or validated) with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// True when dropping this handle releases the memory.
    pub fn is_owned(&self) -> bool {
        !matches!(self.backing, Backing::Mapped)
    }

    /// Raw base pointer of the region.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Address announced to the remote during the ring handshake.
    pub fn bus_address(&self) -> u64 {
        self.base.as_ptr() as usize as u64
    }

    /// Overwrites the whole region with zeroes.
    ///
    /// Callers must ensure the remote is not concurrently using the ring,
    /// which holds before the init handshake.
    pub fn zero(&self) {
        // SAFETY: `base` is valid for `len` bytes for the lifetime of `self`.
        unsafe { ptr::write_bytes(self.base.as_ptr(), 0, self.len) };
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { layout } = &self.backing {
            // SAFETY: allocated in `heap_backed` with exactly this layout.
            unsafe { dealloc(self.base.as_ptr(), *layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(region: &SharedRegion) -> &[u8] {
        // SAFETY: test-only view; nothing else writes to the region here.
        unsafe { std::slice::from_raw_parts(region.base_ptr(), region.len()) }
    }

    #[test]
    fn allocation_is_zeroed_and_aligned() {
        let region = SharedRegion::new_zeroed(8192, 4096).expect("allocate region");
        assert_eq!(region.len(), 8192);
        assert!(region.is_owned());
        assert_eq!(region.base_ptr() as usize % 4096, 0);
        assert!(bytes(&region).iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_bad_requests() {
        assert!(matches!(
            SharedRegion::new_zeroed(0, 64),
            Err(TransportError::AllocationFailed { .. })
        ));
        assert!(matches!(
            SharedRegion::new_zeroed(64, 3),
            Err(TransportError::AllocationFailed { .. })
        ));
    }

    #[test]
    fn zero_clears_previous_contents() {
        let region = SharedRegion::new_zeroed(256, 64).expect("allocate region");
        // SAFETY: exclusive test access to a 256-byte region.
        unsafe { ptr::write_bytes(region.base_ptr(), 0xAB, 256) };
        region.zero();
        assert!(bytes(&region).iter().all(|&b| b == 0));
    }

    #[test]
    fn mapped_region_is_not_released() {
        let mut backing = vec![0u64; 32];
        let ptr = backing.as_mut_ptr() as *mut u8;
        {
            // SAFETY: `backing` outlives the region handle.
            let region = unsafe { SharedRegion::from_raw_parts(ptr, 256) }.expect("bind region");
            assert!(!region.is_owned());
            assert_eq!(region.bus_address(), ptr as usize as u64);
            // SAFETY: 256 bytes are valid behind `ptr`.
            unsafe { ptr::write_bytes(region.base_ptr(), 0x5A, 256) };
        }
        assert!(backing.iter().all(|&w| w == 0x5A5A_5A5A_5A5A_5A5A));
    }

    #[test]
    fn mapped_region_validation() {
        let mut backing = vec![0u64; 4];
        let ptr = backing.as_mut_ptr() as *mut u8;
        // SAFETY: the pointers below are only validated, never dereferenced.
        unsafe {
            assert!(SharedRegion::from_raw_parts(ptr::null_mut(), 32).is_err());
            assert!(SharedRegion::from_raw_parts(ptr, 0).is_err());
            assert!(SharedRegion::from_raw_parts(ptr.add(1), 16).is_err());
        }
    }
}
