//! Host-memory substrate over the system allocator.
//!
//! Stands in for a device in tests and CPU-only embeddings: same contract,
//! same (coarse-grained) call pattern, real memory. Also usable directly as
//! a plain non-caching allocator when the arena is not wanted.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;

use super::{DevicePtr, SubstrateAllocator, SubstrateError};

/// Alignment of every backing allocation handed out by the host substrate.
const HOST_ALIGN: usize = 64;

/// Substrate adapter backed by `std::alloc`.
///
/// Tracks the layout of every outstanding allocation so `raw_free` can hand
/// the exact layout back to the system allocator.
#[derive(Debug, Default)]
pub struct HostSubstrate {
    outstanding: HashMap<usize, Layout>,
}

impl HostSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backing allocations currently live.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

impl SubstrateAllocator for HostSubstrate {
    fn raw_alloc(&mut self, size: usize) -> Result<DevicePtr, SubstrateError> {
        let layout = Layout::from_size_align(size, HOST_ALIGN).map_err(|e| {
            SubstrateError::AllocationFailed {
                size,
                reason: e.to_string(),
            }
        })?;

        // SAFETY: the arena never requests zero bytes, so the layout has a
        // nonzero size as `alloc` requires.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(SubstrateError::AllocationFailed {
                size,
                reason: "host allocator returned null".to_string(),
            });
        }

        tracing::trace!(size, addr = ptr as usize, "host raw_alloc");
        self.outstanding.insert(ptr as usize, layout);
        Ok(DevicePtr::from_addr(ptr as usize))
    }

    fn raw_free(&mut self, ptr: DevicePtr) {
        match self.outstanding.remove(&ptr.addr()) {
            Some(layout) => {
                tracing::trace!(addr = ptr.addr(), size = layout.size(), "host raw_free");
                // SAFETY: the address came from `raw_alloc` with this exact
                // layout and has not been freed yet (it was still tracked).
                unsafe { dealloc(ptr.addr() as *mut u8, layout) };
            }
            None => {
                tracing::error!(addr = ptr.addr(), "raw_free of unknown host allocation");
            }
        }
    }
}

impl Drop for HostSubstrate {
    fn drop(&mut self) {
        if !self.outstanding.is_empty() {
            tracing::warn!(
                count = self.outstanding.len(),
                "host substrate dropped with live allocations; freeing"
            );
            for (addr, layout) in self.outstanding.drain() {
                // SAFETY: same provenance argument as in `raw_free`.
                unsafe { dealloc(addr as *mut u8, layout) };
            }
        }
    }
}
