//! Substrate allocator interface
//!
//! The arena never talks to a device API directly. It consumes a
//! [`SubstrateAllocator`]: the raw, slow, coarse-grained allocate/free
//! primitive whose calls the arena batches and amortizes. Production use
//! binds this to HIP (`hipMalloc`/`hipFree`, behind the `rocm` feature);
//! tests and CPU embeddings use [`HostSubstrate`] or a recording double.

use std::ffi::c_void;
use std::fmt;

use thiserror::Error;

pub mod host;

#[cfg(feature = "rocm")]
pub mod ffi;
#[cfg(feature = "rocm")]
pub mod hip;

pub use host::HostSubstrate;

#[cfg(feature = "rocm")]
pub use hip::HipSubstrate;

/// Errors reported by a substrate allocator.
#[derive(Error, Debug)]
pub enum SubstrateError {
    /// The raw allocation call itself failed (device out of memory,
    /// driver error, invalid size).
    #[error("raw allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },

    /// The device could not be initialized or selected.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A device query (e.g. free/total memory) failed.
    #[error("device query failed: {0}")]
    QueryFailed(String),
}

/// An address inside a substrate allocation.
///
/// Stored as a plain integer so it can be hashed, ordered, and sent across
/// threads regardless of whether it points at device or host memory. The
/// null address is the sentinel returned for zero-size allocations.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(usize);

impl DevicePtr {
    /// The null sentinel. Never a valid allocation.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Wrap a raw integer address.
    pub fn from_addr(addr: usize) -> Self {
        DevicePtr(addr)
    }

    /// Wrap a raw pointer obtained from a device API.
    pub fn from_raw(ptr: *mut c_void) -> Self {
        DevicePtr(ptr as usize)
    }

    /// The integer address.
    pub fn addr(self) -> usize {
        self.0
    }

    /// The address as a raw pointer, for handing to device APIs or kernels.
    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

/// The raw allocate/free primitive beneath the arena.
///
/// # Contract
///
/// - `raw_alloc` is only called with a nonzero size and, on success, returns
///   a non-null address not overlapping any other live allocation.
/// - `raw_free` is only called with addresses previously returned by
///   `raw_alloc` on the same substrate, exactly once each.
/// - Both calls may be slow; the arena only issues them on growth and
///   reclamation, never on the piece split/merge hot path.
///
/// Implementations take `&mut self` because the arena serializes all
/// substrate traffic under its own lock; no internal synchronization is
/// required.
pub trait SubstrateAllocator: Send {
    /// Obtain one backing allocation of `size` bytes.
    fn raw_alloc(&mut self, size: usize) -> Result<DevicePtr, SubstrateError>;

    /// Return a backing allocation to the device.
    ///
    /// Failures here are not recoverable by the caller; implementations
    /// should log and continue rather than panic.
    fn raw_free(&mut self, ptr: DevicePtr);
}
