//! memforge - Binned caching allocator for GPU device memory
//!
//! Device allocators (`hipMalloc`-class calls) are slow and coarse-grained;
//! calling them for every tensor buffer is a latency and stability hazard.
//! memforge batches them behind a segregated free-list arena: backing
//! blocks are acquired in large tiers, subdivided into pieces on demand,
//! eagerly coalesced on free, and returned to the device only when a whole
//! block falls idle.
//!
//! The substrate (the raw device allocate/free) is an injected trait, so
//! the same arena runs over HIP devices ([`HipSubstrate`], behind the
//! `rocm` feature), plain host memory ([`HostSubstrate`]), or a test
//! double. The lock discipline is injected the same way: [`SyncLock`] for
//! shared use, [`UnsyncLock`] for single-threaded embeddings and tests.
//!
//! ```
//! use memforge::{ArenaConfig, CachingAllocator, HostSubstrate};
//!
//! # fn main() -> memforge::AllocResult<()> {
//! let alloc: CachingAllocator<HostSubstrate> =
//!     CachingAllocator::new(HostSubstrate::new(), ArenaConfig::default())?;
//!
//! let a = alloc.allocate(100)?;
//! let b = alloc.allocate(4000)?;
//! alloc.deallocate(a)?;
//! alloc.deallocate(b)?;
//!
//! // Both requests were served from one backing block; reclaiming it
//! // brings the reservation back to zero.
//! alloc.reclaim()?;
//! assert_eq!(alloc.stats()?.reserved_bytes, 0);
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod error;
pub mod lock;
pub mod logging;
pub mod substrate;

pub use arena::{ArenaConfig, ArenaStats, BinnedArena, CachingAllocator};
pub use error::{AllocError, AllocResult};
pub use lock::{LockError, LockPolicy, SyncLock, UnsyncLock};
pub use substrate::{DevicePtr, HostSubstrate, SubstrateAllocator, SubstrateError};

#[cfg(feature = "rocm")]
pub use substrate::HipSubstrate;
