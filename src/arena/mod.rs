//! Binned caching arena for device memory.
//!
//! The arena sits between a tensor-execution runtime and a slow,
//! coarse-grained device allocator. Freed ranges are binned by power-of-two
//! size class, split on demand, eagerly coalesced with physical neighbors,
//! and reused without touching the device; fully idle backing blocks can be
//! returned on request or under memory pressure.
//!
//! [`BinnedArena`] is the single-threaded core; [`CachingAllocator`] wraps
//! it in a pluggable [`LockPolicy`] for shared use.

mod bin;
mod block;
mod core;
mod piece;

pub use self::core::BinnedArena;

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, AllocResult};
use crate::lock::{LockPolicy, SyncLock};
use crate::substrate::{DevicePtr, SubstrateAllocator};

/// Arena tuning knobs.
///
/// The defaults match the device-memory use case: 512-byte granularity,
/// twenty doubling size classes (512 B through 512 MiB), and a 128 MiB
/// absolute split threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Allocation granularity in bytes. Must be a power of two; every
    /// request is rounded up to a multiple of it.
    pub alignment: usize,
    /// Number of doubling size classes.
    pub num_bins: usize,
    /// A free piece's leftover at or above this many bytes is always split
    /// off, even when it is smaller than the request being served.
    pub split_threshold: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            alignment: bin::DEFAULT_ALIGNMENT,
            num_bins: bin::DEFAULT_NUM_BINS,
            split_threshold: bin::DEFAULT_SPLIT_THRESHOLD,
        }
    }
}

impl ArenaConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the allocation granularity.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the number of size classes.
    pub fn with_num_bins(mut self, num_bins: usize) -> Self {
        self.num_bins = num_bins;
        self
    }

    /// Set the absolute split threshold.
    pub fn with_split_threshold(mut self, split_threshold: usize) -> Self {
        self.split_threshold = split_threshold;
        self
    }

    pub(crate) fn validate(&self) -> AllocResult<()> {
        if !self.alignment.is_power_of_two() {
            return Err(AllocError::InvalidConfig(format!(
                "alignment must be a power of two, got {}",
                self.alignment
            )));
        }
        if self.num_bins == 0 {
            return Err(AllocError::InvalidConfig(
                "at least one size class is required".to_string(),
            ));
        }
        if self.split_threshold < self.alignment {
            return Err(AllocError::InvalidConfig(format!(
                "split threshold {} below alignment {}",
                self.split_threshold, self.alignment
            )));
        }
        Ok(())
    }
}

/// Accounting snapshot of an arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaStats {
    /// Bytes currently reserved from the substrate (sum of block sizes).
    pub reserved_bytes: usize,
    /// Bytes handed out to callers, after alignment rounding.
    pub in_use_bytes: usize,
    /// Reserved bytes not currently handed out.
    pub free_bytes: usize,
    /// Live backing blocks.
    pub block_count: usize,
    /// Free pieces across all bins.
    pub free_piece_count: usize,
    /// Size of the largest single free piece.
    pub largest_free_bytes: usize,
}

impl ArenaStats {
    /// Fragmentation ratio of the free space (0.0 = one contiguous free
    /// piece, higher = more scattered).
    pub fn fragmentation(&self) -> f32 {
        if self.free_bytes == 0 {
            return 0.0;
        }
        1.0 - (self.largest_free_bytes as f32 / self.free_bytes as f32)
    }
}

/// Thread-safety wrapper: a [`BinnedArena`] behind an injected lock policy.
///
/// Every public call acquires the guard for its full duration, including
/// the substrate calls made during growth and reclamation, and releases it
/// on every exit path. The default policy is [`SyncLock`] (a real mutex);
/// single-threaded embeddings can use
/// [`UnsyncLock`](crate::lock::UnsyncLock) for the same call shape without
/// synchronization cost.
///
/// # Example
///
/// ```
/// use memforge::{ArenaConfig, CachingAllocator, HostSubstrate};
///
/// # fn main() -> memforge::AllocResult<()> {
/// let alloc: CachingAllocator<HostSubstrate> =
///     CachingAllocator::new(HostSubstrate::new(), ArenaConfig::default())?;
/// let ptr = alloc.allocate(4096)?;
/// alloc.deallocate(ptr)?;
/// alloc.reclaim()?;
/// assert_eq!(alloc.stats()?.reserved_bytes, 0);
/// # Ok(())
/// # }
/// ```
pub struct CachingAllocator<S, L = SyncLock<BinnedArena<S>>>
where
    S: SubstrateAllocator,
    L: LockPolicy<BinnedArena<S>>,
{
    arena: L,
    _substrate: std::marker::PhantomData<S>,
}

impl<S, L> CachingAllocator<S, L>
where
    S: SubstrateAllocator,
    L: LockPolicy<BinnedArena<S>>,
{
    /// Create an allocator over `substrate`.
    ///
    /// # Errors
    /// `AllocError::InvalidConfig` if the configuration fails validation.
    pub fn new(substrate: S, config: ArenaConfig) -> AllocResult<Self> {
        Ok(CachingAllocator {
            arena: L::new(BinnedArena::new(substrate, config)?),
            _substrate: std::marker::PhantomData,
        })
    }

    /// Allocate `size` bytes. See [`BinnedArena::allocate`].
    ///
    /// # Errors
    /// `OutOfMemory` as for the arena; `LockPoisoned` if a previous caller
    /// panicked while holding the lock.
    pub fn allocate(&self, size: usize) -> AllocResult<DevicePtr> {
        self.arena.lock()?.allocate(size)
    }

    /// Free a previously allocated pointer. See [`BinnedArena::deallocate`].
    ///
    /// # Panics
    /// As for the arena: unknown or already-free addresses are caller bugs
    /// and panic. The panic poisons a [`SyncLock`], so subsequent callers
    /// see `LockPoisoned` instead of a possibly corrupted arena.
    pub fn deallocate(&self, ptr: DevicePtr) -> AllocResult<()> {
        self.arena.lock()?.deallocate(ptr);
        Ok(())
    }

    /// Release idle backing blocks. See [`BinnedArena::reclaim`].
    pub fn reclaim(&self) -> AllocResult<bool> {
        Ok(self.arena.lock()?.reclaim())
    }

    /// Accounting snapshot.
    pub fn stats(&self) -> AllocResult<ArenaStats> {
        Ok(self.arena.lock()?.stats())
    }

    /// Consume the wrapper and return the arena.
    pub fn into_arena(self) -> AllocResult<BinnedArena<S>> {
        Ok(self.arena.into_inner()?)
    }
}
