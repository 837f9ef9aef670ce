//! The binned arena: bin search, piece splitting, eager coalescing, tiered
//! growth, and idle-block reclamation.
//!
//! This type is the single-threaded core. It owns the substrate adapter and
//! all bookkeeping; thread safety is layered on top by
//! [`CachingAllocator`](crate::arena::CachingAllocator) through a
//! [`LockPolicy`](crate::lock::LockPolicy).

use std::collections::HashMap;

use crate::arena::bin::{self, Bin};
use crate::arena::block::Block;
use crate::arena::piece::{PieceId, PieceTable};
use crate::arena::{ArenaConfig, ArenaStats};
use crate::error::{AllocError, AllocResult};
use crate::substrate::{DevicePtr, SubstrateAllocator, SubstrateError};

// Growth tiers for new backing blocks. Small requests are batched into
// 2 MiB blocks, mid-size requests into 20 MiB blocks, and anything larger
// is rounded up to the next 2 MiB boundary so the substrate sees few,
// uniform allocation sizes.
const SMALL_REQUEST_LIMIT: usize = 1 << 20; // 1 MiB
const SMALL_BLOCK_BYTES: usize = 2 << 20; // 2 MiB
const MEDIUM_REQUEST_LIMIT: usize = 10 << 20; // 10 MiB
const MEDIUM_BLOCK_BYTES: usize = 20 << 20; // 20 MiB
const BLOCK_ROUND_BYTES: usize = 2 << 20; // 2 MiB

/// Binned caching allocator over one substrate.
///
/// Amortizes slow, coarse-grained substrate allocations behind a segregated
/// free list: freed ranges are kept, coalesced with their physical
/// neighbors, and served again without touching the substrate. Fully idle
/// backing blocks can be returned via [`reclaim`](Self::reclaim).
pub struct BinnedArena<S: SubstrateAllocator> {
    substrate: S,
    config: ArenaConfig,
    bins: Vec<Bin>,
    pieces: PieceTable,
    piece_by_addr: HashMap<usize, PieceId>,
    blocks: HashMap<usize, Block>,
    reserved_bytes: usize,
    in_use_bytes: usize,
}

impl<S: SubstrateAllocator> BinnedArena<S> {
    /// Create an arena over `substrate` with the given configuration.
    ///
    /// # Errors
    /// `AllocError::InvalidConfig` if the configuration fails validation.
    pub fn new(substrate: S, config: ArenaConfig) -> AllocResult<Self> {
        config.validate()?;
        let bins = (0..config.num_bins)
            .map(|class| Bin::new(bin::class_floor(class, config.alignment)))
            .collect();
        Ok(BinnedArena {
            substrate,
            config,
            bins,
            pieces: PieceTable::new(),
            piece_by_addr: HashMap::new(),
            blocks: HashMap::new(),
            reserved_bytes: 0,
            in_use_bytes: 0,
        })
    }

    /// Allocate `size` bytes, rounded up to the configured alignment.
    ///
    /// Zero-size requests return the null sentinel and touch no state.
    /// On a free-list miss the arena grows by one backing block; if the
    /// substrate refuses, one reclamation pass and one growth retry are
    /// attempted before the failure is reported.
    ///
    /// # Errors
    /// `AllocError::OutOfMemory` when growth (including the
    /// reclamation-assisted retry) cannot satisfy the request.
    pub fn allocate(&mut self, size: usize) -> AllocResult<DevicePtr> {
        if size == 0 {
            return Ok(DevicePtr::NULL);
        }
        let aligned = bin::align_up(size, self.config.alignment);

        if let Some(id) = self.find_piece(aligned) {
            return Ok(self.take_piece(id, size));
        }

        if let Err(first) = self.grow(aligned) {
            tracing::debug!(
                requested = aligned,
                error = %first,
                "growth failed, reclaiming idle blocks before retry"
            );
            if !self.reclaim() {
                return Err(self.out_of_memory(aligned, Some(first)));
            }
            if let Err(second) = self.grow(aligned) {
                return Err(self.out_of_memory(aligned, Some(second)));
            }
        }

        match self.find_piece(aligned) {
            Some(id) => Ok(self.take_piece(id, size)),
            // Growth succeeded but produced no fitting piece; structurally
            // impossible, surfaced as OOM rather than corrupting state.
            None => Err(self.out_of_memory(aligned, None)),
        }
    }

    /// Return `ptr` to the arena.
    ///
    /// The freed piece is eagerly merged with free physical neighbors (the
    /// lower-address piece survives a merge) and refiled by its final size,
    /// so no two adjacent free pieces ever coexist.
    ///
    /// # Panics
    /// Deallocating an address the arena does not own, or one that is not
    /// currently in use, is a caller bug and panics rather than corrupting
    /// the free-list state. Null is a no-op.
    pub fn deallocate(&mut self, ptr: DevicePtr) {
        if ptr.is_null() {
            return;
        }
        let addr = ptr.addr();
        let Some(&id) = self.piece_by_addr.get(&addr) else {
            panic!("deallocate of address {:#x} not owned by this arena", addr);
        };

        let piece = self.pieces.get_mut(id);
        assert!(!piece.is_free, "double free of address {:#x}", addr);
        piece.is_free = true;
        let size = piece.size;
        self.in_use_bytes -= size;

        let mut survivor = id;
        if let Some(next_id) = self.pieces.get(id).next {
            if self.pieces.get(next_id).is_free {
                self.unfile_piece(next_id);
                self.merge_into(id, next_id);
            }
        }
        if let Some(prev_id) = self.pieces.get(survivor).prev {
            if self.pieces.get(prev_id).is_free {
                self.unfile_piece(prev_id);
                self.merge_into(prev_id, survivor);
                survivor = prev_id;
            }
        }
        self.file_piece(survivor);
        tracing::trace!(addr, size, "freed");
    }

    /// Release every backing block whose whole physical chain is free.
    ///
    /// Returns whether anything was released. Runs automatically once
    /// before an out-of-memory failure is declared; embedders may also call
    /// it on their own schedule (e.g. between batches) to trade held-but-
    /// unused memory for substrate latency on the next growth.
    pub fn reclaim(&mut self) -> bool {
        let mut idle: Vec<usize> = Vec::new();
        for (&addr, block) in &self.blocks {
            let mut cursor = Some(block.head);
            let mut all_free = true;
            while let Some(id) = cursor {
                let piece = self.pieces.get(id);
                if !piece.is_free {
                    all_free = false;
                    break;
                }
                cursor = piece.next;
            }
            if all_free {
                idle.push(addr);
            }
        }

        let mut released = 0usize;
        for addr in idle {
            let Some(block) = self.blocks.remove(&addr) else {
                continue;
            };
            let mut cursor = Some(block.head);
            while let Some(id) = cursor {
                let (piece_addr, next) = {
                    let piece = self.pieces.get(id);
                    (piece.addr, piece.next)
                };
                self.unfile_piece(id);
                self.piece_by_addr.remove(&piece_addr);
                self.pieces.retire(id);
                cursor = next;
            }
            self.substrate.raw_free(DevicePtr::from_addr(block.addr));
            self.reserved_bytes -= block.size;
            released += block.size;
        }

        if released > 0 {
            tracing::info!(
                released,
                reserved = self.reserved_bytes,
                "released idle backing blocks"
            );
        }
        released > 0
    }

    /// Current accounting snapshot.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reserved_bytes: self.reserved_bytes,
            in_use_bytes: self.in_use_bytes,
            free_bytes: self.reserved_bytes - self.in_use_bytes,
            block_count: self.blocks.len(),
            free_piece_count: self.bins.iter().map(Bin::len).sum(),
            largest_free_bytes: self.bins.iter().filter_map(Bin::largest).max().unwrap_or(0),
        }
    }

    /// The configuration this arena was built with.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Walk the full arena state and verify its structural consistency.
    ///
    /// Diagnostic for tests and debugging; O(pieces), never called on the
    /// allocation path. Returns a description of the first inconsistency
    /// found.
    pub fn validate_invariants(&self) -> Result<(), String> {
        let block_sum: usize = self.blocks.values().map(|b| b.size).sum();
        if block_sum != self.reserved_bytes {
            return Err(format!(
                "reserved_bytes {} != sum of block sizes {}",
                self.reserved_bytes, block_sum
            ));
        }

        let mut visited = 0usize;
        let mut free_pieces = 0usize;
        let mut in_use = 0usize;

        for block in self.blocks.values() {
            let mut cursor = Some(block.head);
            let mut expected_addr = block.addr;
            let mut expected_prev: Option<PieceId> = None;
            let mut prev_was_free = false;

            while let Some(id) = cursor {
                let piece = self.pieces.get(id);
                if piece.addr != expected_addr {
                    return Err(format!(
                        "chain gap or overlap in block {:#x}: piece at {:#x}, expected {:#x}",
                        block.addr, piece.addr, expected_addr
                    ));
                }
                if piece.prev != expected_prev {
                    return Err(format!("broken back-link at {:#x}", piece.addr));
                }
                if piece.size == 0 || piece.size % self.config.alignment != 0 {
                    return Err(format!(
                        "piece at {:#x} has unaligned size {}",
                        piece.addr, piece.size
                    ));
                }
                if self.piece_by_addr.get(&piece.addr) != Some(&id) {
                    return Err(format!("piece at {:#x} missing from address map", piece.addr));
                }
                if piece.is_free {
                    if prev_was_free {
                        return Err(format!(
                            "adjacent free pieces ending at {:#x} (coalescing missed)",
                            piece.addr
                        ));
                    }
                    let class =
                        bin::size_class(piece.size, self.config.alignment, self.config.num_bins);
                    if piece.bin != Some(class) {
                        return Err(format!(
                            "free piece at {:#x} filed under {:?}, expected class {}",
                            piece.addr, piece.bin, class
                        ));
                    }
                    if piece.size < self.bins[class].floor() {
                        return Err(format!(
                            "free piece at {:#x} ({} bytes) below its class floor {}",
                            piece.addr,
                            piece.size,
                            self.bins[class].floor()
                        ));
                    }
                    if !self.bins[class]
                        .iter()
                        .any(|&(size, addr)| size == piece.size && addr == piece.addr)
                    {
                        return Err(format!(
                            "free piece at {:#x} not present in bin {}",
                            piece.addr, class
                        ));
                    }
                    free_pieces += 1;
                } else {
                    if piece.bin.is_some() {
                        return Err(format!("in-use piece at {:#x} still filed", piece.addr));
                    }
                    in_use += piece.size;
                }
                visited += 1;
                prev_was_free = piece.is_free;
                expected_addr += piece.size;
                expected_prev = Some(id);
                cursor = piece.next;
            }

            if expected_addr != block.addr + block.size {
                return Err(format!(
                    "block {:#x} chain covers {} of {} bytes",
                    block.addr,
                    expected_addr - block.addr,
                    block.size
                ));
            }
        }

        if visited != self.piece_by_addr.len() {
            return Err(format!(
                "address map holds {} entries, chains hold {} pieces",
                self.piece_by_addr.len(),
                visited
            ));
        }
        if visited != self.pieces.live_count() {
            return Err(format!(
                "descriptor table holds {} live pieces, chains hold {}",
                self.pieces.live_count(),
                visited
            ));
        }
        let filed: usize = self.bins.iter().map(Bin::len).sum();
        if filed != free_pieces {
            return Err(format!(
                "bins file {} pieces, chains hold {} free pieces",
                filed, free_pieces
            ));
        }
        if in_use != self.in_use_bytes {
            return Err(format!(
                "in_use_bytes {} != sum of in-use piece sizes {}",
                self.in_use_bytes, in_use
            ));
        }
        Ok(())
    }

    /// Search the bins for a piece of at least `aligned` bytes, unfile it,
    /// mark it in use, and split off the remainder when the split policy
    /// says to.
    fn find_piece(&mut self, aligned: usize) -> Option<PieceId> {
        let start = bin::size_class(aligned, self.config.alignment, self.config.num_bins);
        for class in start..self.config.num_bins {
            let Some((size, addr)) = self.bins[class].first_fit(aligned) else {
                continue;
            };
            self.bins[class].unfile(size, addr);
            let id = self.piece_by_addr[&addr];
            let piece = self.pieces.get_mut(id);
            piece.is_free = false;
            piece.bin = None;

            // Split when the leftover could serve another request of the
            // same size, or is large in absolute terms; otherwise hand out
            // the whole piece to avoid slicing off slivers.
            let leftover = size - aligned;
            if size >= aligned.saturating_mul(2) || leftover >= self.config.split_threshold {
                self.split_piece(id, aligned);
            }
            return Some(id);
        }
        None
    }

    /// Shrink `id` to `aligned` bytes and splice a new free piece covering
    /// the remainder immediately after it in the physical chain.
    fn split_piece(&mut self, id: PieceId, aligned: usize) {
        let (addr, size, next) = {
            let piece = self.pieces.get(id);
            (piece.addr, piece.size, piece.next)
        };
        let rest_addr = addr + aligned;
        let rest_size = size - aligned;

        let rest = self.pieces.create(rest_addr, rest_size);
        {
            let piece = self.pieces.get_mut(id);
            piece.size = aligned;
            piece.next = Some(rest);
        }
        {
            let rest_piece = self.pieces.get_mut(rest);
            rest_piece.prev = Some(id);
            rest_piece.next = next;
        }
        if let Some(next_id) = next {
            self.pieces.get_mut(next_id).prev = Some(rest);
        }

        self.file_piece(rest);
        let displaced = self.piece_by_addr.insert(rest_addr, rest);
        assert!(displaced.is_none(), "split remainder address already mapped");
        tracing::trace!(addr, aligned, rest_addr, rest_size, "split piece");
    }

    /// Finish handing out a piece chosen by `find_piece`.
    fn take_piece(&mut self, id: PieceId, requested: usize) -> DevicePtr {
        let piece = self.pieces.get(id);
        self.in_use_bytes += piece.size;
        tracing::trace!(requested, size = piece.size, addr = piece.addr, "allocated");
        DevicePtr::from_addr(piece.addr)
    }

    /// Absorb `rhs` into `lhs`; `lhs` must be `rhs`'s physical predecessor
    /// and both must be free and unfiled.
    fn merge_into(&mut self, lhs: PieceId, rhs: PieceId) {
        let (rhs_addr, rhs_size, rhs_next) = {
            let piece = self.pieces.get(rhs);
            (piece.addr, piece.size, piece.next)
        };
        debug_assert_eq!(self.pieces.get(lhs).next, Some(rhs));
        debug_assert_eq!(self.pieces.get(lhs).addr + self.pieces.get(lhs).size, rhs_addr);

        let piece = self.pieces.get_mut(lhs);
        piece.size += rhs_size;
        piece.next = rhs_next;
        if let Some(next_id) = rhs_next {
            self.pieces.get_mut(next_id).prev = Some(lhs);
        }
        self.piece_by_addr.remove(&rhs_addr);
        self.pieces.retire(rhs);
    }

    /// File a free piece into the bin matching its size.
    fn file_piece(&mut self, id: PieceId) {
        let (addr, size) = {
            let piece = self.pieces.get(id);
            assert!(piece.is_free && piece.bin.is_none());
            (piece.addr, piece.size)
        };
        let class = bin::size_class(size, self.config.alignment, self.config.num_bins);
        self.bins[class].file(size, addr);
        self.pieces.get_mut(id).bin = Some(class);
    }

    /// Remove a free piece from its bin.
    fn unfile_piece(&mut self, id: PieceId) {
        let (addr, size, class) = {
            let piece = self.pieces.get(id);
            let class = piece.bin.expect("unfiling a piece that is not filed");
            (piece.addr, piece.size, class)
        };
        self.bins[class].unfile(size, addr);
        self.pieces.get_mut(id).bin = None;
    }

    /// Acquire one new backing block large enough for `aligned` bytes and
    /// register it as a single free piece.
    fn grow(&mut self, aligned: usize) -> Result<(), SubstrateError> {
        let bytes =
            self.block_bytes_for(aligned)
                .ok_or_else(|| SubstrateError::AllocationFailed {
                    size: aligned,
                    reason: "growth size arithmetic overflow".to_string(),
                })?;
        let ptr = self.substrate.raw_alloc(bytes)?;
        let addr = ptr.addr();

        let id = self.pieces.create(addr, bytes);
        self.file_piece(id);
        let displaced = self.piece_by_addr.insert(addr, id);
        assert!(displaced.is_none(), "substrate returned an address already in use");
        self.blocks.insert(addr, Block::new(addr, bytes, id));
        self.reserved_bytes += bytes;

        tracing::debug!(
            requested = aligned,
            block_bytes = bytes,
            addr,
            reserved = self.reserved_bytes,
            "grew arena with new backing block"
        );
        Ok(())
    }

    /// Block size for a request of `aligned` bytes, per the growth tiers,
    /// rounded up to the configured alignment. `None` on overflow.
    fn block_bytes_for(&self, aligned: usize) -> Option<usize> {
        let tiered = if aligned < SMALL_REQUEST_LIMIT {
            SMALL_BLOCK_BYTES
        } else if aligned < MEDIUM_REQUEST_LIMIT {
            MEDIUM_BLOCK_BYTES
        } else {
            aligned.checked_add(BLOCK_ROUND_BYTES - 1)? / BLOCK_ROUND_BYTES * BLOCK_ROUND_BYTES
        };
        let bytes =
            tiered.checked_add(self.config.alignment - 1)? / self.config.alignment
                * self.config.alignment;
        (bytes >= aligned).then_some(bytes)
    }

    fn out_of_memory(&self, aligned: usize, source: Option<SubstrateError>) -> AllocError {
        tracing::warn!(
            requested = aligned,
            reserved = self.reserved_bytes,
            "out of device memory"
        );
        AllocError::OutOfMemory {
            requested: aligned,
            reserved: self.reserved_bytes,
            source,
        }
    }
}

impl<S: SubstrateAllocator> Drop for BinnedArena<S> {
    /// Teardown returns every remaining block to the substrate
    /// unconditionally; clients are not assumed to have freed first.
    fn drop(&mut self) {
        if self.in_use_bytes > 0 {
            tracing::warn!(
                leaked = self.in_use_bytes,
                "arena dropped with outstanding allocations"
            );
        }
        for (addr, block) in std::mem::take(&mut self.blocks) {
            self.substrate.raw_free(DevicePtr::from_addr(addr));
            self.reserved_bytes -= block.size;
        }
    }
}
