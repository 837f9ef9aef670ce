//! Common test utilities
//!
//! Provides a recording substrate double shared by the integration tests:
//! every `raw_alloc`/`raw_free` is tracked in state the test can observe
//! through a [`SubstrateProbe`] while the arena owns the substrate itself.
//! Supports a capacity cap (to emulate a device running out of memory) and
//! one-shot failure injection.

#![allow(dead_code)] // each test binary uses a different subset

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use memforge::{DevicePtr, SubstrateAllocator, SubstrateError};

#[derive(Debug, Default)]
struct RecorderState {
    outstanding: HashMap<usize, usize>, // addr -> size
    reserved: usize,
    alloc_calls: usize,
    free_calls: usize,
    capacity: Option<usize>,
    fail_remaining: usize,
}

/// Substrate double that records all traffic.
///
/// Addresses are fake (monotonic, spaced with a guard gap) so overlap and
/// ownership bugs surface as assertion failures rather than wild reads.
#[derive(Debug)]
pub struct RecordingSubstrate {
    state: Arc<Mutex<RecorderState>>,
    next_addr: usize,
}

impl RecordingSubstrate {
    pub fn new() -> (Self, SubstrateProbe) {
        let state = Arc::new(Mutex::new(RecorderState::default()));
        let probe = SubstrateProbe {
            state: Arc::clone(&state),
        };
        (
            RecordingSubstrate {
                state,
                next_addr: 0x1000_0000,
            },
            probe,
        )
    }

    /// A substrate that rejects allocations once `bytes` are outstanding.
    pub fn with_capacity(bytes: usize) -> (Self, SubstrateProbe) {
        let (substrate, probe) = Self::new();
        substrate.state.lock().unwrap().capacity = Some(bytes);
        (substrate, probe)
    }
}

impl SubstrateAllocator for RecordingSubstrate {
    fn raw_alloc(&mut self, size: usize) -> Result<DevicePtr, SubstrateError> {
        let mut state = self.state.lock().unwrap();
        state.alloc_calls += 1;

        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(SubstrateError::AllocationFailed {
                size,
                reason: "injected failure".to_string(),
            });
        }
        if let Some(capacity) = state.capacity {
            if state.reserved + size > capacity {
                return Err(SubstrateError::AllocationFailed {
                    size,
                    reason: format!(
                        "capacity exceeded: {} outstanding of {}",
                        state.reserved, capacity
                    ),
                });
            }
        }

        let addr = self.next_addr;
        self.next_addr += size + 4096;
        state.outstanding.insert(addr, size);
        state.reserved += size;
        Ok(DevicePtr::from_addr(addr))
    }

    fn raw_free(&mut self, ptr: DevicePtr) {
        let mut state = self.state.lock().unwrap();
        state.free_calls += 1;
        let size = state
            .outstanding
            .remove(&ptr.addr())
            .unwrap_or_else(|| panic!("raw_free of unknown address {:#x}", ptr.addr()));
        state.reserved -= size;
    }
}

/// Observer handle onto a [`RecordingSubstrate`]'s state.
#[derive(Debug, Clone)]
pub struct SubstrateProbe {
    state: Arc<Mutex<RecorderState>>,
}

impl SubstrateProbe {
    pub fn alloc_calls(&self) -> usize {
        self.state.lock().unwrap().alloc_calls
    }

    pub fn free_calls(&self) -> usize {
        self.state.lock().unwrap().free_calls
    }

    pub fn outstanding_blocks(&self) -> usize {
        self.state.lock().unwrap().outstanding.len()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().unwrap().reserved
    }

    /// Make the next `n` allocation calls fail.
    pub fn fail_next_allocs(&self, n: usize) {
        self.state.lock().unwrap().fail_remaining = n;
    }
}
