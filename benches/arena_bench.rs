//! Arena Benchmark Suite
//!
//! Benchmarks for the binned arena over host memory:
//! - Steady-state allocate/free reuse (the hot path, no substrate traffic)
//! - Mixed-size churn with splitting and coalescing
//! - Cold growth cost (every iteration hits the substrate)
//! - Fragmentation behavior under an interleaved free pattern
//!
//! Run with: `cargo bench --bench arena_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use memforge::{ArenaConfig, BinnedArena, DevicePtr, HostSubstrate};

const KIB: usize = 1 << 10;
const MIB: usize = 1 << 20;

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(10),
        }
    }

    fn run<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let total: Duration = self.durations.iter().sum();
        let avg = total / self.iterations as u32;
        let min = *self.durations.iter().min().unwrap();
        let max = *self.durations.iter().max().unwrap();

        let mut sorted = self.durations.clone();
        sorted.sort();

        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() * 95) / 100];
        let p99 = sorted[(sorted.len() * 99) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:?} ({:.3} us)", avg, avg.as_secs_f64() * 1e6);
        println!("Min:     {:?} ({:.3} us)", min, min.as_secs_f64() * 1e6);
        println!("Max:     {:?} ({:.3} us)", max, max.as_secs_f64() * 1e6);
        println!("P50:     {:?} ({:.3} us)", p50, p50.as_secs_f64() * 1e6);
        println!("P95:     {:?} ({:.3} us)", p95, p95.as_secs_f64() * 1e6);
        println!("P99:     {:?} ({:.3} us)", p99, p99.as_secs_f64() * 1e6);
    }
}

/// Format bytes as human readable (KB, MB, GB)
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;
    const GB: usize = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn host_arena() -> BinnedArena<HostSubstrate> {
    BinnedArena::new(HostSubstrate::new(), ArenaConfig::default())
        .expect("default config is valid")
}

// ============================================================================
// Steady-State Reuse
// ============================================================================

/// Allocate/free the same size repeatedly: after the first growth every
/// request is served from the free list with zero substrate traffic.
fn benchmark_steady_state_reuse() {
    println!("\n[Steady-State Reuse Benchmarks]");
    println!("=================================");

    let sizes = vec![
        (512, "512 B"),
        (4 * KIB, "4 KB"),
        (64 * KIB, "64 KB"),
        (MIB, "1 MB"),
    ];

    for (size, label) in sizes {
        let mut arena = host_arena();
        // Prime the arena so the measured loop never grows.
        let primed = arena.allocate(size).expect("prime allocation");
        arena.deallocate(primed);

        let bench = Benchmark::new(&format!("Allocate/Free Reuse ({})", label), 10_000);
        let result = bench.run(|| {
            let ptr = arena.allocate(size).expect("reuse allocation");
            arena.deallocate(ptr);
            ptr
        });
        result.report();

        let stats = arena.stats();
        println!("  Reserved:           {}", format_bytes(stats.reserved_bytes));
        println!("  Blocks:             {}", stats.block_count);
    }
}

// ============================================================================
// Mixed-Size Churn
// ============================================================================

/// A rolling window of mixed-size allocations: every iteration splits,
/// frees, and coalesces pieces of different classes.
fn benchmark_mixed_churn() {
    println!("\n[Mixed-Size Churn Benchmarks]");
    println!("===============================");

    let mut arena = host_arena();
    let sizes = [512, 4 * KIB, 17 * KIB, 64 * KIB, 300 * KIB];
    let mut live: Vec<DevicePtr> = Vec::new();
    let mut cursor = 0usize;

    let bench = Benchmark::new("Mixed Churn (window of 32)", 5_000);
    let result = bench.run(|| {
        let size = sizes[cursor % sizes.len()];
        cursor += 1;
        let ptr = arena.allocate(size).expect("churn allocation");
        live.push(ptr);
        if live.len() > 32 {
            let victim = live.swap_remove(cursor % 32);
            arena.deallocate(victim);
        }
    });
    result.report();

    let stats = arena.stats();
    println!("  Reserved:           {}", format_bytes(stats.reserved_bytes));
    println!("  In use:             {}", format_bytes(stats.in_use_bytes));
    println!("  Free pieces:        {}", stats.free_piece_count);
    println!("  Fragmentation:      {:.2}%", stats.fragmentation() * 100.0);

    for ptr in live.drain(..) {
        arena.deallocate(ptr);
    }
}

// ============================================================================
// Cold Growth
// ============================================================================

/// Fresh arena per iteration: measures the substrate-bound growth path the
/// free list exists to amortize.
fn benchmark_cold_growth() {
    println!("\n[Cold Growth Benchmarks]");
    println!("==========================");

    let sizes = vec![
        (100 * KIB, "100 KB (2 MB tier)"),
        (5 * MIB, "5 MB (20 MB tier)"),
        (24 * MIB, "24 MB (2 MB rounded)"),
    ];

    for (size, label) in sizes {
        let bench = Benchmark::new(&format!("Cold First Allocation ({})", label), 200);
        let result = bench.run(|| {
            let mut arena = host_arena();
            let ptr = arena.allocate(size).expect("cold allocation");
            black_box(ptr);
            // Arena drop returns the block to the substrate.
        });
        result.report();
    }
}

// ============================================================================
// Fragmentation Profile
// ============================================================================

/// Allocate a ladder, free every other rung, and report what the free list
/// looks like before and after the holes are refilled.
fn benchmark_fragmentation_profile() {
    println!("\n[Fragmentation Profile]");
    println!("=========================");

    let mut arena = host_arena();
    let count = 64;
    let size = 64 * KIB;

    let ptrs: Vec<DevicePtr> = (0..count)
        .map(|_| arena.allocate(size).expect("ladder allocation"))
        .collect();

    for (i, &ptr) in ptrs.iter().enumerate() {
        if i % 2 == 1 {
            arena.deallocate(ptr);
        }
    }
    let holed = arena.stats();
    println!("\n  After freeing every other piece:");
    println!("    Free pieces:      {}", holed.free_piece_count);
    println!("    Free bytes:       {}", format_bytes(holed.free_bytes));
    println!("    Largest free:     {}", format_bytes(holed.largest_free_bytes));
    println!("    Fragmentation:    {:.2}%", holed.fragmentation() * 100.0);

    // Refill the holes; each fits exactly, so no new blocks appear.
    let refills: Vec<DevicePtr> = (0..count / 2)
        .map(|_| arena.allocate(size).expect("refill allocation"))
        .collect();
    let refilled = arena.stats();
    println!("\n  After refilling the holes:");
    println!("    Free pieces:      {}", refilled.free_piece_count);
    println!("    Blocks:           {}", refilled.block_count);
    println!("    Fragmentation:    {:.2}%", refilled.fragmentation() * 100.0);

    for (i, &ptr) in ptrs.iter().enumerate() {
        if i % 2 == 0 {
            arena.deallocate(ptr);
        }
    }
    for ptr in refills {
        arena.deallocate(ptr);
    }
    arena.reclaim();
    println!(
        "\n  After drain + reclaim:  {} reserved",
        format_bytes(arena.stats().reserved_bytes)
    );
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() {
    println!("====================================");
    println!("memforge Arena Benchmark Suite");
    println!("====================================");
    println!("\nThis benchmark measures:");
    println!("- Steady-state allocate/free reuse latency");
    println!("- Mixed-size churn with splitting and coalescing");
    println!("- Cold growth cost through the substrate");
    println!("- Fragmentation under interleaved free patterns");

    benchmark_steady_state_reuse();
    benchmark_mixed_churn();
    benchmark_cold_growth();
    benchmark_fragmentation_profile();

    println!("\n====================================");
    println!("Benchmark Complete");
    println!("====================================");
}
