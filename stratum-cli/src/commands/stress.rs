//! Stress command - concurrent block pool and state pool load.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Instant;
use stratum_core::alloc::{BlockPoolStats, StatePoolStats};
use stratum_core::config::{BlockPoolConfig, StatePoolConfig};
use stratum_core::kernel::HostKernel;
use stratum_core::{Block, BlockPool, State, StatePool};

#[derive(Debug, Serialize)]
struct StressReport {
    threads: usize,
    iterations: usize,
    seed: u64,
    elapsed_ms: u128,
    violations: u64,
    block_pool: BlockPoolStats,
    state_pool: StatePoolStats,
}

enum Held {
    Block(Block),
    State(State),
}

/// Run the stress command.
pub fn run(
    threads: usize,
    iterations: usize,
    block_size: u32,
    seed: u64,
    json: bool,
) -> Result<()> {
    anyhow::ensure!(threads > 0, "at least one thread is required");

    let kernel = Arc::new(HostKernel::new());
    let config = BlockPoolConfig::default().with_block_size(block_size);
    let block_pool = Arc::new(
        BlockPool::new("stress", &config, kernel).context("Failed to create block pool")?,
    );
    let state_config = StatePoolConfig::default();
    let state_pool = StatePool::new(block_pool.clone(), &state_config)
        .context("Failed to create state pool")?;
    let size_classes = state_config.min_size_log2..=state_config.max_size_log2;

    // Block offsets and state offsets live in the same mapping, so one set
    // catches overlap between the two allocators as well.
    let live = Mutex::new(HashSet::new());
    let violations = AtomicU64::new(0);
    let barrier = Barrier::new(threads);

    tracing::info!(threads, iterations, block_size, seed, "Starting stress run");
    let start = Instant::now();

    std::thread::scope(|s| -> Result<()> {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let block_pool = &block_pool;
                let state_pool = &state_pool;
                let live = &live;
                let violations = &violations;
                let barrier = &barrier;
                let size_classes = size_classes.clone();
                s.spawn(move || -> Result<()> {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                    let mut held: Vec<Held> = Vec::new();
                    barrier.wait();
                    for _ in 0..iterations {
                        if held.is_empty() || rng.gen_bool(0.55) {
                            let (offset, item) = if rng.gen_bool(0.5) {
                                let block = block_pool.alloc()?;
                                (block.offset(), Held::Block(block))
                            } else {
                                let size = 1u32 << rng.gen_range(size_classes.clone());
                                let state = state_pool.alloc(size, 0)?;
                                (state.offset(), Held::State(state))
                            };
                            if !live.lock().insert(offset) {
                                violations.fetch_add(1, Ordering::Relaxed);
                                tracing::error!(offset, thread = t, "offset handed out twice");
                            }
                            held.push(item);
                        } else {
                            let item = held.swap_remove(rng.gen_range(0..held.len()));
                            release(item, block_pool, state_pool, live);
                        }
                    }
                    for item in held {
                        release(item, block_pool, state_pool, live);
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("stress worker panicked"))??;
        }
        Ok(())
    })?;

    let report = StressReport {
        threads,
        iterations,
        seed,
        elapsed_ms: start.elapsed().as_millis(),
        violations: violations.load(Ordering::Relaxed),
        block_pool: block_pool.stats(),
        state_pool: state_pool.stats(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Stress Results");
        println!("==============");
        println!("  Threads:          {}", report.threads);
        println!("  Iterations:       {}", report.iterations);
        println!("  Elapsed:          {} ms", report.elapsed_ms);
        println!("  Violations:       {}", report.violations);
        println!();
        println!("Block pool:");
        println!("  Blocks allocated: {}", report.block_pool.blocks_allocated);
        println!("  Blocks freed:     {}", report.block_pool.blocks_freed);
        println!("  Growths:          {}", report.block_pool.growths);
        println!("  Mapping size:     {} bytes", report.block_pool.mapping_size);
        println!("  Retired mappings: {}", report.block_pool.retired_mappings);
        println!();
        println!("State pool:");
        println!("  Allocated:        {}", report.state_pool.allocated);
        println!("  Freed:            {}", report.state_pool.freed);
        println!("  Blocks carved:    {}", report.state_pool.blocks);
    }

    if report.violations > 0 {
        anyhow::bail!("{} duplicate allocations detected", report.violations);
    }
    Ok(())
}

fn release(item: Held, block_pool: &BlockPool, state_pool: &StatePool, live: &Mutex<HashSet<u32>>) {
    match item {
        Held::Block(block) => {
            live.lock().remove(&block.offset());
            block_pool.free(block);
        }
        Held::State(state) => {
            live.lock().remove(&state.offset());
            state_pool.free(state);
        }
    }
}
