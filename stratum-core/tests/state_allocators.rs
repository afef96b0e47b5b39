//! Integration tests for the state pool and state stream.
//!
//! Tests verify that:
//! - Concurrent state pool users never share a state
//! - Size classes are powers of two covering size and alignment
//! - State streams return every block they took

mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use stratum_core::alloc::{StatePool, StateStream};
use stratum_core::config::StatePoolConfig;

use common::{test_block_pool, test_kernel};

#[test]
fn concurrent_state_pool_never_shares_states() {
    const THREADS: usize = 6;

    let pool = StatePool::new(test_block_pool(1024, test_kernel()), &StatePoolConfig::default())
        .unwrap();
    let live = Mutex::new(HashSet::new());
    let barrier = Barrier::new(THREADS);

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let pool = &pool;
            let live = &live;
            let barrier = &barrier;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + t as u64);
                let mut held = Vec::new();
                barrier.wait();
                for _ in 0..1_000 {
                    if held.is_empty() || rng.gen_bool(0.55) {
                        let size = 1u32 << rng.gen_range(4..=10);
                        let mut state = pool.alloc(size, 16).unwrap();
                        assert!(state.size() >= size);
                        assert!(live.lock().unwrap().insert(state.offset()));
                        state.write(4, &(t as u32).to_le_bytes());
                        held.push(state);
                    } else {
                        let state = held.swap_remove(rng.gen_range(0..held.len()));
                        let mut bytes = [0u8; 4];
                        state.read(4, &mut bytes);
                        assert_eq!(u32::from_le_bytes(bytes), t as u32);
                        live.lock().unwrap().remove(&state.offset());
                        pool.free(state);
                    }
                }
                for state in held {
                    live.lock().unwrap().remove(&state.offset());
                    pool.free(state);
                }
            });
        }
    });

    let stats = pool.stats();
    assert_eq!(stats.allocated, stats.freed);
}

#[test]
fn size_classes_cover_size_and_alignment() {
    let pool = StatePool::new(test_block_pool(4096, test_kernel()), &StatePoolConfig::default())
        .unwrap();
    let cases = [
        (1, 1, 64),
        (64, 64, 64),
        (65, 16, 128),
        (100, 512, 512),
        (1024, 4, 1024),
    ];
    for (size, align, expected) in cases {
        let state = pool.alloc(size, align).unwrap();
        assert_eq!(state.size(), expected, "size {size} align {align}");
        assert_eq!(state.offset() % expected, 0);
        pool.free(state);
    }
    let err = pool.alloc(1025, 1).unwrap_err();
    assert!(err.is_capacity_exceeded());
    assert_eq!(err.code(), "E101");
}

#[test]
fn stream_finish_returns_every_block() {
    let block_pool = test_block_pool(256, test_kernel());
    let mut stream = StateStream::new(Arc::clone(&block_pool));

    let mut offsets = HashSet::new();
    for i in 0..200u32 {
        let state = stream.alloc(16 + (i % 5) * 8, 8).unwrap();
        assert!(offsets.insert(state.offset()));
    }
    let taken = stream.block_count() as u64;
    assert_eq!(block_pool.stats().live_blocks(), taken);

    stream.finish();
    assert_eq!(block_pool.stats().live_blocks(), 0);
    assert_eq!(block_pool.stats().blocks_freed, taken);

    // A new session starts from recycled blocks, not leftovers of the old one.
    let state = stream.alloc(16, 8).unwrap();
    assert_eq!(stream.block_count(), 1);
    assert_eq!(block_pool.stats().live_blocks(), 1);
    drop(state);
    drop(stream);
    assert_eq!(block_pool.stats().live_blocks(), 0);
}

#[test]
fn streams_share_a_block_pool() {
    let block_pool = test_block_pool(256, test_kernel());
    let streams: Vec<StateStream> = (0..4).map(|_| StateStream::new(block_pool.clone())).collect();

    std::thread::scope(|s| {
        for mut stream in streams {
            s.spawn(move || {
                for _ in 0..500 {
                    let mut state = stream.alloc(32, 16).unwrap();
                    state.write(0, &[0xee; 32]);
                }
                stream.finish();
            });
        }
    });

    assert_eq!(block_pool.stats().live_blocks(), 0);
}
