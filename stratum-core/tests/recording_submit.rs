//! End-to-end tests: record, finalize, submit, move, resubmit.
//!
//! Tests verify that:
//! - Chained batches execute with correct jump addresses
//! - Moving a buffer between submissions flips the relocation flag and the
//!   kernel patches the stale addresses
//! - A write-back between record and finalize flips the flag before
//!   submission
//! - Allocation failures surface at end of recording
//! - Many sessions can record and submit concurrently on one device

mod common;

use std::sync::{Arc, Barrier};
use stratum_core::batch::{MI_BATCH_BUFFER_END, MI_BATCH_BUFFER_START};
use stratum_core::config::{BatchConfig, DeviceConfig};
use stratum_core::device::{CommandRecording, Device};
use stratum_core::testing::{ChaosConfig, ChaosKernel};
use stratum_core::types::GpuAddress;

use common::{read_u64, small_device_config, test_device, test_kernel};

#[test]
fn chained_batch_submits_with_valid_jumps() {
    let (kernel, device, queue) = test_device(small_device_config());
    let target = device.batch_pool().alloc().unwrap();

    let mut rec = CommandRecording::new(&device).unwrap();
    for i in 0..100 {
        rec.emit_address_command(0x7000_0000 | i, &target, i * 4).unwrap();
    }
    let exec = rec.end().unwrap();
    assert!(rec.batch().buffers().len() > 1);
    queue.submit(&exec).unwrap();

    let record = &kernel.submissions()[0];
    assert_eq!(record.handles.last(), Some(&exec.objects().last().unwrap().handle));
    assert_eq!(record.patched, 0);

    // Each jump points at the next buffer.
    let buffers = rec.batch().buffers();
    for pair in buffers.windows(2) {
        let jump = pair[0].jump_offset().unwrap();
        let bo = pair[0].bo().unwrap();
        let words = kernel.read(bo.handle(), u64::from(jump), 4).unwrap();
        assert_eq!(u32::from_le_bytes(words.try_into().unwrap()), MI_BATCH_BUFFER_START);
        let address = read_u64(&kernel, bo.handle(), jump + 4);
        assert_eq!(address, pair[1].bo().unwrap().address().as_u64());
    }

    let last = buffers.last().unwrap();
    let end = kernel
        .read(last.bo().unwrap().handle(), u64::from(last.length() - 8), 8)
        .unwrap();
    let end_words: Vec<u32> = end
        .chunks(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert!(end_words.contains(&MI_BATCH_BUFFER_END));
}

#[test]
fn moved_buffer_is_patched_on_resubmit() {
    let (kernel, device, queue) = test_device(DeviceConfig::default());
    let target = device.batch_pool().alloc().unwrap();

    let mut rec = CommandRecording::new(&device).unwrap();
    rec.emit_address_command(0x7100_0000, &target, 0x20).unwrap();
    let exec = rec.end().unwrap();
    assert!(exec.no_reloc());
    queue.submit(&exec).unwrap();

    let moved = GpuAddress::new(0x40_0000_0000);
    assert!(kernel.move_buffer(target.handle(), moved));
    queue.submit(&exec).unwrap();

    assert_eq!(target.address(), moved);
    assert_eq!(kernel.submissions()[1].patched, 1);
    let batch = exec.objects().last().unwrap().handle;
    assert_eq!(read_u64(&kernel, batch, 4), moved.as_u64() + 0x20);

    // Recorded after the write-back, the presumed address is current.
    let mut fresh = CommandRecording::new(&device).unwrap();
    fresh.emit_address_command(0x7100_0000, &target, 0).unwrap();
    assert!(fresh.end().unwrap().no_reloc());
}

#[test]
fn write_back_between_record_and_finalize_sets_need_reloc() {
    let (kernel, device, queue) = test_device(DeviceConfig::default());
    let target = device.batch_pool().alloc().unwrap();

    let mut early = CommandRecording::new(&device).unwrap();
    early.emit_address_command(0x7200_0000, &target, 0).unwrap();

    // Another submission learns that the target moved.
    let moved = GpuAddress::new(0x60_0000_0000);
    kernel.move_buffer(target.handle(), moved);
    let mut other = CommandRecording::new(&device).unwrap();
    other.emit_address_command(0x7200_0000, &target, 0).unwrap();
    queue.submit(&other.end().unwrap()).unwrap();
    assert_eq!(target.address(), moved);

    let exec = early.end().unwrap();
    assert!(exec.need_reloc());
    queue.submit(&exec).unwrap();
    assert_eq!(kernel.submissions().last().unwrap().patched, 1);
}

#[test]
fn allocation_failure_reported_at_end() {
    let chaos = Arc::new(ChaosKernel::new(
        test_kernel(),
        ChaosConfig::new().fail_bind_after(0),
    ));
    let device = Device::new(small_device_config(), chaos.clone()).unwrap();

    let mut rec = CommandRecording::new(&device).unwrap();
    let err = rec.alloc_dynamic_state(64, 64).unwrap_err();
    assert!(err.is_out_of_memory());
    rec.emit_dwords(&[1, 2, 3]).unwrap();

    let reported = rec.end().unwrap_err();
    assert_eq!(reported.code(), err.code());
    assert!(device.dynamic_state_pool().is_poisoned());
    // Other pools are unaffected.
    assert!(!device.surface_state_pool().is_poisoned());
}

#[test]
fn concurrent_sessions_share_device() {
    const THREADS: usize = 4;

    let config = small_device_config().with_batch(BatchConfig::default().with_buffer_size(512));
    let (kernel, device, queue) = test_device(config);
    let queue = &queue;
    let barrier = Barrier::new(THREADS);

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let device = device.clone();
            let barrier = &barrier;
            s.spawn(move || {
                let mut rec = CommandRecording::new(&device).unwrap();
                barrier.wait();
                for round in 0..10u32 {
                    for i in 0..50u32 {
                        let state = rec.alloc_dynamic_state(32, 32).unwrap();
                        rec.emit_address_command(
                            0x7000_0000 | (t as u32) << 16 | i,
                            device.dynamic_state_pool().bo(),
                            state.offset(),
                        )
                        .unwrap();
                        let shared = device.dynamic_state().alloc(64, 64).unwrap();
                        device.dynamic_state().free(shared);
                    }
                    let exec = rec.end().unwrap();
                    assert!(queue.submit(&exec).unwrap() > round as u64);
                    rec.reset();
                }
            });
        }
    });

    assert_eq!(queue.last_serial(), (THREADS * 10) as u64);
    assert_eq!(kernel.submissions().len(), THREADS * 10);
}

#[test]
fn host_batch_splices_into_queue_submission() {
    let (kernel, device, queue) = test_device(DeviceConfig::default());
    let target = device.batch_pool().alloc().unwrap();

    let mut cached = stratum_core::Batch::host(64);
    cached
        .command(3)
        .unwrap()
        .set(0, 0x7400_0000)
        .set_address(1, &target, 0)
        .unwrap();

    let mut rec = CommandRecording::new(&device).unwrap();
    rec.emit_dwords(&[0, 0, 0, 0]).unwrap();
    rec.batch_mut().emit_batch(&cached).unwrap();
    let exec = rec.end().unwrap();
    queue.submit(&exec).unwrap();

    let batch_bo = rec.batch().buffers()[0].bo().unwrap();
    assert_eq!(read_u64(&kernel, batch_bo.handle(), 20), target.address().as_u64());
    assert!(exec.index_of(&target).is_some());
}
