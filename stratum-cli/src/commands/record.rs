//! Record command - record, finalize and submit a synthetic batch.

use super::load_config;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use stratum_core::kernel::HostKernel;
use stratum_core::{CommandRecording, Device, Queue};

/// Header of the synthetic state-pointer command.
const STATE_POINTER: u32 = 0x7800_0001;

#[derive(Debug, Serialize)]
struct BufferReport {
    index: usize,
    handle: String,
    size: u64,
    relocations: usize,
}

#[derive(Debug, Serialize)]
struct ChainReport {
    length: u32,
    relocations: usize,
    chained: bool,
}

#[derive(Debug, Serialize)]
struct RecordReport {
    commands: u32,
    serial: u64,
    batch_len: u32,
    need_reloc: bool,
    chain: Vec<ChainReport>,
    table: Vec<BufferReport>,
}

/// Run the record command.
pub fn run(commands: u32, config: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let kernel = Arc::new(HostKernel::new());
    let device = Device::new(config, kernel.clone()).context("Failed to create device")?;
    let queue = Queue::new(device.clone(), kernel.clone());

    tracing::info!(commands, "Recording synthetic batch");
    let mut rec = CommandRecording::new(&device).context("Failed to open recording")?;
    for i in 0..commands {
        let mut state = rec.alloc_dynamic_state(64, 64)?;
        state.write(0, &i.to_le_bytes());
        rec.emit_address_command(STATE_POINTER, device.dynamic_state_pool().bo(), state.offset())?;
    }
    let exec = rec.end().context("Recording failed")?;
    let serial = queue.submit(&exec).context("Submission failed")?;

    let batch = rec.batch();
    let chain = batch
        .buffers()
        .iter()
        .map(|buffer| ChainReport {
            length: buffer.length(),
            relocations: buffer.reloc_range().len(),
            chained: buffer.jump_offset().is_some(),
        })
        .collect();
    let table = exec
        .objects()
        .iter()
        .enumerate()
        .map(|(index, object)| BufferReport {
            index,
            handle: object.handle.to_string(),
            size: object.size,
            relocations: object.relocations.len(),
        })
        .collect();
    let report = RecordReport {
        commands,
        serial,
        batch_len: exec.batch_len(),
        need_reloc: exec.need_reloc(),
        chain,
        table,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Recorded {} commands, submission #{}", report.commands, report.serial);
    println!();
    println!("Batch chain ({} buffers):", report.chain.len());
    for (i, buffer) in report.chain.iter().enumerate() {
        println!(
            "  [{}] {:>6} bytes  {:>5} relocations{}",
            i,
            buffer.length,
            buffer.relocations,
            if buffer.chained { "  -> next" } else { "" }
        );
    }
    println!();
    println!("Buffer table (execution starts at the last entry):");
    for entry in &report.table {
        println!(
            "  {:>3}  {:<8} {:>10} bytes  {:>5} relocations",
            entry.index, entry.handle, entry.size, entry.relocations
        );
    }
    println!();
    println!("  Batch length: {} bytes", report.batch_len);
    println!("  Needs relocation: {}", report.need_reloc);

    Ok(())
}
