//! The few command words the encoder itself emits.
//!
//! Everything else in a batch is produced by external packers; the encoder
//! only needs to chain buffers and terminate a batch.

/// No-op, used for padding.
pub const MI_NOOP: u32 = 0;

/// Terminates the top-level batch.
pub const MI_BATCH_BUFFER_END: u32 = 0x0A << 23;

/// Jump to another batch buffer. Followed by a 48-bit address in two dwords.
pub const MI_BATCH_BUFFER_START: u32 = 0x31 << 23 | (BATCH_BUFFER_START_DWORDS - 2);

/// Length of `MI_BATCH_BUFFER_START` including the header.
pub const BATCH_BUFFER_START_DWORDS: u32 = 3;

/// Bytes kept free at the end of every chainable buffer: the jump plus one
/// no-op so the buffer length stays a multiple of 8.
pub const CHAIN_RESERVE: u32 = (BATCH_BUFFER_START_DWORDS + 1) * 4;
