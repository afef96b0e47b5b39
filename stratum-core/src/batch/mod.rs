//! Command batch encoding.
//!
//! A [`Batch`] is a chain of buffers filled front to back with command
//! dwords. Addresses of other buffer objects are written speculatively and
//! recorded in a [`RelocList`] so submission can patch them if the target
//! has moved.

mod command;
mod encoder;
mod reloc;

pub use command::{
    BATCH_BUFFER_START_DWORDS, CHAIN_RESERVE, MI_BATCH_BUFFER_END, MI_BATCH_BUFFER_START, MI_NOOP,
};
pub use encoder::{Batch, BatchBuffer, BatchBufferSource, BatchState, Command};
pub use reloc::{RelocList, Relocation};
