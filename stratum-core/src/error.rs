//! Error types for stratum.
//!
//! Every error carries a stable code in its message. The codes are grouped
//! by family so callers can tell an allocator that ran out of memory apart
//! from a request that exceeded a structural limit.

use crate::types::BoHandle;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stratum operations.
#[derive(Error, Debug, Clone)]
pub enum StratumError {
    // =========================================================================
    // Memory Errors (E001-E099)
    // =========================================================================
    /// A pool could not grow its backing mapping.
    #[error("E001: Pool '{pool}' out of memory growing to {requested} bytes: {cause}")]
    OutOfMemory {
        /// Name of the pool that failed.
        pool: String,
        /// Mapping size the pool was trying to reach.
        requested: u64,
        /// Reason for the failure.
        cause: String,
    },

    /// The kernel refused to create a buffer object.
    #[error("E002: Failed to create buffer object of {size} bytes: {cause}")]
    KernelCreate {
        /// Requested size in bytes.
        size: u64,
        /// Reason reported by the provider.
        cause: String,
    },

    /// The kernel refused to map a buffer object.
    #[error("E003: Failed to map buffer object {handle}: {cause}")]
    KernelMap {
        /// Handle that could not be mapped.
        handle: BoHandle,
        /// Reason reported by the provider.
        cause: String,
    },

    /// The kernel refused to promote CPU memory to a GPU-visible object.
    #[error("E004: Failed to bind {size} bytes of host memory: {cause}")]
    KernelBind {
        /// Size of the host range.
        size: u64,
        /// Reason reported by the provider.
        cause: String,
    },

    // =========================================================================
    // Capacity Errors (E100-E199)
    // =========================================================================
    /// A state pool request is larger than the largest size class.
    #[error("E101: State of {size} bytes (align {align}) exceeds the {max}-byte size class")]
    StateTooLarge {
        /// Requested size.
        size: u32,
        /// Requested alignment.
        align: u32,
        /// Largest size class.
        max: u32,
    },

    /// A state stream request does not fit in a single block.
    #[error("E102: Stream allocation of {size} bytes exceeds block capacity of {capacity} bytes")]
    StreamAllocTooLarge {
        /// Requested size including alignment padding.
        size: u32,
        /// Usable bytes per block.
        capacity: u32,
    },

    /// The relocation list could not grow.
    #[error("E103: Relocation list cannot grow to {requested} entries")]
    RelocGrowth {
        /// Entry count that was requested.
        requested: usize,
    },

    /// A batch ran out of room and cannot chain.
    #[error("E104: Batch overflow: requested {requested} bytes, available {available} bytes")]
    BatchOverflow {
        /// Bytes requested.
        requested: u32,
        /// Bytes left in the current buffer.
        available: u32,
    },

    // =========================================================================
    // Configuration Errors (E200-E299)
    // =========================================================================
    /// A configuration value is invalid.
    #[error("E201: Invalid config value for '{field}': {cause}")]
    ConfigValue {
        /// The field with an invalid value.
        field: String,
        /// Why the value was rejected.
        cause: String,
    },

    /// A configuration document could not be parsed.
    #[error("E202: Failed to parse config from {origin}: {cause}")]
    ConfigParse {
        /// File path, or `<inline>` for documents parsed from memory.
        origin: String,
        /// Parser message.
        cause: String,
    },

    // =========================================================================
    // Submission Errors (E300-E399)
    // =========================================================================
    /// The submission collaborator rejected a buffer table.
    #[error("E301: Submission failed: {cause}")]
    Submission {
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // I/O Errors (E900-E999)
    // =========================================================================
    /// I/O error on a backing file.
    #[error("E901: I/O error at {path}: {cause}")]
    Io {
        /// The file path involved.
        path: PathBuf,
        /// Reason for the I/O failure.
        cause: String,
    },
}

impl StratumError {
    /// Get the error code (e.g., "E001").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "E001",
            Self::KernelCreate { .. } => "E002",
            Self::KernelMap { .. } => "E003",
            Self::KernelBind { .. } => "E004",
            Self::StateTooLarge { .. } => "E101",
            Self::StreamAllocTooLarge { .. } => "E102",
            Self::RelocGrowth { .. } => "E103",
            Self::BatchOverflow { .. } => "E104",
            Self::ConfigValue { .. } => "E201",
            Self::ConfigParse { .. } => "E202",
            Self::Submission { .. } => "E301",
            Self::Io { .. } => "E901",
        }
    }

    /// Check if the kernel or a pool ran out of memory.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. }
                | Self::KernelCreate { .. }
                | Self::KernelMap { .. }
                | Self::KernelBind { .. }
        )
    }

    /// Check if a request exceeded a structural limit.
    ///
    /// These are recoverable: the caller can flush and retry with a fresh
    /// recording session.
    #[must_use]
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(
            self,
            Self::StateTooLarge { .. }
                | Self::StreamAllocTooLarge { .. }
                | Self::RelocGrowth { .. }
                | Self::BatchOverflow { .. }
        )
    }

    /// Check if this error is a configuration error.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigValue { .. } | Self::ConfigParse { .. })
    }

    /// Check if the error leaves the allocator or device unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.is_out_of_memory() || matches!(self, Self::Submission { .. })
    }

    pub(crate) fn config(field: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::ConfigValue {
            field: field.into(),
            cause: cause.into(),
        }
    }
}

/// Result type alias using `StratumError`.
pub type Result<T> = std::result::Result<T, StratumError>;
