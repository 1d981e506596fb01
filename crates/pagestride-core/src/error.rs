//! Error types for pagestride-core.

use thiserror::Error;

/// Coarse classification of an [`Error`].
///
/// Callers on the read path use the kind to decide whether a page degrades
/// to a synchronous read or fails outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Workspace, page buffer or descriptor could not be allocated.
    Allocation,
    /// The compressor or decompressor rejected its input.
    Codec,
    /// The block-mapping collaborator failed.
    Mapping,
    /// A transfer reported an error.
    Io,
    /// The page cannot be handled by batched or compressed reads.
    UnsupportedLayout,
    /// Caller passed arguments outside the supported range.
    InvalidInput,
    /// Broken internal invariant.
    Internal,
}

/// Why a page abandoned the batched read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confusion {
    /// The page already carries per-block buffers.
    BufferedPage,
    /// The mapping reported data that is already up to date.
    AlreadyUptodate,
    /// A mapped block follows a hole inside the same page.
    HoleBeforeData,
    /// Physical blocks inside the page are not contiguous.
    NonContiguous,
    /// The block mapper returned an error.
    MappingFailed,
}

impl std::fmt::Display for Confusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BufferedPage => "page has buffers",
            Self::AlreadyUptodate => "mapping already up to date",
            Self::HoleBeforeData => "data after hole",
            Self::NonContiguous => "non-contiguous blocks",
            Self::MappingFailed => "block mapping failed",
        };
        f.write_str(s)
    }
}

/// Errors that can occur during stride compression and page I/O.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Input data is invalid or out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Compressed data is corrupted or truncated.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// Output buffer is too small.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes needed.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// Memory for a buffer could not be obtained.
    #[error("allocation failed: {what} ({bytes} bytes)")]
    Allocation {
        /// What was being allocated.
        what: &'static str,
        /// Requested size in bytes.
        bytes: usize,
    },

    /// Block mapping failed for a logical block.
    #[error("mapping failed at block {block}: {reason}")]
    Mapping {
        /// Logical block that could not be mapped.
        block: u64,
        /// Collaborator supplied reason.
        reason: String,
    },

    /// I/O error reported by the transport.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Page layout not supported by batched reads.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(Confusion),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::CorruptedData(_) | Self::BufferTooSmall { .. } => ErrorKind::Codec,
            Self::Allocation { .. } => ErrorKind::Allocation,
            Self::Mapping { .. } => ErrorKind::Mapping,
            Self::IoError(_) => ErrorKind::Io,
            Self::UnsupportedLayout(_) => ErrorKind::UnsupportedLayout,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for stride operations.
pub type Result<T> = std::result::Result<T, Error>;
