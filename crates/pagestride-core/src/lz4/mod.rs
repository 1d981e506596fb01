//! LZ4 compression implementation.
//!
//! This module provides a pure Rust implementation of the LZ4 block format
//! as specified in <https://github.com/lz4/lz4/blob/dev/doc/lz4_Block_format.md>,
//! writing into caller-owned buffers so a whole stride can be compressed
//! inside one preallocated workspace.

mod compress;
mod decompress;

pub use compress::compress_into;
pub use decompress::decompress;

/// Worst-case compressed size for `len` input bytes (LZ4 `compressBound`).
#[must_use]
pub const fn worst_case_len(len: usize) -> usize {
    len + len / 255 + 16
}

/// LZ4 block format constants.
pub mod constants {
    /// Minimum match length.
    pub const MIN_MATCH: usize = 4;
    /// Offset for last literals (must leave room at end).
    pub const LAST_LITERALS: usize = 5;
    /// Minimum length for last match (safety margin).
    pub const MF_LIMIT: usize = 12;
    /// Hash table size (power of 2).
    pub const HASH_SIZE_U32: usize = 1 << 14; // 16384 entries
    /// Maximum offset for matches.
    pub const MAX_DISTANCE: usize = 65535;
}
