//! Scratch memory for one stride compress or decompress call.

use crate::codec::Codec;
use crate::page::{try_zeroed, LENGTH_HEADER_LEN, PAGE_SIZE, STRIDE_LEN};
use crate::{Error, Result};

/// Scratch buffers owned by exactly one compress or decompress call.
///
/// Both staging buffers are sized for the codec's worst-case expansion of a
/// stride plus the length header, rounded up to whole pages, so a framed run
/// can be assembled in place and split into pages directly. Dropping the
/// workspace releases all three buffers.
#[derive(Debug)]
pub struct Workspace {
    pub(crate) memory: Vec<u32>,
    pub(crate) compressed: Vec<u8>,
    pub(crate) decompressed: Vec<u8>,
    stride_pages: usize,
}

impl Workspace {
    /// Allocate a workspace for strides of up to `stride_pages` pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a zero or oversized stride and
    /// [`Error::Allocation`] if any buffer cannot be obtained.
    pub fn new(codec: &dyn Codec, stride_pages: usize) -> Result<Self> {
        if stride_pages == 0 || stride_pages > STRIDE_LEN {
            return Err(Error::InvalidInput(format!(
                "stride must hold 1..={STRIDE_LEN} pages, got {stride_pages}"
            )));
        }
        let staging = Self::staging_len(codec, stride_pages);

        let words = codec.scratch_words();
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(words)
            .map_err(|_| Error::Allocation { what: "codec memory", bytes: words * 4 })?;
        memory.resize(words, 0);

        let compressed = try_zeroed("compressed staging", staging)?;
        let decompressed = try_zeroed("decompressed staging", staging)?;

        tracing::trace!(stride_pages, staging, "workspace allocated");
        Ok(Self { memory, compressed, decompressed, stride_pages })
    }

    /// Staging buffer size for `stride_pages` pages.
    #[must_use]
    pub fn staging_len(codec: &dyn Codec, stride_pages: usize) -> usize {
        let worst = codec.worst_case_len(stride_pages * PAGE_SIZE) + LENGTH_HEADER_LEN;
        worst.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    /// Number of pages this workspace was sized for.
    #[must_use]
    pub fn stride_pages(&self) -> usize {
        self.stride_pages
    }

    /// Length of each staging buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.compressed.len()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        tracing::trace!(stride_pages = self.stride_pages, "workspace released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Lz4Codec, StoreCodec};

    #[test]
    fn test_workspace_sizes() {
        let ws = Workspace::new(&Lz4Codec, STRIDE_LEN).unwrap();
        assert_eq!(ws.stride_pages(), 16);
        assert_eq!(ws.memory.len(), 1 << 14);
        assert_eq!(ws.capacity() % PAGE_SIZE, 0);
        assert!(ws.capacity() >= Lz4Codec.worst_case_len(16 * PAGE_SIZE) + LENGTH_HEADER_LEN);
        assert_eq!(ws.decompressed.len(), ws.capacity());
    }

    #[test]
    fn test_workspace_store_codec_single_page() {
        let ws = Workspace::new(&StoreCodec, 1).unwrap();
        assert!(ws.memory.is_empty());
        assert_eq!(ws.capacity(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_workspace_rejects_bad_stride() {
        assert!(Workspace::new(&Lz4Codec, 0).is_err());
        assert!(Workspace::new(&Lz4Codec, STRIDE_LEN + 1).is_err());
    }
}
