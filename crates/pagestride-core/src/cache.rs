//! Page-cache and inode collaborators.

use crate::page::{PageRef, PAGE_SHIFT, PAGE_SIZE};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The page cache of one file (its address space).
pub trait PageCache: Send + Sync {
    /// Find a resident page.
    fn lookup(&self, index: u64) -> Option<PageRef>;

    /// Allocate a page for `index` without inserting it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] when no page can be allocated.
    fn alloc_page(&self, index: u64) -> Result<PageRef>;

    /// Insert a freshly allocated page and lock it.
    ///
    /// Returns `false` if another page already occupies the index; the
    /// caller then drops its page.
    fn add_page(&self, page: &PageRef) -> bool;

    /// Up to `max` resident pages with consecutive indices starting at
    /// `start`. Stops at the first missing index, so it may return fewer
    /// pages than asked for, or none.
    fn find_contig(&self, start: u64, max: usize) -> Vec<PageRef>;
}

/// The parts of an inode this layer needs.
pub struct Inode {
    ino: u64,
    size: AtomicU64,
    blkbits: u32,
    mapping: Arc<dyn PageCache>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("size", &self.size())
            .field("blkbits", &self.blkbits)
            .finish_non_exhaustive()
    }
}

impl Inode {
    /// Create an inode whose block size equals the page size.
    #[must_use]
    pub fn new(ino: u64, size: u64, mapping: Arc<dyn PageCache>) -> Arc<Self> {
        Arc::new(Self { ino, size: AtomicU64::new(size), blkbits: PAGE_SHIFT, mapping })
    }

    /// Create an inode with `1 << blkbits` byte blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] unless `9 <= blkbits <= PAGE_SHIFT`.
    pub fn with_blkbits(
        ino: u64,
        size: u64,
        blkbits: u32,
        mapping: Arc<dyn PageCache>,
    ) -> Result<Arc<Self>> {
        if !(9..=PAGE_SHIFT).contains(&blkbits) {
            return Err(Error::InvalidInput(format!(
                "block size 2^{blkbits} must lie between 512 and {PAGE_SIZE} bytes"
            )));
        }
        Ok(Arc::new(Self { ino, size: AtomicU64::new(size), blkbits, mapping }))
    }

    /// Inode number.
    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// File size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Update the file size.
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// `log2` of the block size.
    #[must_use]
    pub fn blkbits(&self) -> u32 {
        self.blkbits
    }

    /// Blocks backing one page.
    #[must_use]
    pub fn blocks_per_page(&self) -> u64 {
        1 << (PAGE_SHIFT - self.blkbits)
    }

    /// The file's page cache.
    #[must_use]
    pub fn mapping(&self) -> &Arc<dyn PageCache> {
        &self.mapping
    }

    /// Index of the last page holding file data, `None` for an empty file.
    #[must_use]
    pub fn end_index(&self) -> Option<u64> {
        self.size().checked_sub(1).map(|last| last >> PAGE_SHIFT)
    }

    /// Number of blocks needed to hold the file.
    #[must_use]
    pub fn last_block_in_file(&self) -> u64 {
        let blocksize = 1u64 << self.blkbits;
        (self.size() + blocksize - 1) >> self.blkbits
    }
}
