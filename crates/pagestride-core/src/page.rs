//! Page buffers: private on-disk run pages and shared page-cache pages.

use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Standard memory page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Maximum number of pages compressed together as one stride.
pub const STRIDE_LEN: usize = 16;

/// Size of the little-endian compressed-length header at the start of a run.
pub const LENGTH_HEADER_LEN: usize = 4;

/// Allocate a zeroed buffer without aborting on allocation failure.
pub(crate) fn try_zeroed(what: &'static str, bytes: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes).map_err(|_| Error::Allocation { what, bytes })?;
    buf.resize(bytes, 0);
    Ok(buf)
}

/// An exclusively owned page buffer holding part of a compressed run.
///
/// Run pages never live in the page cache; each one is owned either by its
/// [`CompressedRun`](crate::CompressedRun) or by the I/O request currently
/// transferring it.
#[derive(Debug)]
pub struct PageBuf {
    data: Box<[u8]>,
    uptodate: bool,
    error: bool,
}

impl PageBuf {
    /// Allocate a zeroed page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the memory cannot be obtained.
    pub fn try_new() -> Result<Self> {
        let data = try_zeroed("page", PAGE_SIZE)?.into_boxed_slice();
        Ok(Self { data, uptodate: false, error: false })
    }

    /// Page contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable page contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whether the last transfer into this page succeeded.
    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.uptodate
    }

    /// Whether the last transfer into this page failed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Record the outcome of a transfer.
    pub fn mark_io(&mut self, ok: bool) {
        self.uptodate = ok;
        self.error = !ok;
    }
}

/// Source of fresh run pages.
///
/// Compression and compressed reads allocate whole runs of pages at a time;
/// routing that through a trait lets callers cap or instrument it.
pub trait PageAllocator: Send + Sync {
    /// Allocate one zeroed page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] when no page is available.
    fn alloc_page(&self) -> Result<PageBuf>;
}

/// Allocates pages from the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl PageAllocator for HeapAllocator {
    fn alloc_page(&self) -> Result<PageBuf> {
        PageBuf::try_new()
    }
}

/// Page state bits tracked by the page cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageFlags {
    /// Contents reflect the on-disk data.
    pub uptodate: bool,
    /// The last read failed.
    pub error: bool,
    /// Every block of the page is backed by disk.
    pub mapped_to_disk: bool,
    /// Marker page for the next asynchronous read-ahead.
    pub readahead: bool,
    /// The page carries per-block buffers.
    pub has_buffers: bool,
    /// Contents changed since the last write-back.
    pub dirty: bool,
}

#[derive(Debug)]
struct PageInner {
    data: Box<[u8]>,
    flags: PageFlags,
    locked: bool,
}

/// A page-cache page shared between the cache, readers and I/O completion.
///
/// The lock bit follows page-cache convention: a page is locked while a read
/// is in flight and the completion path unlocks it.
#[derive(Debug)]
pub struct CachePage {
    index: u64,
    inner: Mutex<PageInner>,
    unlocked: Condvar,
}

/// Shared handle to a cache page.
pub type PageRef = Arc<CachePage>;

impl CachePage {
    /// Allocate an unlocked, zeroed, not up-to-date page for `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the page memory cannot be obtained.
    pub fn try_new(index: u64) -> Result<PageRef> {
        let data = try_zeroed("cache page", PAGE_SIZE)?.into_boxed_slice();
        Ok(Arc::new(Self {
            index,
            inner: Mutex::new(PageInner { data, flags: PageFlags::default(), locked: false }),
            unlocked: Condvar::new(),
        }))
    }

    /// Allocate a page holding `bytes` (zero padded), up to date and dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails or `bytes` exceeds a page.
    pub fn with_contents(index: u64, bytes: &[u8]) -> Result<PageRef> {
        if bytes.len() > PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "page contents must be at most {PAGE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let page = Self::try_new(index)?;
        {
            let mut inner = page.inner.lock();
            inner.data[..bytes.len()].copy_from_slice(bytes);
            inner.flags.uptodate = true;
            inner.flags.dirty = true;
        }
        Ok(page)
    }

    /// Logical page index within the file.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Snapshot of the page flags.
    #[must_use]
    pub fn flags(&self) -> PageFlags {
        self.inner.lock().flags
    }

    /// Whether the contents are valid.
    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.inner.lock().flags.uptodate
    }

    /// Whether the page is locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    /// Take the page lock, waiting for the current holder if necessary.
    pub fn lock(&self) {
        let mut inner = self.inner.lock();
        while inner.locked {
            self.unlocked.wait(&mut inner);
        }
        inner.locked = true;
    }

    /// Take the page lock if it is free.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.locked {
            return false;
        }
        inner.locked = true;
        true
    }

    /// Release the page lock and wake waiters.
    pub fn unlock(&self) {
        let mut inner = self.inner.lock();
        inner.locked = false;
        drop(inner);
        self.unlocked.notify_all();
    }

    /// Block until no read holds the page lock.
    pub fn wait_unlocked(&self) {
        let mut inner = self.inner.lock();
        while inner.locked {
            self.unlocked.wait(&mut inner);
        }
    }

    /// Run `f` over the page contents.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock().data)
    }

    /// Run `f` over the mutable page contents.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.inner.lock().data)
    }

    /// Copy of the page contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_data(<[u8]>::to_vec)
    }

    /// Fill the page from `src`, mark it up to date and clear any error.
    pub fn fill_uptodate(&self, src: &[u8]) {
        let mut inner = self.inner.lock();
        let n = src.len().min(PAGE_SIZE);
        inner.data[..n].copy_from_slice(&src[..n]);
        inner.data[n..].fill(0);
        inner.flags.uptodate = true;
        inner.flags.error = false;
    }

    /// Zero the page from `offset` to its end.
    pub fn zero_from(&self, offset: usize) {
        let mut inner = self.inner.lock();
        let offset = offset.min(PAGE_SIZE);
        inner.data[offset..].fill(0);
    }

    /// Mark the page up to date.
    pub fn set_uptodate(&self) {
        let mut inner = self.inner.lock();
        inner.flags.uptodate = true;
        inner.flags.error = false;
    }

    /// Mark the page as failed: not up to date, error set.
    pub fn set_error(&self) {
        let mut inner = self.inner.lock();
        inner.flags.uptodate = false;
        inner.flags.error = true;
    }

    /// Record that every block of the page is backed by disk.
    pub fn set_mapped_to_disk(&self) {
        self.inner.lock().flags.mapped_to_disk = true;
    }

    /// Mark the page as the read-ahead trigger.
    pub fn set_readahead(&self) {
        self.inner.lock().flags.readahead = true;
    }

    /// Attach per-block buffers to the page.
    pub fn set_has_buffers(&self) {
        self.inner.lock().flags.has_buffers = true;
    }

    /// Mark the contents as changed since the last write-back.
    pub fn set_dirty(&self) {
        self.inner.lock().flags.dirty = true;
    }

    /// Clear the dirty bit, returning whether it was set.
    pub fn clear_dirty(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.flags.dirty, false)
    }
}
