use crate::page::{PageAllocator, PageBuf, PAGE_SIZE};
use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Page allocator that runs dry after a fixed number of pages.
#[derive(Debug, Default)]
pub struct FailingAllocator {
    remaining: AtomicUsize,
    allocated: AtomicUsize,
}

impl FailingAllocator {
    /// Allow `pages` successful allocations, then fail every request.
    #[must_use]
    pub fn after(pages: usize) -> Self {
        Self { remaining: AtomicUsize::new(pages), allocated: AtomicUsize::new(0) }
    }

    /// Pages handed out so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Allow `pages` more allocations.
    pub fn refill(&self, pages: usize) {
        self.remaining.fetch_add(pages, Ordering::Relaxed);
    }
}

impl PageAllocator for FailingAllocator {
    fn alloc_page(&self) -> Result<PageBuf> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Error::Allocation { what: "run page", bytes: PAGE_SIZE })?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        PageBuf::try_new()
    }
}
