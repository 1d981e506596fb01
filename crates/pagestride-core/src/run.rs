//! Descriptor for one compressed run in flight.

use crate::cache::{Inode, PageCache};
use crate::codec::Algorithm;
use crate::error::ErrorKind;
use crate::io::{BlockIo, DeviceId, IoRequest};
use crate::page::{PageBuf, PAGE_SHIFT, PAGE_SIZE, STRIDE_LEN};
use crate::stride::{EncodedRun, StrideCompressor};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Transfer direction of a run or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Disk to memory.
    Read,
    /// Memory to disk.
    Write,
}

/// Lifecycle state of a [`CompressedRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Descriptor built, no I/O issued yet.
    Created,
    /// At least one I/O unit has been issued and not all have completed.
    Pending,
    /// Every unit completed; the terminal action is running.
    Complete,
    /// Terminal action done and page buffers released.
    Released,
}

/// Result of a run's terminal action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A read run was decompressed into `pages` cache pages.
    Decompressed {
        /// Cache pages filled.
        pages: usize,
    },
    /// A write run reached the disk.
    Written,
    /// The run failed; for reads its target pages were marked errored.
    Failed(ErrorKind),
}

/// Where a run lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Device holding the run.
    pub device: DeviceId,
    /// First physical block of the run.
    pub block: u64,
}

#[derive(Debug)]
struct Status {
    state: RunState,
    outcome: Option<RunOutcome>,
}

/// One compressed run and the I/O that moves it.
///
/// The descriptor owns one page buffer slot per on-disk page. While a unit
/// is in flight its buffers are owned by the request and returned to their
/// slots on completion. `pending` counts issued units that have not yet
/// completed; the caller that brings it to zero runs the terminal action.
pub struct CompressedRun {
    inode: Weak<Inode>,
    ino: u64,
    mapping: Arc<dyn PageCache>,
    pub(crate) compressor: Arc<StrideCompressor>,
    direction: Direction,
    start_index: u64,
    target_pages: usize,
    algorithm: Algorithm,
    compressed_len: AtomicUsize,
    placement: Mutex<Option<Placement>>,
    pub(crate) slots: Mutex<Vec<Option<PageBuf>>>,
    claimed: AtomicU32,
    pub(crate) pending: AtomicUsize,
    pub(crate) failure: Mutex<Option<ErrorKind>>,
    status: Mutex<Status>,
    done: Condvar,
}

impl std::fmt::Debug for CompressedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedRun")
            .field("ino", &self.ino)
            .field("direction", &self.direction)
            .field("start_index", &self.start_index)
            .field("target_pages", &self.target_pages)
            .field("disk_pages", &self.disk_pages())
            .field("pending", &self.pending())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CompressedRun {
    fn new(
        inode: &Arc<Inode>,
        compressor: Arc<StrideCompressor>,
        direction: Direction,
        start_index: u64,
        target_pages: usize,
        slots: Vec<Option<PageBuf>>,
    ) -> Self {
        let algorithm = compressor.algorithm();
        Self {
            inode: Arc::downgrade(inode),
            ino: inode.ino(),
            mapping: Arc::clone(inode.mapping()),
            compressor,
            direction,
            start_index,
            target_pages,
            algorithm,
            compressed_len: AtomicUsize::new(0),
            placement: Mutex::new(None),
            slots: Mutex::new(slots),
            claimed: AtomicU32::new(0),
            pending: AtomicUsize::new(0),
            failure: Mutex::new(None),
            status: Mutex::new(Status { state: RunState::Created, outcome: None }),
            done: Condvar::new(),
        }
    }

    /// Build a read run for a compressed extent.
    ///
    /// `target_pages` logical pages starting at `start_index` are stored in
    /// `disk_pages` on-disk pages at `placement`. The slots start empty; the
    /// reader fills them with fresh buffers before issuing I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for sizes no run can have and
    /// [`Error::Allocation`] if the slot table cannot be allocated.
    pub fn for_read(
        inode: &Arc<Inode>,
        compressor: Arc<StrideCompressor>,
        start_index: u64,
        target_pages: usize,
        disk_pages: usize,
        placement: Placement,
    ) -> Result<Self> {
        if target_pages == 0 || target_pages > STRIDE_LEN {
            return Err(Error::InvalidInput(format!(
                "run must cover 1..={STRIDE_LEN} pages, got {target_pages}"
            )));
        }
        let max = compressor.max_run_pages(target_pages);
        if disk_pages == 0 || disk_pages > max {
            return Err(Error::InvalidInput(format!(
                "run of {target_pages} pages cannot occupy {disk_pages} disk pages (max {max})"
            )));
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(disk_pages).map_err(|_| Error::Allocation {
            what: "run slots",
            bytes: disk_pages * std::mem::size_of::<Option<PageBuf>>(),
        })?;
        slots.resize_with(disk_pages, || None);

        let run = Self::new(inode, compressor, Direction::Read, start_index, target_pages, slots);
        *run.placement.lock() = Some(placement);
        tracing::trace!(ino = run.ino, start_index, target_pages, disk_pages, "read run created");
        Ok(run)
    }

    pub(crate) fn for_write(
        inode: &Arc<Inode>,
        compressor: Arc<StrideCompressor>,
        start_index: u64,
        encoded: EncodedRun,
    ) -> Self {
        let target_pages = encoded.len.div_ceil(PAGE_SIZE);
        let slots = encoded.pages.into_iter().map(Some).collect();
        let run = Self::new(inode, compressor, Direction::Write, start_index, target_pages, slots);
        run.compressed_len.store(encoded.compressed_len, Ordering::Relaxed);
        run
    }

    /// Assign the on-disk location of an unissued run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] once I/O has been issued.
    pub fn place(&self, placement: Placement) -> Result<()> {
        if self.state() != RunState::Created {
            return Err(Error::InvalidInput("cannot move a run after issuing I/O".to_string()));
        }
        *self.placement.lock() = Some(placement);
        Ok(())
    }

    /// On-disk location, once placed.
    #[must_use]
    pub fn placement(&self) -> Option<Placement> {
        *self.placement.lock()
    }

    /// Account for one I/O unit about to be submitted.
    ///
    /// Must be called before the unit is handed to the transport so the
    /// pending count cannot reach zero while units remain unsubmitted.
    pub fn issue(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let mut status = self.status.lock();
        if status.state == RunState::Created {
            status.state = RunState::Pending;
        }
    }

    /// Allocate a fresh buffer for every empty slot of a read run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if any buffer cannot be allocated; the
    /// buffers already placed stay with the run until it is released.
    pub fn alloc_pages(&self) -> Result<()> {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut().filter(|s| s.is_none()) {
            *slot = Some(self.compressor.allocator().alloc_page()?);
        }
        Ok(())
    }

    /// Issue and submit I/O for every page of the run.
    ///
    /// All requests are built before any is issued, and every unit is
    /// counted as pending before the first submission, so the run either
    /// goes out whole or not at all. On failure the run is aborted and its
    /// target pages are failed. Returns the number of requests submitted.
    ///
    /// # Errors
    ///
    /// Returns the allocation or placement error that stopped submission.
    pub fn submit(self: &Arc<Self>, io: &dyn BlockIo, blkbits: u32) -> Result<usize> {
        let requests = match self.build_requests(io, blkbits) {
            Ok(requests) => requests,
            Err(e) => {
                tracing::warn!(ino = self.ino, start = self.start_index, error = %e, "run submission failed");
                self.abort(&e);
                return Err(e);
            }
        };
        for _ in &requests {
            self.issue();
        }
        let count = requests.len();
        tracing::debug!(
            ino = self.ino,
            start = self.start_index,
            direction = ?self.direction,
            disk_pages = self.disk_pages(),
            requests = count,
            "run submitted"
        );
        for request in requests {
            io.submit(request);
        }
        Ok(count)
    }

    fn build_requests(self: &Arc<Self>, io: &dyn BlockIo, blkbits: u32) -> Result<Vec<IoRequest>> {
        let placement = self
            .placement()
            .ok_or_else(|| Error::Internal("run submitted before placement".to_string()))?;
        if self.direction == Direction::Read {
            self.alloc_pages()?;
        }
        let blocks_per_page = 1u64 << (PAGE_SHIFT - blkbits);
        let sector_of = |slot: usize| (placement.block + slot as u64 * blocks_per_page) << (blkbits - 9);
        let max = io.max_pages_per_request(placement.device).max(1);
        let disk_pages = self.disk_pages();

        let mut requests = Vec::new();
        requests
            .try_reserve_exact(disk_pages.div_ceil(max))
            .map_err(|_| Error::Allocation { what: "run request list", bytes: disk_pages })?;
        let mut current: Option<IoRequest> = None;
        for slot in 0..disk_pages {
            let mut buf = self
                .take_page(slot)
                .ok_or_else(|| Error::Internal(format!("run page {slot} missing at submission")))?;
            loop {
                let mut req = match current.take() {
                    Some(req) => req,
                    None => IoRequest::for_run(Arc::clone(self), placement.device, sector_of(slot), max)?,
                };
                match req.add_run_page(slot, buf) {
                    Ok(()) => {
                        current = Some(req);
                        break;
                    }
                    Err(back) => {
                        buf = back;
                        requests.push(req);
                    }
                }
            }
        }
        requests.extend(current);
        Ok(requests)
    }

    /// Remove the buffer in `slot` so a request can own it.
    pub(crate) fn take_page(&self, slot: usize) -> Option<PageBuf> {
        self.slots.lock().get_mut(slot).and_then(Option::take)
    }

    /// Run `f` over the page slots.
    pub fn with_pages<R>(&self, f: impl FnOnce(&[Option<PageBuf>]) -> R) -> R {
        f(&self.slots.lock())
    }

    /// Record that the reader locked the cache page at `index` for this run.
    ///
    /// Returns `false` if the index lies outside the run.
    pub fn claim(&self, index: u64) -> bool {
        match self.slot_of(index) {
            Some(bit) => {
                self.claimed.fetch_or(1 << bit, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Whether the cache page at `index` was claimed for this run.
    #[must_use]
    pub fn is_claimed(&self, index: u64) -> bool {
        self.slot_of(index).is_some_and(|bit| self.claimed.load(Ordering::Acquire) & (1 << bit) != 0)
    }

    /// Number of claimed target pages.
    #[must_use]
    pub fn claimed_pages(&self) -> usize {
        self.claimed.load(Ordering::Acquire).count_ones() as usize
    }

    fn slot_of(&self, index: u64) -> Option<u32> {
        let offset = index.checked_sub(self.start_index)?;
        (offset < self.target_pages as u64).then_some(offset as u32)
    }

    /// Whether the run covers logical page `index`.
    #[must_use]
    pub fn covers(&self, index: u64) -> bool {
        self.slot_of(index).is_some()
    }

    /// Block until the terminal action has run and return its outcome.
    pub fn wait(&self) -> RunOutcome {
        let mut status = self.status.lock();
        loop {
            if let Some(outcome) = status.outcome {
                return outcome;
            }
            self.done.wait(&mut status);
        }
    }

    /// The outcome, if the run has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.status.lock().outcome
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.status.lock().state
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.status.lock().state = state;
    }

    pub(crate) fn publish(&self, outcome: RunOutcome) {
        let mut status = self.status.lock();
        status.state = RunState::Released;
        status.outcome = Some(outcome);
        drop(status);
        self.done.notify_all();
    }

    /// Issued units that have not completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether any unit of the run failed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// The owning inode, unless it has been dropped.
    #[must_use]
    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.inode.upgrade()
    }

    /// Page cache holding the target pages. Outlives the inode so claimed
    /// pages can still be released.
    pub(crate) fn mapping(&self) -> &Arc<dyn PageCache> {
        &self.mapping
    }

    /// Inode number of the owning file.
    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Transfer direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// First logical page index covered by the run.
    #[must_use]
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Logical pages covered by the run.
    #[must_use]
    pub fn target_pages(&self) -> usize {
        self.target_pages
    }

    /// Uncompressed length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.target_pages * PAGE_SIZE
    }

    /// Whether the run covers no data. Runs always cover at least one page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.target_pages == 0
    }

    /// On-disk pages.
    #[must_use]
    pub fn disk_pages(&self) -> usize {
        self.slots.lock().len()
    }

    /// Payload length from the header; zero for a read run until decoded.
    #[must_use]
    pub fn compressed_len(&self) -> usize {
        self.compressed_len.load(Ordering::Acquire)
    }

    pub(crate) fn set_compressed_len(&self, len: usize) {
        self.compressed_len.store(len, Ordering::Release);
    }

    /// Algorithm tag of the run.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemPageCache;
    use crate::stride::CompressorBuilder;
    use crate::CachePage;

    fn inode() -> Arc<Inode> {
        Inode::new(7, 16 * PAGE_SIZE as u64, Arc::new(MemPageCache::new()))
    }

    fn placement() -> Placement {
        Placement { device: DeviceId(0), block: 100 }
    }

    #[test]
    fn test_for_read_validates_sizes() {
        let inode = inode();
        let c = CompressorBuilder::new().build();
        assert!(CompressedRun::for_read(&inode, c.clone(), 0, 0, 1, placement()).is_err());
        assert!(CompressedRun::for_read(&inode, c.clone(), 0, 17, 1, placement()).is_err());
        assert!(CompressedRun::for_read(&inode, c.clone(), 0, 16, 0, placement()).is_err());
        assert!(CompressedRun::for_read(&inode, c.clone(), 0, 16, 18, placement()).is_err());

        let run = CompressedRun::for_read(&inode, c, 16, 16, 17, placement()).unwrap();
        assert_eq!(run.state(), RunState::Created);
        assert_eq!(run.disk_pages(), 17);
        assert_eq!(run.len(), 16 * PAGE_SIZE);
        assert_eq!(run.placement(), Some(placement()));
        assert_eq!(run.pending(), 0);
        assert!(run.with_pages(|slots| slots.iter().all(Option::is_none)));
    }

    #[test]
    fn test_claims() {
        let inode = inode();
        let c = CompressorBuilder::new().build();
        let run = CompressedRun::for_read(&inode, c, 16, 4, 1, placement()).unwrap();
        assert!(run.claim(17));
        assert!(!run.claim(20));
        assert!(!run.claim(15));
        assert!(run.is_claimed(17));
        assert!(!run.is_claimed(16));
        assert_eq!(run.claimed_pages(), 1);
        assert!(run.covers(19));
        assert!(!run.covers(20));
    }

    #[test]
    fn test_write_run_from_stride() {
        let inode = inode();
        let c = CompressorBuilder::new().build();
        let pages: Vec<_> = (0..3).map(|i| CachePage::with_contents(i, b"stride").unwrap()).collect();
        let run = c.compress_stride(&inode, 0, &pages).unwrap();
        assert_eq!(run.direction(), Direction::Write);
        assert_eq!(run.target_pages(), 3);
        assert_eq!(run.disk_pages(), 1);
        assert!(run.compressed_len() > 0);
        assert_eq!(run.placement(), None);
        assert_eq!(run.algorithm(), Algorithm::Lz4);

        run.place(placement()).unwrap();
        run.issue();
        assert_eq!(run.state(), RunState::Pending);
        assert!(run.place(placement()).is_err());
        assert!(run.take_page(0).is_some());
        assert!(run.take_page(0).is_none());
    }

    #[test]
    fn test_weak_inode() {
        let inode = inode();
        let c = CompressorBuilder::new().build();
        let run = CompressedRun::for_read(&inode, c, 0, 1, 1, placement()).unwrap();
        assert!(run.inode().is_some());
        drop(inode);
        assert!(run.inode().is_none());
        assert_eq!(run.ino(), 7);
    }
}
