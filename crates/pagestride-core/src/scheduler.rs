//! Batched page reads with read-ahead.
//!
//! Requested pages are read in batches of at most one stride. Each batch
//! ends at the first extent boundary, so a batch touches at most one
//! compressed run. Pages of uncompressed extents are read in place through
//! ordinary requests; pages of compressed extents are claimed by a run whose
//! I/O is issued once the batch is resolved.

use crate::cache::Inode;
use crate::io::BlockIo;
use crate::mapping::{BlockMapper, PageOutcome, ReadState};
use crate::page::{PageRef, STRIDE_LEN};
use crate::run::CompressedRun;
use crate::stride::StrideCompressor;
use crate::{Error, Result};
use std::sync::Arc;

/// Read scheduling options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadConfig {
    /// Extend short requests with read-ahead pages.
    pub readahead: bool,
    /// Pages resolved per batch, at most [`STRIDE_LEN`].
    pub batch_pages: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self { readahead: true, batch_pages: STRIDE_LEN }
    }
}

/// What a call to [`StrideReadScheduler::read_pages`] did.
#[derive(Debug, Clone, Default)]
pub struct ReadReport {
    /// Pages queued on ordinary requests.
    pub queued: usize,
    /// Pages claimed by compressed runs.
    pub in_runs: usize,
    /// Hole pages zero-filled without I/O.
    pub holes: usize,
    /// Pages read by the synchronous fallback.
    pub fallbacks: usize,
    /// Pages failed without I/O.
    pub failed: usize,
    /// Pages skipped because they were already cached.
    pub skipped: usize,
    /// Pages added by read-ahead.
    pub readahead: usize,
    /// Batches resolved.
    pub batches: usize,
    /// Ordinary requests submitted.
    pub requests: usize,
    /// Run requests submitted.
    pub run_requests: usize,
    /// Runs opened, in issue order.
    pub runs: Vec<Arc<CompressedRun>>,
}

impl ReadReport {
    fn record(&mut self, outcome: PageOutcome) {
        match outcome {
            PageOutcome::Queued => self.queued += 1,
            PageOutcome::InRun => self.in_runs += 1,
            PageOutcome::Hole => self.holes += 1,
            PageOutcome::Fallback(_) => self.fallbacks += 1,
            PageOutcome::Failed(_) => self.failed += 1,
        }
    }

    /// Block until every run opened by the read has finished.
    pub fn wait_runs(&self) {
        for run in &self.runs {
            run.wait();
        }
    }
}

/// Drives batched reads of a file's pages.
pub struct StrideReadScheduler {
    mapper: Arc<dyn BlockMapper>,
    io: Arc<dyn BlockIo>,
    compressor: Arc<StrideCompressor>,
    config: ReadConfig,
}

impl std::fmt::Debug for StrideReadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrideReadScheduler").field("config", &self.config).finish_non_exhaustive()
    }
}

impl StrideReadScheduler {
    /// Create a scheduler with default options.
    #[must_use]
    pub fn new(
        mapper: Arc<dyn BlockMapper>,
        io: Arc<dyn BlockIo>,
        compressor: Arc<StrideCompressor>,
    ) -> Self {
        Self::with_config(mapper, io, compressor, ReadConfig::default())
    }

    /// Create a scheduler with explicit options.
    #[must_use]
    pub fn with_config(
        mapper: Arc<dyn BlockMapper>,
        io: Arc<dyn BlockIo>,
        compressor: Arc<StrideCompressor>,
        config: ReadConfig,
    ) -> Self {
        let config = ReadConfig { batch_pages: config.batch_pages.clamp(1, STRIDE_LEN), ..config };
        Self { mapper, io, compressor, config }
    }

    /// Scheduling options.
    #[must_use]
    pub fn config(&self) -> ReadConfig {
        self.config
    }

    /// Read one page. The degenerate single-page batch.
    ///
    /// # Errors
    ///
    /// See [`Self::read_pages`].
    pub fn read_page(&self, inode: &Arc<Inode>, index: u64) -> Result<ReadReport> {
        self.read_pages(inode, &[index])
    }

    /// Start reads for the pages at `indices`.
    ///
    /// Indices are sorted and deduplicated. Pages already in the cache are
    /// skipped. Reads complete asynchronously: each page is unlocked when
    /// its data is in place or its read failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if no page at all could be allocated.
    pub fn read_pages(&self, inode: &Arc<Inode>, indices: &[u64]) -> Result<ReadReport> {
        let mut report = ReadReport::default();
        let mut wanted = indices.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let mapping = inode.mapping();
        let mut queue: Vec<PageRef> = Vec::new();
        let mut first_error = None;
        for index in wanted {
            if mapping.lookup(index).is_some() {
                report.skipped += 1;
                continue;
            }
            match mapping.alloc_page(index) {
                Ok(page) => queue.push(page),
                Err(e) => {
                    tracing::warn!(ino = inode.ino(), index, error = %e, "page allocation failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if queue.is_empty() {
            return match first_error {
                Some(e) => Err(e),
                None => Ok(report),
            };
        }
        let mut pos = 0;
        while pos < queue.len() {
            if self.config.readahead {
                report.readahead += self.readahead(inode, &mut queue, pos);
            }
            pos += self.read_batch(inode, &queue[pos..], &mut report);
        }
        tracing::debug!(
            ino = inode.ino(),
            queued = report.queued,
            in_runs = report.in_runs,
            holes = report.holes,
            fallbacks = report.fallbacks,
            batches = report.batches,
            "read pages scheduled"
        );
        Ok(report)
    }

    /// Extend `queue` with pages following its last index until the pages
    /// from `pos` on fill a stride, skipping cached pages and stopping at end
    /// of file. Returns the number of pages added.
    fn readahead(&self, inode: &Inode, queue: &mut Vec<PageRef>, pos: usize) -> usize {
        let (Some(end_index), Some(last)) = (inode.end_index(), queue.last().map(|p| p.index()))
        else {
            return 0;
        };
        let mapping = inode.mapping();
        let before = queue.len();
        let mut index = last + 1;
        while queue.len() - pos < STRIDE_LEN && index <= end_index {
            if mapping.lookup(index).is_none() {
                match mapping.alloc_page(index) {
                    Ok(page) => queue.push(page),
                    Err(e) => {
                        tracing::debug!(index, error = %e, "read-ahead stopped");
                        break;
                    }
                }
            }
            index += 1;
        }
        let added = queue.len() - before;
        if added > 0 {
            if let Some(marker) = queue.last() {
                marker.set_readahead();
            }
            tracing::trace!(ino = inode.ino(), added, end_index, "read-ahead");
        }
        added
    }

    /// Resolve one batch from the front of `pages` and issue its I/O.
    /// Returns the number of pages consumed.
    fn read_batch(&self, inode: &Arc<Inode>, pages: &[PageRef], report: &mut ReadReport) -> usize {
        let mapping = inode.mapping();
        let mut state = ReadState::new(inode, self.mapper.as_ref(), self.io.as_ref(), &self.compressor);
        let mut count = pages.len().min(self.config.batch_pages);
        let mut processed = 0;

        while processed < count {
            let page = &pages[processed];
            processed += 1;
            if !mapping.add_page(page) {
                tracing::trace!(index = page.index(), "page already cached, skipping");
                report.skipped += 1;
                continue;
            }
            report.record(state.read_page(page, count - processed + 1));

            if let Some(extent_end) = state.extent_end_index() {
                let within = pages[processed..count].iter().take_while(|p| p.index() < extent_end).count();
                count = count.min(processed + within).max(processed);
            }
        }

        let (requests, runs) = state.finish();
        report.requests += requests;
        report.batches += 1;
        for run in runs {
            match run.submit(self.io.as_ref(), inode.blkbits()) {
                Ok(n) => report.run_requests += n,
                Err(e) => tracing::warn!(start = run.start_index(), error = %e, "compressed run failed before I/O"),
            }
            report.runs.push(run);
        }
        processed
    }

    /// Read `count` pages starting at `start` and copy them out, waiting
    /// for every transfer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if any page could not be read.
    pub fn read_range(&self, inode: &Arc<Inode>, start: u64, count: usize) -> Result<Vec<u8>> {
        let indices: Vec<u64> = (start..start + count as u64).collect();
        let report = self.read_pages(inode, &indices)?;
        report.wait_runs();

        let mapping = inode.mapping();
        let mut out = Vec::with_capacity(count * crate::PAGE_SIZE);
        for index in indices {
            let page = mapping
                .lookup(index)
                .ok_or_else(|| Error::IoError(format!("page {index} evicted during read")))?;
            page.wait_unlocked();
            if !page.is_uptodate() {
                return Err(Error::IoError(format!("page {index} could not be read")));
            }
            page.with_data(|d| out.extend_from_slice(d));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::DeviceId;
    use crate::mem::{Extent, ExtentTree, MemDisk, MemPageCache};
    use crate::stride::CompressorBuilder;
    use crate::{PageCache, PAGE_SIZE};

    struct Env {
        cache: Arc<MemPageCache>,
        inode: Arc<Inode>,
        tree: Arc<ExtentTree>,
        disk: Arc<MemDisk>,
        scheduler: StrideReadScheduler,
    }

    fn env(size: u64, config: ReadConfig) -> Env {
        let cache = Arc::new(MemPageCache::new());
        let inode = Inode::new(1, size, cache.clone());
        let tree = Arc::new(ExtentTree::new(DeviceId(0)));
        let disk = Arc::new(MemDisk::new(64 * PAGE_SIZE));
        let scheduler = StrideReadScheduler::with_config(
            tree.clone(),
            disk.clone(),
            CompressorBuilder::new().build(),
            config,
        );
        Env { cache, inode, tree, disk, scheduler }
    }

    #[test]
    fn test_empty_request() {
        let e = env(PAGE_SIZE as u64, ReadConfig::default());
        let report = e.scheduler.read_pages(&e.inode, &[]).unwrap();
        assert_eq!(report.batches, 0);
    }

    #[test]
    fn test_readahead_fills_to_stride() {
        let e = env(40 * PAGE_SIZE as u64, ReadConfig::default());
        e.tree.insert(1, Extent::plain(0, 40, 0));
        let report = e.scheduler.read_page(&e.inode, 2).unwrap();
        assert_eq!(report.readahead, 15);
        assert_eq!(report.queued, 16);
        assert_eq!(e.cache.len(), 16);
        let marker = e.cache.lookup(17).unwrap();
        assert!(marker.flags().readahead);
        assert!(!e.cache.lookup(16).unwrap().flags().readahead);
    }

    #[test]
    fn test_readahead_skips_cached_pages() {
        let e = env(40 * PAGE_SIZE as u64, ReadConfig::default());
        e.tree.insert(1, Extent::plain(0, 40, 0));
        e.cache.insert(crate::CachePage::with_contents(3, b"cached").unwrap());
        let report = e.scheduler.read_page(&e.inode, 0).unwrap();
        assert_eq!(e.cache.lookup(3).unwrap().to_vec()[..6], *b"cached");
        // The cached page splits the first batch's request. Page 16 lies
        // beyond the first mapping, so the second batch starts with one page
        // and read-ahead grows it back to a full stride.
        assert_eq!(report.readahead, 30);
        assert!(e.cache.lookup(31).unwrap().flags().readahead);
        assert!(e.cache.lookup(32).is_none());
        assert_eq!(report.batches, 2);
        assert_eq!(report.requests, 3);
    }

    #[test]
    fn test_readahead_refills_each_batch() {
        let e = env(40 * PAGE_SIZE as u64, ReadConfig::default());
        e.tree.insert(1, Extent::plain(0, 40, 0));
        let report = e.scheduler.read_pages(&e.inode, &(0..17).collect::<Vec<_>>()).unwrap();
        assert_eq!(report.readahead, 15);
        assert_eq!(report.batches, 2);
        assert_eq!(e.cache.len(), 32);
        assert!(e.cache.lookup(31).unwrap().flags().readahead);
        assert!(e.cache.lookup(32).is_none());
    }

    #[test]
    fn test_no_readahead_when_disabled() {
        let e = env(40 * PAGE_SIZE as u64, ReadConfig { readahead: false, ..ReadConfig::default() });
        let report = e.scheduler.read_page(&e.inode, 0).unwrap();
        assert_eq!(report.readahead, 0);
        assert_eq!(report.holes, 1);
        assert_eq!(e.cache.len(), 1);
    }

    #[test]
    fn test_extent_clamp_splits_batches() {
        let e = env(8 * PAGE_SIZE as u64, ReadConfig { readahead: false, ..ReadConfig::default() });
        e.tree.insert(1, Extent::plain(0, 3, 10));
        e.tree.insert(1, Extent::plain(3, 5, 30));
        let report = e.scheduler.read_pages(&e.inode, &(0..8).collect::<Vec<_>>()).unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(report.queued, 8);
        assert_eq!(report.requests, 2);
    }

    #[test]
    fn test_skips_resident_pages() {
        let e = env(4 * PAGE_SIZE as u64, ReadConfig { readahead: false, ..ReadConfig::default() });
        e.cache.insert(crate::CachePage::with_contents(1, b"x").unwrap());
        let report = e.scheduler.read_pages(&e.inode, &[0, 1, 1, 2]).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.holes, 2);
    }

    #[test]
    fn test_read_range_plain_extent() {
        let e = env(3 * PAGE_SIZE as u64, ReadConfig::default());
        e.tree.insert(1, Extent::plain(0, 3, 5));
        let data: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i / 7) as u8).collect();
        e.disk.write_at(5 * PAGE_SIZE as u64, &data).unwrap();
        assert_eq!(e.scheduler.read_range(&e.inode, 0, 3).unwrap(), data);
        assert_eq!(e.disk.requests_submitted(), 1);
    }

    #[test]
    fn test_read_range_reports_io_error() {
        let e = env(2 * PAGE_SIZE as u64, ReadConfig::default());
        e.tree.insert(1, Extent::plain(0, 2, 0));
        e.disk.inject_fault(0..1);
        assert!(e.scheduler.read_range(&e.inode, 0, 2).is_err());
    }
}
