//! Block mapping and per-page read resolution.
//!
//! [`ReadState`] walks the pages of one read batch. Each page is resolved
//! against the file's extents and ends up in one of four places: an ordinary
//! request that reads the page in place, the compressed run covering its
//! extent, a zero-filled hole, or the synchronous single-page fallback.

use crate::cache::Inode;
use crate::error::Confusion;
use crate::io::{BlockIo, DeviceId, IoRequest, SECTOR_SIZE};
use crate::page::{PageBuf, PageRef, PAGE_SHIFT, PAGE_SIZE, STRIDE_LEN};
use crate::run::{CompressedRun, Placement};
use crate::stride::StrideCompressor;
use crate::{Error, ErrorKind, Result};
use std::sync::Arc;

/// Most blocks a page can span (512-byte blocks in a 4 KiB page).
const MAX_BLOCKS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// What the mapper should do for an unmapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Report the existing mapping; holes stay holes.
    Lookup,
    /// Allocate a new extent for the range.
    Create {
        /// On-disk blocks for a compressed run, or `None` for a plain extent
        /// with one physical block per logical block.
        disk_blocks: Option<u64>,
    },
}

/// One contiguous mapping returned by a [`BlockMapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// First logical block covered.
    pub logical: u64,
    /// Logical blocks covered.
    pub len: u64,
    /// Device holding the blocks.
    pub device: DeviceId,
    /// Physical block backing `logical`; meaningless for holes.
    pub physical: u64,
    /// Whether the range is backed by disk.
    pub mapped: bool,
    /// The mapper already holds current data for the range.
    pub uptodate: bool,
    /// The next block after this mapping needs extra lookups to reach;
    /// pending reads should be submitted first.
    pub boundary: bool,
    /// On-disk blocks of the compressed run stored for this extent.
    pub disk_blocks: Option<u64>,
}

impl Mapping {
    /// An unmapped range.
    #[must_use]
    pub fn hole(logical: u64, len: u64) -> Self {
        Self {
            logical,
            len: len.max(1),
            device: DeviceId::default(),
            physical: 0,
            mapped: false,
            uptodate: false,
            boundary: false,
            disk_blocks: None,
        }
    }

    /// One past the last logical block.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.logical + self.len
    }

    /// Whether `block` falls inside the mapping.
    #[must_use]
    pub fn contains(&self, block: u64) -> bool {
        (self.logical..self.end()).contains(&block)
    }

    /// Whether the extent holds a compressed run.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.mapped && self.disk_blocks.is_some()
    }

    /// Physical block backing logical `block` of a plain extent.
    #[must_use]
    pub fn physical_for(&self, block: u64) -> u64 {
        self.physical + (block - self.logical)
    }
}

/// Resolves logical file blocks to physical blocks.
pub trait BlockMapper: Send + Sync {
    /// Map the range starting at `logical`.
    ///
    /// The result always contains `logical`. Plain extents and holes start
    /// at `logical` and cover at most `max_blocks` blocks. A compressed
    /// extent is returned whole, starting at its first block, since its run
    /// can only be read in one piece.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mapping`] when the lookup or allocation fails.
    fn map_blocks(&self, inode: &Inode, logical: u64, max_blocks: u64, mode: MapMode) -> Result<Mapping>;
}

/// Where a page went after [`ReadState::read_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Attached to an ordinary read request.
    Queued,
    /// Claimed by the compressed run covering its extent.
    InRun,
    /// Entirely a hole: zero-filled and up to date without I/O.
    Hole,
    /// Read synchronously on its own.
    Fallback(Confusion),
    /// Marked errored without I/O.
    Failed(ErrorKind),
}

/// State threaded across the pages of one read batch.
pub struct ReadState<'a> {
    inode: &'a Arc<Inode>,
    mapper: &'a dyn BlockMapper,
    io: &'a dyn BlockIo,
    compressor: &'a Arc<StrideCompressor>,
    request: Option<IoRequest>,
    last_block_in_request: u64,
    mapping: Option<Mapping>,
    extent_end: Option<u64>,
    run: Option<Arc<CompressedRun>>,
    ready: Vec<Arc<CompressedRun>>,
    requests: usize,
}

impl<'a> ReadState<'a> {
    /// Start a batch for `inode`.
    pub fn new(
        inode: &'a Arc<Inode>,
        mapper: &'a dyn BlockMapper,
        io: &'a dyn BlockIo,
        compressor: &'a Arc<StrideCompressor>,
    ) -> Self {
        Self {
            inode,
            mapper,
            io,
            compressor,
            request: None,
            last_block_in_request: 0,
            mapping: None,
            extent_end: None,
            run: None,
            ready: Vec::new(),
            requests: 0,
        }
    }

    /// Logical page index one past the most recently resolved extent.
    #[must_use]
    pub fn extent_end_index(&self) -> Option<u64> {
        let shift = PAGE_SHIFT - self.inode.blkbits();
        self.extent_end.map(|end| end.div_ceil(1 << shift))
    }

    /// Ordinary requests submitted so far.
    #[must_use]
    pub fn requests_submitted(&self) -> usize {
        self.requests
    }

    /// Resolve one locked, not up-to-date page.
    ///
    /// `nr_pages` is the number of batch pages left, this one included; it
    /// bounds how far ahead the mapper is asked to look.
    pub fn read_page(&mut self, page: &PageRef, nr_pages: usize) -> PageOutcome {
        match self.map_page(page, nr_pages) {
            Ok(outcome) => outcome,
            Err(Resolve::Confused(reason)) => {
                tracing::debug!(
                    ino = self.inode.ino(),
                    index = page.index(),
                    %reason,
                    "falling back to single page read"
                );
                self.submit_request();
                if let Err(e) = self.read_full_page(page) {
                    tracing::warn!(index = page.index(), error = %e, "synchronous page read failed");
                }
                PageOutcome::Fallback(reason)
            }
            Err(Resolve::Failed(e)) => {
                tracing::warn!(ino = self.inode.ino(), index = page.index(), error = %e, "page read failed");
                page.set_error();
                page.unlock();
                PageOutcome::Failed(e.kind())
            }
        }
    }

    fn map_page(&mut self, page: &PageRef, nr_pages: usize) -> std::result::Result<PageOutcome, Resolve> {
        if page.flags().has_buffers {
            return Err(Resolve::Confused(Confusion::BufferedPage));
        }
        let blkbits = self.inode.blkbits();
        let bpp = self.inode.blocks_per_page() as usize;
        let mut block_in_file = page.index() << (PAGE_SHIFT - blkbits);
        let last_block =
            (block_in_file + nr_pages as u64 * bpp as u64).min(self.inode.last_block_in_file());

        let mut blocks = [0u64; MAX_BLOCKS_PER_PAGE];
        let mut page_block = 0;
        let mut first_hole = bpp;
        let mut fully_mapped = true;
        let mut device = DeviceId::default();
        let mut boundary = false;
        let mut current: Option<Mapping> = None;

        while page_block < bpp {
            let reused = self.mapping.filter(|m| m.contains(block_in_file));
            let local = current.filter(|m| m.contains(block_in_file));
            let (mapping, fresh) = match reused.or(local) {
                Some(m) => {
                    self.extent_end = Some(m.end());
                    (m, false)
                }
                None if block_in_file < last_block => {
                    let m = self
                        .mapper
                        .map_blocks(self.inode, block_in_file, last_block - block_in_file, MapMode::Lookup)
                        .map_err(|e| {
                            tracing::debug!(block = block_in_file, error = %e, "block mapping failed");
                            Resolve::Confused(Confusion::MappingFailed)
                        })?;
                    if !m.contains(block_in_file) {
                        tracing::warn!(block = block_in_file, ?m, "mapper returned a foreign range");
                        return Err(Resolve::Confused(Confusion::MappingFailed));
                    }
                    self.extent_end = Some(m.end());
                    (m, true)
                }
                None => (Mapping::hole(block_in_file, 1), false),
            };
            current = Some(mapping);
            if mapping.mapped {
                self.mapping = Some(mapping);
            }

            if !mapping.mapped {
                fully_mapped = false;
                if first_hole == bpp {
                    first_hole = page_block;
                }
                page_block += 1;
                block_in_file += 1;
                continue;
            }

            if mapping.is_compressed() {
                if page_block != 0 || mapping.logical % bpp as u64 != 0 {
                    return Err(Resolve::Confused(Confusion::NonContiguous));
                }
                return self.attach_to_run(page, &mapping, fresh);
            }

            if mapping.uptodate {
                if bpp == 1 {
                    page.set_uptodate();
                } else {
                    page.set_has_buffers();
                }
                return Err(Resolve::Confused(Confusion::AlreadyUptodate));
            }
            if first_hole != bpp {
                return Err(Resolve::Confused(Confusion::HoleBeforeData));
            }
            let physical = mapping.physical_for(block_in_file);
            if page_block > 0 && (blocks[page_block - 1] + 1 != physical || device != mapping.device) {
                return Err(Resolve::Confused(Confusion::NonContiguous));
            }
            device = mapping.device;
            while page_block < bpp && block_in_file < mapping.end() {
                blocks[page_block] = mapping.physical_for(block_in_file);
                page_block += 1;
                block_in_file += 1;
            }
            boundary = mapping.boundary && block_in_file == mapping.end();
        }

        if first_hole != bpp {
            page.zero_from(first_hole << blkbits);
            if first_hole == 0 {
                page.set_uptodate();
                page.unlock();
                return Ok(PageOutcome::Hole);
            }
        } else if fully_mapped {
            page.set_mapped_to_disk();
        }

        self.queue_page(page, device, &blocks[..page_block.min(first_hole)], first_hole << blkbits)
            .map_err(Resolve::Failed)?;
        if boundary || first_hole != bpp {
            self.submit_request();
        } else {
            self.last_block_in_request = blocks[bpp - 1];
        }
        Ok(PageOutcome::Queued)
    }

    fn queue_page(&mut self, page: &PageRef, device: DeviceId, blocks: &[u64], len: usize) -> Result<()> {
        let first = blocks[0];
        if let Some(req) = &self.request {
            if req.device() != device || self.last_block_in_request + 1 != first {
                self.submit_request();
            }
        }
        loop {
            let mut req = match self.request.take() {
                Some(req) => req,
                None => {
                    let sector = first << (self.inode.blkbits() - 9);
                    let max = self.io.max_pages_per_request(device);
                    IoRequest::read_cache(device, sector, max)?
                }
            };
            let added = req.add_cache_page(Arc::clone(page), len);
            self.request = Some(req);
            if added {
                return Ok(());
            }
            self.submit_request();
        }
    }

    fn attach_to_run(
        &mut self,
        page: &PageRef,
        mapping: &Mapping,
        fresh: bool,
    ) -> std::result::Result<PageOutcome, Resolve> {
        let index = page.index();
        if let Some(run) = &self.run {
            if run.covers(index) {
                run.claim(index);
                return Ok(PageOutcome::InRun);
            }
            if let Some(done) = self.run.take() {
                self.ready.push(done);
            }
        }

        let shift = PAGE_SHIFT - self.inode.blkbits();
        let bpp = self.inode.blocks_per_page();
        let start_index = mapping.logical >> shift;
        let target_pages = mapping.len.div_ceil(bpp) as usize;
        let disk_pages = mapping.disk_blocks.unwrap_or(0).div_ceil(bpp) as usize;
        if target_pages > STRIDE_LEN {
            tracing::warn!(?mapping, "compressed extent longer than a stride");
            return Err(Resolve::Confused(Confusion::MappingFailed));
        }
        let placement = Placement { device: mapping.device, block: mapping.physical };
        let run = CompressedRun::for_read(
            self.inode,
            Arc::clone(self.compressor),
            start_index,
            target_pages,
            disk_pages,
            placement,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::Allocation => Resolve::Failed(e),
            _ => Resolve::Confused(Confusion::MappingFailed),
        })?;
        run.claim(index);
        tracing::debug!(ino = self.inode.ino(), start_index, target_pages, disk_pages, fresh, "compressed run opened");
        self.run = Some(Arc::new(run));
        Ok(PageOutcome::InRun)
    }

    fn submit_request(&mut self) {
        if let Some(req) = self.request.take() {
            tracing::trace!(sector = req.sector(), pages = req.page_count(), "submitting read");
            self.requests += 1;
            self.io.submit(req);
        }
    }

    /// Submit the pending ordinary request and hand back the runs opened
    /// during the batch, not yet issued.
    pub fn finish(mut self) -> (usize, Vec<Arc<CompressedRun>>) {
        self.submit_request();
        let mut runs = std::mem::take(&mut self.ready);
        runs.extend(self.run.take());
        (self.requests, runs)
    }

    /// Read one locked page synchronously, block by block.
    ///
    /// Holes are zero-filled. A page inside a compressed extent is produced
    /// by reading and decoding the whole run. The page is unlocked on every
    /// path and marked errored on failure.
    ///
    /// # Errors
    ///
    /// Returns the mapping, I/O or codec error that failed the page.
    pub fn read_full_page(&self, page: &PageRef) -> Result<()> {
        if page.is_uptodate() {
            page.unlock();
            return Ok(());
        }
        let result = self.fill_page_sync(page);
        match &result {
            Ok(()) => page.set_uptodate(),
            Err(_) => page.set_error(),
        }
        page.unlock();
        result
    }

    fn fill_page_sync(&self, page: &PageRef) -> Result<()> {
        let blkbits = self.inode.blkbits();
        let blocksize = 1usize << blkbits;
        let bpp = self.inode.blocks_per_page();
        let first = page.index() << (PAGE_SHIFT - blkbits);
        let last_block_in_file = self.inode.last_block_in_file();

        let mut block = first;
        while block < first + bpp {
            let offset = (block - first) as usize * blocksize;
            if block >= last_block_in_file {
                page.zero_from(offset);
                break;
            }
            let mapping = self.mapper.map_blocks(self.inode, block, first + bpp - block, MapMode::Lookup)?;
            if !mapping.contains(block) {
                return Err(Error::Mapping { block, reason: "mapper returned a foreign range".to_string() });
            }
            let span = (mapping.end().min(first + bpp) - block) as usize;
            if !mapping.mapped {
                page.with_data_mut(|d| d[offset..offset + span * blocksize].fill(0));
            } else if mapping.is_compressed() {
                return self.fill_from_run(page, &mapping);
            } else if !mapping.uptodate {
                let sector = mapping.physical_for(block) << (blkbits - 9);
                page.with_data_mut(|d| {
                    self.io.read_sync(mapping.device, sector, &mut d[offset..offset + span * blocksize])
                })?;
            }
            block += span as u64;
        }
        Ok(())
    }

    fn fill_from_run(&self, page: &PageRef, mapping: &Mapping) -> Result<()> {
        let blkbits = self.inode.blkbits();
        let bpp = self.inode.blocks_per_page();
        let start_index = mapping.logical >> (PAGE_SHIFT - blkbits);
        let target_pages = mapping.len.div_ceil(bpp) as usize;
        let disk_pages = mapping.disk_blocks.unwrap_or(0).div_ceil(bpp) as usize;
        if target_pages > STRIDE_LEN || disk_pages > self.compressor.max_run_pages(target_pages.max(1)) {
            return Err(Error::Mapping {
                block: mapping.logical,
                reason: format!("{target_pages}-page run cannot span {disk_pages} disk pages"),
            });
        }

        let mut pages: Vec<PageBuf> = Vec::new();
        for i in 0..disk_pages as u64 {
            let mut buf = self.compressor.allocator().alloc_page()?;
            let sector = (mapping.physical + i * bpp) << (blkbits - 9);
            self.io.read_sync(mapping.device, sector, buf.as_mut_slice())?;
            buf.mark_io(true);
            pages.push(buf);
        }
        let data = self.compressor.decode_run(&pages, target_pages * PAGE_SIZE)?;
        let slot = (page.index() - start_index) as usize;
        page.fill_uptodate(&data[slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE]);
        tracing::debug!(index = page.index(), start_index, "page decoded from run synchronously");
        Ok(())
    }
}

enum Resolve {
    Confused(Confusion),
    Failed(Error),
}
