//! Compressed write-back of cached pages.

use crate::cache::Inode;
use crate::io::BlockIo;
use crate::mapping::{BlockMapper, MapMode};
use crate::page::{PageRef, PAGE_SHIFT, STRIDE_LEN};
use crate::run::{CompressedRun, Placement, RunOutcome};
use crate::stride::StrideCompressor;
use crate::{Error, Result};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;

/// Totals for one [`StrideWriter::writeback_range`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritebackSummary {
    /// Strides written successfully.
    pub strides: usize,
    /// Pages covered by those strides.
    pub pages: usize,
    /// On-disk pages written.
    pub disk_pages: usize,
    /// Strides whose compression, allocation or I/O failed.
    pub failed: usize,
    /// Dirty stride windows skipped because some of their pages were not
    /// cached.
    pub skipped: usize,
}

/// Writes strides of cached pages as compressed runs.
pub struct StrideWriter {
    compressor: Arc<StrideCompressor>,
    mapper: Arc<dyn BlockMapper>,
    io: Arc<dyn BlockIo>,
}

impl StrideWriter {
    /// Create a writer.
    #[must_use]
    pub fn new(
        compressor: Arc<StrideCompressor>,
        mapper: Arc<dyn BlockMapper>,
        io: Arc<dyn BlockIo>,
    ) -> Self {
        Self { compressor, mapper, io }
    }

    /// Compress `pages`, allocate a placement and submit the writes.
    ///
    /// The pages must be consecutive and lie within one stride-aligned
    /// window. The returned run completes asynchronously; see
    /// [`CompressedRun::wait`].
    ///
    /// # Errors
    ///
    /// Returns an error if the stride is malformed or compression, extent
    /// allocation or request allocation fails.
    pub fn write_stride(&self, inode: &Arc<Inode>, pages: &[PageRef]) -> Result<Arc<CompressedRun>> {
        let start = check_window(pages)?;
        let run = self.compressor.compress_stride(inode, start, pages)?;
        self.place_and_submit(inode, run, pages)
    }

    /// Write several independent strides, compressing them in parallel.
    ///
    /// Placement and submission happen in input order once compression is
    /// done. Each stride succeeds or fails on its own.
    pub fn write_strides(
        &self,
        inode: &Arc<Inode>,
        strides: &[Vec<PageRef>],
    ) -> Vec<Result<Arc<CompressedRun>>> {
        let compressed: Vec<Result<CompressedRun>> = strides
            .par_iter()
            .map(|pages| {
                let start = check_window(pages)?;
                self.compressor.compress_stride(inode, start, pages)
            })
            .collect();

        compressed
            .into_iter()
            .zip(strides)
            .map(|(run, pages)| self.place_and_submit(inode, run?, pages))
            .collect()
    }

    fn place_and_submit(
        &self,
        inode: &Arc<Inode>,
        run: CompressedRun,
        pages: &[PageRef],
    ) -> Result<Arc<CompressedRun>> {
        let bpp = inode.blocks_per_page();
        let logical = run.start_index() << (PAGE_SHIFT - inode.blkbits());
        let mapping = self.mapper.map_blocks(
            inode,
            logical,
            run.target_pages() as u64 * bpp,
            MapMode::Create { disk_blocks: Some(run.disk_pages() as u64 * bpp) },
        )?;
        run.place(Placement { device: mapping.device, block: mapping.physical })?;
        for page in pages {
            page.clear_dirty();
        }

        let run = Arc::new(run);
        if let Err(e) = run.submit(self.io.as_ref(), inode.blkbits()) {
            pages.iter().for_each(|p| p.set_dirty());
            return Err(e);
        }
        Ok(run)
    }

    /// Write every dirty stride window of `range` and wait for the writes.
    ///
    /// A window is the stride-aligned group of pages containing a dirty
    /// page, cut at end of file. It is written whole; a window with any
    /// page missing from the cache is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty or reversed range.
    pub fn writeback_range(&self, inode: &Arc<Inode>, range: Range<u64>) -> Result<WritebackSummary> {
        if range.is_empty() {
            return Err(Error::InvalidInput(format!("empty writeback range {range:?}")));
        }
        let mut summary = WritebackSummary::default();
        let Some(end_index) = inode.end_index() else {
            return Ok(summary);
        };
        let mapping = inode.mapping();
        let stride = STRIDE_LEN as u64;

        let mut strides = Vec::new();
        let mut window = range.start - range.start % stride;
        while window < range.end && window <= end_index {
            let window_end = (window + stride).min(end_index + 1);
            let pages = mapping.find_contig(window, (window_end - window) as usize);
            let dirty = pages.iter().any(|p| p.flags().dirty);
            if pages.len() as u64 == window_end - window {
                if dirty {
                    strides.push(pages);
                }
            } else if dirty || (window..window_end).any(|i| mapping.lookup(i).is_some_and(|p| p.flags().dirty)) {
                tracing::warn!(ino = inode.ino(), window, "dirty window not fully cached, skipping");
                summary.skipped += 1;
            }
            window += stride;
        }

        for (result, pages) in self.write_strides(inode, &strides).into_iter().zip(&strides) {
            let outcome = result.map(|run| (run.wait(), run.disk_pages()));
            match outcome {
                Ok((RunOutcome::Written, disk_pages)) => {
                    summary.strides += 1;
                    summary.pages += pages.len();
                    summary.disk_pages += disk_pages;
                }
                Ok((outcome, _)) => {
                    tracing::warn!(ino = inode.ino(), start = pages[0].index(), ?outcome, "stride write failed");
                    pages.iter().for_each(|p| p.set_dirty());
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(ino = inode.ino(), start = pages[0].index(), error = %e, "stride write failed");
                    pages.iter().for_each(|p| p.set_dirty());
                    summary.failed += 1;
                }
            }
        }
        tracing::info!(
            ino = inode.ino(),
            strides = summary.strides,
            pages = summary.pages,
            disk_pages = summary.disk_pages,
            failed = summary.failed,
            "writeback complete"
        );
        Ok(summary)
    }
}

/// Validate a stride's page list, returning its first index.
fn check_window(pages: &[PageRef]) -> Result<u64> {
    let (Some(first), Some(last)) = (pages.first(), pages.last()) else {
        return Err(Error::InvalidInput("empty stride".to_string()));
    };
    let stride = STRIDE_LEN as u64;
    if first.index() / stride != last.index() / stride {
        return Err(Error::InvalidInput(format!(
            "pages {}..={} cross a stride boundary",
            first.index(),
            last.index()
        )));
    }
    Ok(first.index())
}
