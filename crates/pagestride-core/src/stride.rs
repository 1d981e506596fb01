//! Stride compression and decompression.
//!
//! A stride of up to [`STRIDE_LEN`] pages is compressed into a run of whole
//! pages with this layout:
//!
//! ```text
//! page 0                      page 1 ..            page n-1
//! +------+------------------+ +-----------------+ +------------+---------+
//! | len  | payload ...      | | payload ...     | | payload    | zeroes  |
//! +------+------------------+ +-----------------+ +------------+---------+
//!  4 bytes little-endian u32
//! ```
//!
//! `n = ceil((len + 4) / PAGE_SIZE)`. The header is the only source of the
//! payload length; the page count alone cannot recover it.

use crate::cache::Inode;
use crate::codec::{Algorithm, Codec};
use crate::page::{HeapAllocator, PageAllocator, PageBuf, PageRef, LENGTH_HEADER_LEN, PAGE_SIZE, STRIDE_LEN};
use crate::run::CompressedRun;
use crate::stats::{CompressionStats, CompressorStats};
use crate::workspace::Workspace;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Instant;

/// Maximum number of pages fetched by one page-cache lookup while
/// distributing a decompressed stride.
pub const LOOKUP_BATCH: usize = 16;

/// How the tail of a compressed run was padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Zero padding up to the next page boundary.
    PageBoundary,
    /// The payload expanded; the staging buffer was zeroed out to the
    /// codec's worst-case size.
    WorstCase,
}

/// A framed compressed run that is not attached to any file.
#[derive(Debug)]
pub struct EncodedRun {
    /// On-disk pages: header, payload and padding.
    pub pages: Vec<PageBuf>,
    /// Payload length recorded in the header.
    pub compressed_len: usize,
    /// Uncompressed input length.
    pub len: usize,
    /// Padding strategy that was applied.
    pub padding: Padding,
}

/// Number of on-disk pages for a payload of `compressed_len` bytes.
#[must_use]
pub fn run_pages(compressed_len: usize) -> usize {
    (compressed_len + LENGTH_HEADER_LEN).div_ceil(PAGE_SIZE)
}

/// Read the payload length from the first page of a run.
///
/// # Errors
///
/// Returns [`Error::CorruptedData`] if the page is shorter than the header.
pub fn read_length_header(first_page: &[u8]) -> Result<usize> {
    let header: [u8; LENGTH_HEADER_LEN] = first_page
        .get(..LENGTH_HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| Error::CorruptedData("run shorter than length header".to_string()))?;
    Ok(u32::from_le_bytes(header) as usize)
}

/// Builder for configuring a stride compressor.
pub struct CompressorBuilder {
    algorithm: Algorithm,
    codec: Option<Box<dyn Codec>>,
    allocator: Arc<dyn PageAllocator>,
}

impl Default for CompressorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressorBuilder {
    /// Create a new compressor builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self { algorithm: Algorithm::default(), codec: None, allocator: Arc::new(HeapAllocator) }
    }

    /// Set the compression algorithm.
    #[must_use]
    pub fn algorithm(mut self, algo: Algorithm) -> Self {
        self.algorithm = algo;
        self
    }

    /// Use a custom codec instead of a built-in algorithm.
    #[must_use]
    pub fn codec(mut self, codec: Box<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Allocate run pages from `allocator`.
    #[must_use]
    pub fn allocator(mut self, allocator: Arc<dyn PageAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Build the compressor.
    #[must_use]
    pub fn build(self) -> Arc<StrideCompressor> {
        let codec = self.codec.unwrap_or_else(|| self.algorithm.codec());
        Arc::new(StrideCompressor {
            codec,
            allocator: self.allocator,
            stats: CompressorStats::default(),
        })
    }
}

/// Compresses strides into framed runs and decompresses runs back into the
/// page cache.
pub struct StrideCompressor {
    codec: Box<dyn Codec>,
    allocator: Arc<dyn PageAllocator>,
    stats: CompressorStats,
}

impl std::fmt::Debug for StrideCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrideCompressor")
            .field("algorithm", &self.codec.algorithm())
            .finish_non_exhaustive()
    }
}

impl StrideCompressor {
    /// Algorithm used by the codec.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.codec.algorithm()
    }

    /// The run page allocator.
    #[must_use]
    pub fn allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    /// Allocate a workspace for `stride_pages` pages.
    ///
    /// # Errors
    ///
    /// See [`Workspace::new`].
    pub fn workspace(&self, stride_pages: usize) -> Result<Workspace> {
        Workspace::new(self.codec.as_ref(), stride_pages)
    }

    /// Get compression statistics.
    #[must_use]
    pub fn stats(&self) -> CompressionStats {
        self.stats.snapshot()
    }

    /// Reset statistics.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Compress the cache pages of one stride into an unplaced write run.
    ///
    /// `pages` must hold 1..=16 pages with consecutive indices starting at
    /// `start_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stride is malformed, the codec rejects the
    /// data or memory cannot be allocated. Nothing is produced on error.
    pub fn compress_stride(
        self: &Arc<Self>,
        inode: &Arc<Inode>,
        start_index: u64,
        pages: &[PageRef],
    ) -> Result<CompressedRun> {
        if pages.is_empty() || pages.len() > STRIDE_LEN {
            return Err(Error::InvalidInput(format!(
                "stride must hold 1..={STRIDE_LEN} pages, got {}",
                pages.len()
            )));
        }
        if let Some((i, page)) =
            pages.iter().enumerate().find(|(i, p)| p.index() != start_index + *i as u64)
        {
            return Err(Error::InvalidInput(format!(
                "page {} at stride slot {i} breaks the run starting at {start_index}",
                page.index()
            )));
        }

        let mut ws = self.workspace(pages.len())?;
        for (i, page) in pages.iter().enumerate() {
            page.with_data(|data| {
                ws.decompressed[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].copy_from_slice(data);
            });
        }
        let encoded = self.encode(&mut ws, pages.len() * PAGE_SIZE)?;

        tracing::debug!(
            ino = inode.ino(),
            start_index,
            len = encoded.len,
            compressed_len = encoded.compressed_len,
            disk_pages = encoded.pages.len(),
            "stride compressed"
        );
        Ok(CompressedRun::for_write(inode, Arc::clone(self), start_index, encoded))
    }

    /// Compress up to one stride of raw bytes into a framed run.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty or larger than a stride, if the
    /// codec fails or if memory cannot be allocated.
    pub fn compress_bytes(&self, data: &[u8]) -> Result<EncodedRun> {
        if data.is_empty() || data.len() > STRIDE_LEN * PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "stride data must hold 1..={} bytes, got {}",
                STRIDE_LEN * PAGE_SIZE,
                data.len()
            )));
        }
        let mut ws = self.workspace(data.len().div_ceil(PAGE_SIZE))?;
        ws.decompressed[..data.len()].copy_from_slice(data);
        self.encode(&mut ws, data.len())
    }

    /// Compress `ws.decompressed[..in_len]` and frame it into fresh pages.
    fn encode(&self, ws: &mut Workspace, in_len: usize) -> Result<EncodedRun> {
        let start = Instant::now();
        let bound = self.codec.worst_case_len(in_len);

        let Workspace { memory, compressed, decompressed, .. } = ws;
        let payload = compressed
            .get_mut(LENGTH_HEADER_LEN..LENGTH_HEADER_LEN + bound)
            .ok_or_else(|| Error::Internal("staging buffer smaller than worst case".to_string()))?;
        let compressed_len = self.codec.compress(&decompressed[..in_len], payload, memory)?;
        let header = u32::try_from(compressed_len).map_err(|_| {
            Error::CorruptedData(format!("compressed length {compressed_len} overflows header"))
        })?;

        let framed = LENGTH_HEADER_LEN + compressed_len;
        let nr_pages = run_pages(compressed_len);
        let padding = if compressed_len > in_len {
            let cap = compressed.len();
            let worst = (LENGTH_HEADER_LEN + bound).div_ceil(PAGE_SIZE) * PAGE_SIZE;
            compressed[framed..worst.min(cap)].fill(0);
            Padding::WorstCase
        } else {
            compressed[framed..nr_pages * PAGE_SIZE].fill(0);
            Padding::PageBoundary
        };
        compressed[..LENGTH_HEADER_LEN].copy_from_slice(&header.to_le_bytes());

        let mut pages = Vec::new();
        pages
            .try_reserve_exact(nr_pages)
            .map_err(|_| Error::Allocation { what: "run page list", bytes: nr_pages * 8 })?;
        for chunk in compressed[..nr_pages * PAGE_SIZE].chunks_exact(PAGE_SIZE) {
            let mut page = self.allocator.alloc_page()?;
            page.as_mut_slice().copy_from_slice(chunk);
            pages.push(page);
        }

        self.stats.record_compress(
            in_len,
            nr_pages * PAGE_SIZE,
            padding == Padding::WorstCase,
            start.elapsed().as_nanos() as u64,
        );
        Ok(EncodedRun { pages, compressed_len, len: in_len, padding })
    }

    /// Reassemble `pages` in `ws` and decompress `len` bytes into
    /// `ws.decompressed`. Returns the payload length read from the header.
    fn decode(&self, ws: &mut Workspace, pages: &[&PageBuf], len: usize) -> Result<usize> {
        let span = pages.len() * PAGE_SIZE;
        if pages.is_empty() || span > ws.compressed.len() {
            return Err(Error::CorruptedData(format!(
                "run of {} pages does not fit a {}-page stride",
                pages.len(),
                ws.stride_pages()
            )));
        }
        if len > ws.decompressed.len() {
            return Err(Error::InvalidInput(format!("run length {len} exceeds workspace")));
        }
        for (i, page) in pages.iter().enumerate() {
            ws.compressed[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].copy_from_slice(page.as_slice());
        }

        let compressed_len = read_length_header(&ws.compressed)?;
        if compressed_len + LENGTH_HEADER_LEN > span {
            return Err(Error::CorruptedData(format!(
                "header length {compressed_len} exceeds run of {} pages",
                pages.len()
            )));
        }
        let payload = &ws.compressed[LENGTH_HEADER_LEN..LENGTH_HEADER_LEN + compressed_len];
        let out = self.codec.decompress(payload, &mut ws.decompressed[..len])?;
        if out != len {
            return Err(Error::CorruptedData(format!(
                "decompressed size mismatch: expected {len}, got {out}"
            )));
        }
        Ok(compressed_len)
    }

    /// Decode a run's on-disk pages into `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error for a corrupted run or allocation failure.
    pub fn decode_run(&self, pages: &[PageBuf], len: usize) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut ws = self.workspace(len.div_ceil(PAGE_SIZE).clamp(1, STRIDE_LEN))?;
        let refs: Vec<&PageBuf> = pages.iter().collect();
        let result = self.decode(&mut ws, &refs, len);
        self.stats.record_decompress(result.is_ok(), start.elapsed().as_nanos() as u64);
        result?;
        Ok(ws.decompressed[..len].to_vec())
    }

    /// Decompress a fully read run into its target cache pages.
    ///
    /// Target pages are located by logical index in batches of at most
    /// [`LOOKUP_BATCH`]. Only pages the reader claimed for this run are
    /// touched: missing pages are skipped and pages that are already up to
    /// date keep their contents. On failure every waiting target page is
    /// marked errored and unlocked, and no data is copied. The same happens
    /// when the owning inode is gone, which fills nothing. Returns the
    /// number of pages filled.
    ///
    /// # Errors
    ///
    /// Returns the codec or allocation error that prevented decompression.
    pub fn decompress_stride(&self, run: &CompressedRun) -> Result<usize> {
        let Some(inode) = run.inode() else {
            tracing::debug!(ino = run.ino(), start = run.start_index(), "inode gone, dropping decompressed run");
            fail_targets(run);
            return Ok(0);
        };
        let start = Instant::now();
        let len = run.len();

        let result = self.workspace(run.target_pages()).and_then(|mut ws| {
            let compressed_len = run.with_pages(|slots| {
                let pages = slots
                    .iter()
                    .map(Option::as_ref)
                    .collect::<Option<Vec<&PageBuf>>>()
                    .ok_or_else(|| Error::Internal("run page missing at decompression".to_string()))?;
                self.decode(&mut ws, &pages, len)
            })?;
            Ok((ws, compressed_len))
        });
        self.stats.record_decompress(result.is_ok(), start.elapsed().as_nanos() as u64);

        let (ws, compressed_len) = match result {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(ino = inode.ino(), start = run.start_index(), error = %e, "stride decompression failed");
                fail_targets(run);
                return Err(e);
            }
        };
        run.set_compressed_len(compressed_len);

        let mut filled = 0;
        for_each_target(run, |page, slot| {
            if !page.is_uptodate() {
                page.fill_uptodate(&ws.decompressed[slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE]);
                filled += 1;
            }
            page.unlock();
        });
        tracing::debug!(ino = inode.ino(), start = run.start_index(), compressed_len, filled, "stride decompressed");
        Ok(filled)
    }

    /// Largest number of on-disk pages a run of `stride_pages` can occupy.
    pub(crate) fn max_run_pages(&self, stride_pages: usize) -> usize {
        Workspace::staging_len(self.codec.as_ref(), stride_pages) / PAGE_SIZE
    }
}

/// Visit the resident pages claimed by a run, in bounded contiguous lookups.
fn for_each_target(run: &CompressedRun, mut f: impl FnMut(&PageRef, usize)) {
    let mapping = run.mapping();
    let start = run.start_index();
    let mut index = start;
    let mut remaining = run.target_pages();
    while remaining > 0 {
        let found = mapping.find_contig(index, remaining.min(LOOKUP_BATCH));
        if found.is_empty() {
            tracing::trace!(index, "target page not resident");
            index += 1;
            remaining -= 1;
            continue;
        }
        let n = found.len().min(remaining);
        for page in found[..n].iter().filter(|p| run.is_claimed(p.index())) {
            f(page, (page.index() - start) as usize);
        }
        index += n as u64;
        remaining -= n;
    }
}

/// Mark every waiting target page of a run as failed and unlock it.
pub(crate) fn fail_targets(run: &CompressedRun) {
    for_each_target(run, |page, _| {
        if !page.is_uptodate() {
            page.set_error();
        }
        page.unlock();
    });
}
