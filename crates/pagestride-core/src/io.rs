//! Block I/O transport and the requests submitted to it.

use crate::page::{PageBuf, PageRef, PAGE_SIZE};
use crate::run::{CompressedRun, Direction};
use crate::{Error, Result};
use std::sync::Arc;

/// Identifies a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Size of a sector, the addressing unit of requests.
pub const SECTOR_SIZE: usize = 512;

/// Raw block transport.
///
/// `submit` hands ownership of the request to the transport, which must
/// call [`IoRequest::end_io`] exactly once, on any thread.
pub trait BlockIo: Send + Sync {
    /// Largest number of pages one request to `device` may carry.
    fn max_pages_per_request(&self, device: DeviceId) -> usize;

    /// Start a transfer.
    fn submit(&self, request: IoRequest);

    /// Read `buf.len()` bytes starting at `sector`, synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the transfer fails.
    fn read_sync(&self, device: DeviceId, sector: u64, buf: &mut [u8]) -> Result<()>;
}

/// A page-cache page attached to an ordinary read request.
#[derive(Debug)]
pub(crate) struct CacheSegment {
    pub(crate) page: PageRef,
    pub(crate) len: usize,
}

#[derive(Debug)]
pub(crate) enum Payload {
    Cache(Vec<CacheSegment>),
    Run { run: Arc<CompressedRun>, pages: Vec<(usize, PageBuf)> },
}

/// One transfer of contiguous sectors.
///
/// An ordinary request reads page-cache pages directly. A run request moves
/// some of a compressed run's page buffers and reports back to the run when
/// it completes.
#[derive(Debug)]
pub struct IoRequest {
    device: DeviceId,
    sector: u64,
    capacity: usize,
    pub(crate) payload: Payload,
}

impl IoRequest {
    fn reserve<T>(capacity: usize) -> Result<(Vec<T>, usize)> {
        let mut capacity = capacity.max(1);
        loop {
            let mut segments = Vec::new();
            if segments.try_reserve_exact(capacity).is_ok() {
                return Ok((segments, capacity));
            }
            if capacity == 1 {
                return Err(Error::Allocation {
                    what: "I/O request",
                    bytes: std::mem::size_of::<T>(),
                });
            }
            capacity /= 2;
        }
    }

    /// Start an ordinary read of up to `capacity` cache pages at `sector`.
    ///
    /// Under memory pressure the request is built with a smaller capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if not even one segment fits.
    pub fn read_cache(device: DeviceId, sector: u64, capacity: usize) -> Result<Self> {
        let (segments, capacity) = Self::reserve(capacity)?;
        Ok(Self { device, sector, capacity, payload: Payload::Cache(segments) })
    }

    /// Start a request moving pages of `run` at `sector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if not even one segment fits.
    pub fn for_run(
        run: Arc<CompressedRun>,
        device: DeviceId,
        sector: u64,
        capacity: usize,
    ) -> Result<Self> {
        let (pages, capacity) = Self::reserve(capacity)?;
        Ok(Self { device, sector, capacity, payload: Payload::Run { run, pages } })
    }

    /// Append `len` bytes of a cache page. Returns `false` when full.
    pub(crate) fn add_cache_page(&mut self, page: PageRef, len: usize) -> bool {
        match &mut self.payload {
            Payload::Cache(segments) if segments.len() < self.capacity => {
                segments.push(CacheSegment { page, len: len.min(PAGE_SIZE) });
                true
            }
            _ => false,
        }
    }

    /// Append run page buffer `slot`. Gives the buffer back when full.
    pub(crate) fn add_run_page(&mut self, slot: usize, buf: PageBuf) -> std::result::Result<(), PageBuf> {
        match &mut self.payload {
            Payload::Run { pages, .. } if pages.len() < self.capacity => {
                pages.push((slot, buf));
                Ok(())
            }
            _ => Err(buf),
        }
    }

    /// Target device.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// First sector.
    #[must_use]
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Whether the request reads from or writes to the device.
    #[must_use]
    pub fn direction(&self) -> Direction {
        match &self.payload {
            Payload::Cache(_) => Direction::Read,
            Payload::Run { run, .. } => run.direction(),
        }
    }

    /// Pages attached.
    #[must_use]
    pub fn page_count(&self) -> usize {
        match &self.payload {
            Payload::Cache(segments) => segments.len(),
            Payload::Run { pages, .. } => pages.len(),
        }
    }

    /// Whether no page is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.page_count() == 0
    }

    /// Total bytes moved.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match &self.payload {
            Payload::Cache(segments) => segments.iter().map(|s| s.len).sum(),
            Payload::Run { pages, .. } => pages.len() * PAGE_SIZE,
        }
    }

    /// Run `f` over each segment with its byte offset on the device.
    ///
    /// Segments are laid out back to back starting at [`Self::sector`]. For
    /// reads the transport fills the buffers; for writes it copies them out.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error from `f`.
    pub fn for_each_segment(
        &mut self,
        mut f: impl FnMut(u64, &mut [u8]) -> Result<()>,
    ) -> Result<()> {
        let mut pos = self.sector * SECTOR_SIZE as u64;
        match &mut self.payload {
            Payload::Cache(segments) => {
                for seg in segments.iter() {
                    seg.page.with_data_mut(|data| f(pos, &mut data[..seg.len]))?;
                    pos += seg.len as u64;
                }
            }
            Payload::Run { pages, .. } => {
                for (_, buf) in pages.iter_mut() {
                    f(pos, buf.as_mut_slice())?;
                    pos += PAGE_SIZE as u64;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CachePage;

    #[test]
    fn test_device_display() {
        assert_eq!(DeviceId(3).to_string(), "dev3");
    }

    #[test]
    fn test_cache_request_capacity() {
        let mut req = IoRequest::read_cache(DeviceId(0), 8, 2).unwrap();
        assert!(req.is_empty());
        assert!(req.add_cache_page(CachePage::try_new(0).unwrap(), PAGE_SIZE));
        assert!(req.add_cache_page(CachePage::try_new(1).unwrap(), 1024));
        assert!(!req.add_cache_page(CachePage::try_new(2).unwrap(), PAGE_SIZE));
        assert_eq!(req.page_count(), 2);
        assert_eq!(req.byte_len(), PAGE_SIZE + 1024);
        assert_eq!(req.direction(), Direction::Read);
        assert!(req.add_run_page(0, PageBuf::try_new().unwrap()).is_err());
    }

    #[test]
    fn test_segment_offsets() {
        let mut req = IoRequest::read_cache(DeviceId(0), 8, 4).unwrap();
        req.add_cache_page(CachePage::try_new(0).unwrap(), PAGE_SIZE);
        req.add_cache_page(CachePage::try_new(1).unwrap(), 512);
        let mut seen = Vec::new();
        req.for_each_segment(|pos, buf| {
            seen.push((pos, buf.len()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(4096, PAGE_SIZE), (8192, 512)]);
    }
}
