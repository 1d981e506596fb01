use crate::io::{BlockIo, DeviceId, IoRequest, SECTOR_SIZE};
use crate::run::Direction;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// When a [`MemDisk`] completes submitted requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Inside `submit`, on the caller's thread.
    #[default]
    Inline,
    /// On the rayon pool.
    Threaded,
    /// Only when the test takes and completes them.
    Deferred,
}

#[derive(Debug, Default)]
struct Inner {
    device: DeviceId,
    data: RwLock<Vec<u8>>,
    faults: Mutex<Vec<Range<u64>>>,
    deferred: Mutex<Vec<IoRequest>>,
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    sync_reads: AtomicUsize,
}

impl Inner {
    fn check_faults(&self, pos: u64, len: usize) -> Result<()> {
        let end = pos + len as u64;
        match self.faults.lock().iter().find(|f| f.start < end && pos < f.end) {
            Some(f) => Err(Error::IoError(format!("injected fault at bytes {}..{}", f.start, f.end))),
            None => Ok(()),
        }
    }

    fn transfer(&self, req: &mut IoRequest) -> Result<()> {
        if req.device() != self.device {
            return Err(Error::IoError(format!("no such device: {}", req.device())));
        }
        self.check_faults(req.sector() * SECTOR_SIZE as u64, req.byte_len())?;
        match req.direction() {
            Direction::Read => {
                let data = self.data.read();
                req.for_each_segment(|pos, buf| {
                    let src = data
                        .get(pos as usize..pos as usize + buf.len())
                        .ok_or_else(|| Error::IoError(format!("read past end of disk at byte {pos}")))?;
                    buf.copy_from_slice(src);
                    Ok(())
                })
            }
            Direction::Write => {
                let mut data = self.data.write();
                req.for_each_segment(|pos, buf| {
                    let end = pos as usize + buf.len();
                    if data.len() < end {
                        data.resize(end, 0);
                    }
                    data[pos as usize..end].copy_from_slice(buf);
                    Ok(())
                })
            }
        }
    }

    fn complete(&self, mut req: IoRequest, injected: Option<Error>) {
        let status = match injected {
            Some(e) => Err(e),
            None => self.transfer(&mut req),
        };
        if status.is_err() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        req.end_io(status);
    }
}

/// A request held back by a [`CompletionMode::Deferred`] disk.
#[derive(Debug)]
pub struct PendingIo {
    inner: Arc<Inner>,
    request: IoRequest,
}

impl PendingIo {
    /// First sector of the request.
    #[must_use]
    pub fn sector(&self) -> u64 {
        self.request.sector()
    }

    /// Pages carried by the request.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.request.page_count()
    }

    /// Perform the transfer and complete the request.
    pub fn complete(self) {
        self.inner.complete(self.request, None);
    }

    /// Complete the request with an error, without transferring data.
    pub fn fail(self) {
        self.inner.complete(self.request, Some(Error::IoError("request failed".to_string())));
    }
}

/// A RAM-backed block device.
///
/// Reads beyond the end fail; writes grow the device.
#[derive(Debug)]
pub struct MemDisk {
    inner: Arc<Inner>,
    max_pages: AtomicUsize,
    completion: CompletionMode,
}

impl Default for MemDisk {
    fn default() -> Self {
        Self::from_bytes(Vec::new())
    }
}

impl MemDisk {
    /// Default request size limit in pages.
    pub const DEFAULT_MAX_PAGES: usize = 32;

    /// A zeroed device of `bytes` bytes with inline completion.
    #[must_use]
    pub fn new(bytes: usize) -> Self {
        Self::from_bytes(vec![0; bytes])
    }

    /// A device holding `data`.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner { data: RwLock::new(data), ..Inner::default() }),
            max_pages: AtomicUsize::new(Self::DEFAULT_MAX_PAGES),
            completion: CompletionMode::Inline,
        }
    }

    /// Set when submitted requests complete.
    #[must_use]
    pub fn with_completion(mut self, completion: CompletionMode) -> Self {
        self.completion = completion;
        self
    }

    /// Limit requests to `pages` pages.
    pub fn set_max_pages(&self, pages: usize) {
        self.max_pages.store(pages.max(1), Ordering::Relaxed);
    }

    /// Fail every transfer touching the byte range.
    pub fn inject_fault(&self, bytes: Range<u64>) {
        self.inner.faults.lock().push(bytes);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Copy of the device contents.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.data.read().clone()
    }

    /// Device size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    /// Whether the device holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `bytes` at `offset` directly, growing the device if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the range hits an injected fault.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.inner.check_faults(offset, bytes.len())?;
        let mut data = self.inner.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Take every request held by a deferred disk, in submission order.
    #[must_use]
    pub fn take_pending(&self) -> Vec<PendingIo> {
        std::mem::take(&mut *self.inner.deferred.lock())
            .into_iter()
            .map(|request| PendingIo { inner: Arc::clone(&self.inner), request })
            .collect()
    }

    /// Complete every held request, in submission order.
    pub fn complete_all(&self) {
        for pending in self.take_pending() {
            pending.complete();
        }
    }

    /// Requests submitted so far.
    #[must_use]
    pub fn requests_submitted(&self) -> usize {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Requests completed so far.
    #[must_use]
    pub fn requests_completed(&self) -> usize {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Requests that completed with an error.
    #[must_use]
    pub fn requests_failed(&self) -> usize {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Synchronous reads served.
    #[must_use]
    pub fn sync_reads(&self) -> usize {
        self.inner.sync_reads.load(Ordering::Relaxed)
    }
}

impl BlockIo for MemDisk {
    fn max_pages_per_request(&self, _device: DeviceId) -> usize {
        self.max_pages.load(Ordering::Relaxed)
    }

    fn submit(&self, request: IoRequest) {
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        match self.completion {
            CompletionMode::Inline => self.inner.complete(request, None),
            CompletionMode::Threaded => {
                let inner = Arc::clone(&self.inner);
                rayon::spawn(move || inner.complete(request, None));
            }
            CompletionMode::Deferred => self.inner.deferred.lock().push(request),
        }
    }

    fn read_sync(&self, device: DeviceId, sector: u64, buf: &mut [u8]) -> Result<()> {
        if device != self.inner.device {
            return Err(Error::IoError(format!("no such device: {device}")));
        }
        let pos = sector * SECTOR_SIZE as u64;
        self.inner.check_faults(pos, buf.len())?;
        let data = self.inner.data.read();
        let src = data
            .get(pos as usize..pos as usize + buf.len())
            .ok_or_else(|| Error::IoError(format!("read past end of disk at byte {pos}")))?;
        buf.copy_from_slice(src);
        self.inner.sync_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{CachePage, PAGE_SIZE};

    #[test]
    fn test_write_at_grows() {
        let disk = MemDisk::default();
        assert!(disk.is_empty());
        disk.write_at(10, b"abc").unwrap();
        assert_eq!(disk.len(), 13);
        assert_eq!(&disk.to_bytes()[10..], b"abc");
    }

    #[test]
    fn test_read_sync_bounds_and_faults() {
        let disk = MemDisk::new(2 * PAGE_SIZE);
        disk.write_at(512, &[5u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        disk.read_sync(DeviceId(0), 1, &mut buf).unwrap();
        assert_eq!(buf, [5u8; 512]);
        assert!(disk.read_sync(DeviceId(0), 16, &mut buf).is_err());
        assert!(disk.read_sync(DeviceId(1), 0, &mut buf).is_err());
        assert_eq!(disk.sync_reads(), 1);

        disk.inject_fault(600..700);
        assert!(disk.read_sync(DeviceId(0), 1, &mut buf).is_err());
        disk.clear_faults();
        assert!(disk.read_sync(DeviceId(0), 1, &mut buf).is_ok());
        assert_eq!(disk.sync_reads(), 2);
    }

    #[test]
    fn test_deferred_completion() {
        let disk = MemDisk::new(PAGE_SIZE).with_completion(CompletionMode::Deferred);
        disk.write_at(0, &[1u8; PAGE_SIZE]).unwrap();
        let page = CachePage::try_new(0).unwrap();
        page.lock();
        let mut req = IoRequest::read_cache(DeviceId(0), 0, 1).unwrap();
        req.add_cache_page(page.clone(), PAGE_SIZE);
        disk.submit(req);

        assert!(page.is_locked());
        let pending = disk.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].page_count(), 1);
        disk.complete_all();
        assert!(page.is_locked());
        pending.into_iter().for_each(PendingIo::complete);
        assert!(page.is_uptodate());
        assert_eq!(page.to_vec(), vec![1u8; PAGE_SIZE]);
        assert_eq!(disk.requests_completed(), 1);
    }

    #[test]
    fn test_failed_request() {
        let disk = MemDisk::new(PAGE_SIZE);
        disk.inject_fault(0..1);
        let page = CachePage::try_new(0).unwrap();
        page.lock();
        let mut req = IoRequest::read_cache(DeviceId(0), 0, 1).unwrap();
        req.add_cache_page(page.clone(), PAGE_SIZE);
        disk.submit(req);
        assert!(page.flags().error);
        assert_eq!(disk.requests_failed(), 1);
    }
}
