//! Batched reads over plain, compressed and missing extents.

use pagestride_core::mem::{Extent, ExtentTree, MemDisk, MemPageCache};
use pagestride_core::{
    CachePage, CompressorBuilder, Confusion, DeviceId, Inode, PageCache, PageOutcome, PageRef,
    ReadConfig, ReadState, StrideCompressor, StrideReadScheduler, StrideWriter, PAGE_SIZE,
};
use std::sync::Arc;

fn bytes(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| ((i / 7) as u8).wrapping_mul(31) ^ salt).collect()
}

struct Env {
    cache: Arc<MemPageCache>,
    inode: Arc<Inode>,
    tree: Arc<ExtentTree>,
    disk: Arc<MemDisk>,
    compressor: Arc<StrideCompressor>,
}

impl Env {
    fn new(size: u64) -> Self {
        let cache = Arc::new(MemPageCache::new());
        Self {
            inode: Inode::new(1, size, cache.clone()),
            cache,
            tree: Arc::new(ExtentTree::new(DeviceId(0))),
            disk: Arc::new(MemDisk::default()),
            compressor: CompressorBuilder::new().build(),
        }
    }

    fn scheduler(&self, config: ReadConfig) -> StrideReadScheduler {
        StrideReadScheduler::with_config(self.tree.clone(), self.disk.clone(), self.compressor.clone(), config)
    }

    fn writer(&self) -> StrideWriter {
        StrideWriter::new(self.compressor.clone(), self.tree.clone(), self.disk.clone())
    }

    /// Store `data` as a plain extent at `logical`, placed at the next free block.
    fn plain(&self, logical: u64, data: &[u8]) {
        let physical = self.tree.next_free();
        self.disk.write_at(physical * PAGE_SIZE as u64, data).unwrap();
        self.tree.insert(1, Extent::plain(logical, (data.len() / PAGE_SIZE) as u64, physical));
    }

    /// Compress `data` into a stride starting at page `start`, then drop the pages.
    fn compressed(&self, start: u64, data: &[u8]) {
        let pages: Vec<PageRef> = data
            .chunks(PAGE_SIZE)
            .enumerate()
            .map(|(i, c)| CachePage::with_contents(start + i as u64, c).unwrap())
            .collect();
        self.writer().write_stride(&self.inode, &pages).unwrap().wait();
    }
}

#[test]
fn test_unmapped_file_reads_as_zeros_without_io() {
    let env = Env::new(4 * PAGE_SIZE as u64);
    let scheduler = env.scheduler(ReadConfig::default());
    let report = scheduler.read_pages(&env.inode, &[0, 1, 2, 3]).unwrap();
    assert_eq!(report.holes, 4);
    assert_eq!(env.disk.requests_submitted(), 0);
    assert_eq!(scheduler.read_range(&env.inode, 0, 4).unwrap(), vec![0u8; 4 * PAGE_SIZE]);
}

#[test]
fn test_mixed_file_reads_back() {
    let env = Env::new(48 * PAGE_SIZE as u64);
    let compressed = bytes(16 * PAGE_SIZE, 1);
    let plain = bytes(16 * PAGE_SIZE, 2);
    env.compressed(0, &compressed);
    env.plain(32, &plain);

    let cold = Inode::new(1, 48 * PAGE_SIZE as u64, Arc::new(MemPageCache::new()));
    let scheduler = env.scheduler(ReadConfig::default());
    let data = scheduler.read_range(&cold, 0, 48).unwrap();
    assert_eq!(&data[..16 * PAGE_SIZE], &compressed[..]);
    assert!(data[16 * PAGE_SIZE..32 * PAGE_SIZE].iter().all(|&b| b == 0));
    assert_eq!(&data[32 * PAGE_SIZE..], &plain[..]);
}

#[test]
fn test_batch_stops_at_extent_end() {
    let env = Env::new(32 * PAGE_SIZE as u64);
    env.compressed(0, &bytes(16 * PAGE_SIZE, 3));
    env.plain(16, &bytes(16 * PAGE_SIZE, 4));
    let cold = Inode::new(1, 32 * PAGE_SIZE as u64, Arc::new(MemPageCache::new()));

    let config = ReadConfig { readahead: false, batch_pages: 32 };
    let report = env.scheduler(config).read_pages(&cold, &(0..32).collect::<Vec<_>>()).unwrap();
    report.wait_runs();
    assert_eq!(report.batches, 2);
    assert_eq!(report.in_runs, 16);
    assert_eq!(report.queued, 16);
    assert_eq!(report.runs.len(), 1);
}

#[test]
fn test_readahead_stops_at_unaligned_eof() {
    let size = 10 * PAGE_SIZE + 100;
    let env = Env::new(size as u64);
    env.plain(0, &bytes(11 * PAGE_SIZE, 5));

    let report = env.scheduler(ReadConfig::default()).read_page(&env.inode, 0).unwrap();
    assert_eq!(report.readahead, 10);
    assert_eq!(env.cache.len(), 11);
    assert!(env.cache.lookup(10).unwrap().flags().readahead);
    assert!(!env.cache.lookup(9).unwrap().flags().readahead);
    assert!(env.cache.lookup(11).is_none());
}

#[test]
fn test_readahead_for_final_pages_stops_at_eof() {
    let size = 40 * PAGE_SIZE + 100;
    let env = Env::new(size as u64);
    let data = bytes(41 * PAGE_SIZE, 12);
    env.plain(0, &data);
    let end_index = env.inode.end_index().unwrap();
    assert_eq!(end_index, 40);

    let report = env.scheduler(ReadConfig::default()).read_page(&env.inode, end_index - 2).unwrap();
    assert_eq!(report.readahead, 2);
    assert_eq!(report.queued, 3);
    assert_eq!(env.cache.len(), 3);
    assert!(env.cache.lookup(end_index).unwrap().flags().readahead);
    assert!(env.cache.lookup(end_index + 1).is_none());

    let tail = env.cache.lookup(end_index).unwrap();
    tail.wait_unlocked();
    assert_eq!(tail.to_vec(), &data[40 * PAGE_SIZE..]);
}

#[test]
fn test_readahead_skips_cached_pages() {
    let env = Env::new(20 * PAGE_SIZE as u64);
    env.plain(0, &bytes(20 * PAGE_SIZE, 6));
    let resident = CachePage::with_contents(3, &[9u8; PAGE_SIZE]).unwrap();
    env.cache.insert(resident);

    let report = env.scheduler(ReadConfig::default()).read_page(&env.inode, 0).unwrap();
    assert_eq!(report.readahead, 15);
    assert_eq!(env.cache.lookup(3).unwrap().to_vec(), vec![9u8; PAGE_SIZE]);
    assert!(env.cache.lookup(16).unwrap().flags().readahead);
}

#[test]
fn test_resident_pages_are_skipped() {
    let env = Env::new(4 * PAGE_SIZE as u64);
    env.plain(0, &bytes(4 * PAGE_SIZE, 7));
    env.cache.insert(CachePage::with_contents(1, &[1u8; PAGE_SIZE]).unwrap());
    let config = ReadConfig { readahead: false, ..ReadConfig::default() };
    let report = env.scheduler(config).read_pages(&env.inode, &[0, 1, 1, 2]).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.queued, 2);
}

#[test]
fn test_mapping_failure_fails_only_that_page() {
    let env = Env::new(4 * PAGE_SIZE as u64);
    let data = bytes(4 * PAGE_SIZE, 8);
    env.plain(0, &data);
    env.tree.fail_at(1, 2);

    let config = ReadConfig { readahead: false, ..ReadConfig::default() };
    let scheduler = env.scheduler(config);
    let report = scheduler.read_page(&env.inode, 2).unwrap();
    assert_eq!(report.fallbacks, 1);
    let page = env.cache.lookup(2).unwrap();
    assert!(!page.is_locked());
    assert!(page.flags().error);

    let other = scheduler.read_range(&env.inode, 0, 2).unwrap();
    assert_eq!(other, &data[..2 * PAGE_SIZE]);
}

#[test]
fn test_buffered_page_decodes_run_synchronously() {
    let env = Env::new(16 * PAGE_SIZE as u64);
    let data = bytes(16 * PAGE_SIZE, 9);
    env.compressed(0, &data);
    let disk_pages = env.tree.extents(1)[0].disk_blocks.unwrap() as usize;

    let page = CachePage::try_new(5).unwrap();
    page.set_has_buffers();
    assert!(env.cache.add_page(&page));
    let mut state = ReadState::new(&env.inode, env.tree.as_ref(), env.disk.as_ref(), &env.compressor);
    assert_eq!(state.read_page(&page, 1), PageOutcome::Fallback(Confusion::BufferedPage));
    let (requests, runs) = state.finish();

    assert_eq!((requests, runs.len()), (0, 0));
    assert!(page.is_uptodate());
    assert_eq!(page.to_vec(), &data[5 * PAGE_SIZE..6 * PAGE_SIZE]);
    assert_eq!(env.disk.sync_reads(), disk_pages);
}

#[test]
fn test_writeback_then_cold_read() {
    let size = 20 * PAGE_SIZE - 300;
    let env = Env::new(size as u64);
    let data = bytes(20 * PAGE_SIZE, 10);
    for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
        let page = CachePage::with_contents(i as u64, chunk).unwrap();
        page.set_dirty();
        env.cache.insert(page);
    }

    let summary = env.writer().writeback_range(&env.inode, 0..20).unwrap();
    assert_eq!(summary.strides, 2);
    assert_eq!(summary.pages, 20);
    assert!(summary.disk_pages < 20);
    assert!(env.cache.pages_in(0..20).iter().all(|p| !p.flags().dirty));

    let cold = Inode::new(1, size as u64, Arc::new(MemPageCache::new()));
    let read = env.scheduler(ReadConfig::default()).read_range(&cold, 0, 20).unwrap();
    assert_eq!(read, data);
}

#[test]
fn test_adjacent_extents_use_one_batch_each() {
    let env = Env::new(8 * PAGE_SIZE as u64);
    let data = bytes(8 * PAGE_SIZE, 11);
    env.plain(0, &data[..4 * PAGE_SIZE]);
    env.disk.write_at(4 * PAGE_SIZE as u64, &data[4 * PAGE_SIZE..]).unwrap();
    env.tree.insert(1, Extent::plain(4, 4, 4));
    env.tree.set_boundary_hints(true);

    let config = ReadConfig { readahead: false, batch_pages: 8 };
    let scheduler = env.scheduler(config);
    let report = scheduler.read_pages(&env.inode, &(0..8).collect::<Vec<_>>()).unwrap();
    assert_eq!(report.batches, 2);
    assert_eq!(report.requests, 2);
    assert_eq!(scheduler.read_range(&env.inode, 0, 8).unwrap(), data);
}
