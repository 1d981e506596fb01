use crate::cache::Inode;
use crate::io::DeviceId;
use crate::mapping::{BlockMapper, MapMode, Mapping};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One extent of a file, in filesystem blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First logical block.
    pub logical: u64,
    /// Logical blocks covered.
    pub len: u64,
    /// First physical block.
    pub physical: u64,
    /// Physical blocks of the compressed run, `None` for a plain extent.
    pub disk_blocks: Option<u64>,
    /// Reported as already up to date by lookups.
    pub uptodate: bool,
}

impl Extent {
    /// A plain extent mapping `len` blocks one to one.
    #[must_use]
    pub fn plain(logical: u64, len: u64, physical: u64) -> Self {
        Self { logical, len, physical, disk_blocks: None, uptodate: false }
    }

    /// A compressed extent whose run occupies `disk_blocks` blocks.
    #[must_use]
    pub fn compressed(logical: u64, len: u64, physical: u64, disk_blocks: u64) -> Self {
        Self { logical, len, physical, disk_blocks: Some(disk_blocks), uptodate: false }
    }

    /// One past the last logical block.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.logical + self.len
    }

    /// Physical blocks occupied.
    #[must_use]
    pub fn physical_len(&self) -> u64 {
        self.disk_blocks.unwrap_or(self.len)
    }
}

#[derive(Debug, Default)]
struct Tree {
    extents: BTreeMap<(u64, u64), Extent>,
    next_free: u64,
    faults: HashSet<(u64, u64)>,
}

impl Tree {
    fn find(&self, ino: u64, block: u64) -> Option<Extent> {
        self.extents
            .range((ino, 0)..=(ino, block))
            .next_back()
            .map(|(_, e)| *e)
            .filter(|e| block < e.end())
    }

    fn next_start(&self, ino: u64, block: u64) -> Option<u64> {
        self.extents.range((ino, block + 1)..=(ino, u64::MAX)).next().map(|(_, e)| e.logical)
    }

    /// Remove the part of every extent overlapping `start..end`.
    fn punch(&mut self, ino: u64, start: u64, end: u64) -> Result<()> {
        let overlapping: Vec<Extent> = self
            .extents
            .range((ino, 0)..(ino, end))
            .map(|(_, e)| *e)
            .filter(|e| e.end() > start)
            .collect();
        if let Some(e) = overlapping
            .iter()
            .find(|e| e.disk_blocks.is_some() && (e.logical < start || e.end() > end))
        {
            return Err(Error::Mapping {
                block: e.logical,
                reason: format!("write {start}..{end} splits compressed extent {}..{}", e.logical, e.end()),
            });
        }
        for e in overlapping {
            self.extents.remove(&(ino, e.logical));
            if e.logical < start {
                self.extents.insert((ino, e.logical), Extent { len: start - e.logical, ..e });
            }
            if e.end() > end {
                let skip = end - e.logical;
                let tail = Extent { logical: end, len: e.end() - end, physical: e.physical + skip, ..e };
                self.extents.insert((ino, end), tail);
            }
        }
        Ok(())
    }
}

/// Per-file extent tables with a bump allocator for physical blocks.
#[derive(Debug, Default)]
pub struct ExtentTree {
    device: DeviceId,
    tree: Mutex<Tree>,
    boundary_hints: AtomicBool,
    lookups: AtomicUsize,
}

impl ExtentTree {
    /// An empty table allocating on `device`.
    #[must_use]
    pub fn new(device: DeviceId) -> Self {
        Self { device, ..Self::default() }
    }

    /// Add an extent as-is, replacing any extent starting at the same block.
    pub fn insert(&self, ino: u64, extent: Extent) {
        let mut tree = self.tree.lock();
        tree.next_free = tree.next_free.max(extent.physical + extent.physical_len());
        tree.extents.insert((ino, extent.logical), extent);
    }

    /// Extents of `ino` in logical order.
    #[must_use]
    pub fn extents(&self, ino: u64) -> Vec<Extent> {
        self.tree.lock().extents.range((ino, 0)..=(ino, u64::MAX)).map(|(_, e)| *e).collect()
    }

    /// First physical block never allocated.
    #[must_use]
    pub fn next_free(&self) -> u64 {
        self.tree.lock().next_free
    }

    /// Make every mapping of `ino` at `block` fail.
    pub fn fail_at(&self, ino: u64, block: u64) {
        self.tree.lock().faults.insert((ino, block));
    }

    /// Flag mappings that end at an extent boundary.
    pub fn set_boundary_hints(&self, on: bool) {
        self.boundary_hints.store(on, Ordering::Relaxed);
    }

    /// Calls to [`BlockMapper::map_blocks`] so far.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    fn mapping_for(&self, extent: &Extent, block: u64, max_blocks: u64) -> Mapping {
        if extent.disk_blocks.is_some() {
            return Mapping {
                logical: extent.logical,
                len: extent.len,
                device: self.device,
                physical: extent.physical,
                mapped: true,
                uptodate: extent.uptodate,
                boundary: false,
                disk_blocks: extent.disk_blocks,
            };
        }
        let len = (extent.end() - block).min(max_blocks).max(1);
        Mapping {
            logical: block,
            len,
            device: self.device,
            physical: extent.physical + (block - extent.logical),
            mapped: true,
            uptodate: extent.uptodate,
            boundary: self.boundary_hints.load(Ordering::Relaxed) && block + len == extent.end(),
            disk_blocks: None,
        }
    }
}

impl BlockMapper for ExtentTree {
    fn map_blocks(&self, inode: &Inode, logical: u64, max_blocks: u64, mode: MapMode) -> Result<Mapping> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let ino = inode.ino();
        let mut tree = self.tree.lock();
        if tree.faults.contains(&(ino, logical)) {
            return Err(Error::Mapping { block: logical, reason: "injected fault".to_string() });
        }

        match mode {
            MapMode::Lookup => {
                if let Some(extent) = tree.find(ino, logical) {
                    return Ok(self.mapping_for(&extent, logical, max_blocks));
                }
                let len = tree
                    .next_start(ino, logical)
                    .map_or(max_blocks, |next| (next - logical).min(max_blocks));
                Ok(Mapping::hole(logical, len))
            }
            MapMode::Create { disk_blocks } => {
                if max_blocks == 0 || disk_blocks == Some(0) {
                    return Err(Error::Mapping { block: logical, reason: "empty allocation".to_string() });
                }
                tree.punch(ino, logical, logical + max_blocks)?;
                let extent = Extent {
                    logical,
                    len: max_blocks,
                    physical: tree.next_free,
                    disk_blocks,
                    uptodate: false,
                };
                tree.next_free += extent.physical_len();
                tree.extents.insert((ino, logical), extent);
                tracing::trace!(
                    ino,
                    logical,
                    len = max_blocks,
                    physical = extent.physical,
                    ?disk_blocks,
                    "extent allocated"
                );
                Ok(self.mapping_for(&extent, logical, max_blocks))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemPageCache;
    use std::sync::Arc;

    fn inode() -> Arc<Inode> {
        Inode::new(1, 1 << 20, Arc::new(MemPageCache::new()))
    }

    #[test]
    fn test_lookup_plain_and_hole() {
        let tree = ExtentTree::new(DeviceId(0));
        let inode = inode();
        tree.insert(1, Extent::plain(4, 4, 100));

        let hole = tree.map_blocks(&inode, 0, 16, MapMode::Lookup).unwrap();
        assert!(!hole.mapped);
        assert_eq!((hole.logical, hole.len), (0, 4));

        let m = tree.map_blocks(&inode, 5, 16, MapMode::Lookup).unwrap();
        assert!(m.mapped);
        assert_eq!((m.logical, m.len, m.physical), (5, 3, 101));

        let m = tree.map_blocks(&inode, 4, 2, MapMode::Lookup).unwrap();
        assert_eq!(m.len, 2);

        let tail = tree.map_blocks(&inode, 8, 16, MapMode::Lookup).unwrap();
        assert!(!tail.mapped);
        assert_eq!(tail.len, 16);
        assert_eq!(tree.lookups(), 4);
    }

    #[test]
    fn test_compressed_extent_returned_whole() {
        let tree = ExtentTree::new(DeviceId(0));
        let inode = inode();
        tree.insert(1, Extent::compressed(16, 16, 40, 3));
        let m = tree.map_blocks(&inode, 20, 1, MapMode::Lookup).unwrap();
        assert_eq!((m.logical, m.len, m.physical), (16, 16, 40));
        assert_eq!(m.disk_blocks, Some(3));
        assert_eq!(tree.next_free(), 43);
    }

    #[test]
    fn test_create_allocates_sequentially() {
        let tree = ExtentTree::new(DeviceId(0));
        let inode = inode();
        let a = tree.map_blocks(&inode, 0, 16, MapMode::Create { disk_blocks: Some(2) }).unwrap();
        let b = tree.map_blocks(&inode, 16, 4, MapMode::Create { disk_blocks: None }).unwrap();
        assert_eq!(a.physical, 0);
        assert!(a.is_compressed());
        assert_eq!(b.physical, 2);
        assert_eq!(tree.next_free(), 6);
        assert_eq!(tree.extents(1).len(), 2);
        assert!(tree.extents(2).is_empty());
    }

    #[test]
    fn test_create_replaces_and_trims() {
        let tree = ExtentTree::new(DeviceId(0));
        let inode = inode();
        tree.insert(1, Extent::plain(0, 10, 0));
        tree.map_blocks(&inode, 4, 2, MapMode::Create { disk_blocks: None }).unwrap();
        let extents = tree.extents(1);
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[0], Extent::plain(0, 4, 0));
        assert_eq!(extents[1], Extent::plain(4, 2, 10));
        assert_eq!(extents[2], Extent::plain(6, 4, 6));
    }

    #[test]
    fn test_create_refuses_to_split_compressed() {
        let tree = ExtentTree::new(DeviceId(0));
        let inode = inode();
        tree.insert(1, Extent::compressed(0, 16, 0, 2));
        let err = tree.map_blocks(&inode, 4, 4, MapMode::Create { disk_blocks: Some(1) }).unwrap_err();
        assert!(err.to_string().contains("splits compressed extent"));
        assert!(tree.map_blocks(&inode, 0, 16, MapMode::Create { disk_blocks: Some(1) }).is_ok());
    }

    #[test]
    fn test_fault_injection_and_boundary() {
        let tree = ExtentTree::new(DeviceId(0));
        let inode = inode();
        tree.insert(1, Extent::plain(0, 4, 0));
        tree.set_boundary_hints(true);
        assert!(tree.map_blocks(&inode, 0, 16, MapMode::Lookup).unwrap().boundary);
        assert!(!tree.map_blocks(&inode, 0, 2, MapMode::Lookup).unwrap().boundary);
        tree.fail_at(1, 2);
        assert!(tree.map_blocks(&inode, 2, 1, MapMode::Lookup).is_err());
    }
}
