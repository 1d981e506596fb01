use crate::cache::PageCache;
use crate::page::{CachePage, PageRef};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Page cache backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemPageCache {
    pages: RwLock<BTreeMap<u64, PageRef>>,
}

impl MemPageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resident page count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    /// Whether no page is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }

    /// Evict the page at `index`.
    pub fn remove(&self, index: u64) -> Option<PageRef> {
        self.pages.write().remove(&index)
    }

    /// Insert an unlocked page, replacing any page at its index.
    pub fn insert(&self, page: PageRef) {
        self.pages.write().insert(page.index(), page);
    }

    /// Resident pages with indices in `range`, in index order.
    #[must_use]
    pub fn pages_in(&self, range: std::ops::Range<u64>) -> Vec<PageRef> {
        self.pages.read().range(range).map(|(_, p)| p.clone()).collect()
    }
}

impl PageCache for MemPageCache {
    fn lookup(&self, index: u64) -> Option<PageRef> {
        self.pages.read().get(&index).cloned()
    }

    fn alloc_page(&self, index: u64) -> Result<PageRef> {
        CachePage::try_new(index)
    }

    fn add_page(&self, page: &PageRef) -> bool {
        let mut pages = self.pages.write();
        if pages.contains_key(&page.index()) || !page.try_lock() {
            return false;
        }
        pages.insert(page.index(), page.clone());
        true
    }

    fn find_contig(&self, start: u64, max: usize) -> Vec<PageRef> {
        self.pages
            .read()
            .range(start..)
            .take(max)
            .enumerate()
            .take_while(|(i, (index, _))| **index == start + *i as u64)
            .map(|(_, (_, page))| page.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_page_locks_and_rejects_duplicates() {
        let cache = MemPageCache::new();
        let page = cache.alloc_page(4).unwrap();
        assert!(cache.add_page(&page));
        assert!(page.is_locked());
        let other = cache.alloc_page(4).unwrap();
        assert!(!cache.add_page(&other));
        assert!(!other.is_locked());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_find_contig_stops_at_gap() {
        let cache = MemPageCache::new();
        for index in [3, 4, 5, 7] {
            cache.insert(CachePage::try_new(index).unwrap());
        }
        let found: Vec<u64> = cache.find_contig(3, 16).iter().map(|p| p.index()).collect();
        assert_eq!(found, vec![3, 4, 5]);
        assert_eq!(cache.find_contig(4, 1).len(), 1);
        assert!(cache.find_contig(6, 4).is_empty());
        assert_eq!(cache.find_contig(7, 4).len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache = MemPageCache::new();
        cache.insert(CachePage::try_new(1).unwrap());
        assert!(cache.lookup(1).is_some());
        assert!(cache.remove(1).is_some());
        assert!(cache.is_empty());
    }
}
