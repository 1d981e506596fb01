//! Smoke tests for basic functionality

use pagestride::mem::{ExtentTree, MemDisk, MemPageCache};
use pagestride::{CachePage, CompressorBuilder, DeviceId, Inode, StrideReadScheduler, StrideWriter, PAGE_SIZE};
use std::sync::Arc;

#[test]
fn test_version_exists() {
    let version = env!("CARGO_PKG_VERSION");
    let parts: Vec<&str> = version.split('.').collect();
    assert_eq!(parts.len(), 3, "Version should be semver: {version}");
}

#[test]
fn test_write_and_read_one_page() {
    let compressor = CompressorBuilder::new().build();
    let tree = Arc::new(ExtentTree::new(DeviceId(0)));
    let disk = Arc::new(MemDisk::default());
    let inode = Inode::new(1, 100, Arc::new(MemPageCache::new()));
    let page = CachePage::with_contents(0, b"hello").unwrap();

    let writer = StrideWriter::new(compressor.clone(), tree.clone(), disk.clone());
    writer.write_stride(&inode, &[page]).unwrap().wait();

    let cold = Inode::new(1, 100, Arc::new(MemPageCache::new()));
    let data = StrideReadScheduler::new(tree, disk, compressor).read_range(&cold, 0, 1).unwrap();
    assert_eq!(data.len(), PAGE_SIZE);
    assert_eq!(&data[..5], b"hello");
    assert!(data[5..].iter().all(|&b| b == 0));
}
