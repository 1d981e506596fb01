//! Stride compression for page-cache I/O.
//!
//! Up to 16 consecutive pages of a file form a *stride*, which is compressed
//! into a *compressed run*: a 4-byte length header, the payload and zero
//! padding, stored in whole on-disk pages. Reads resolve each requested page
//! against the file's extents, read plain extents in place and fetch
//! compressed runs with several concurrent requests, decompressing the run
//! into the page cache once the last request completes.
//!
//! The filesystem around this layer is reached through traits: the page
//! cache ([`PageCache`]), block mapping ([`BlockMapper`]), the block
//! transport ([`BlockIo`]) and the codec ([`Codec`]). The [`mem`] module
//! implements all of them in memory.
//!
//! # Example
//!
//! ```
//! use pagestride_core::mem::{ExtentTree, MemDisk, MemPageCache};
//! use pagestride_core::{
//!     CachePage, CompressorBuilder, DeviceId, Inode, StrideReadScheduler, StrideWriter, PAGE_SIZE,
//! };
//! use std::sync::Arc;
//!
//! let compressor = CompressorBuilder::new().build();
//! let tree = Arc::new(ExtentTree::new(DeviceId(0)));
//! let disk = Arc::new(MemDisk::default());
//!
//! // Write a 4-page stride.
//! let cache = Arc::new(MemPageCache::new());
//! let inode = Inode::new(1, 4 * PAGE_SIZE as u64, cache.clone());
//! let pages: Vec<_> = (0..4)
//!     .map(|i| CachePage::with_contents(i, &[i as u8; PAGE_SIZE]).unwrap())
//!     .collect();
//! let writer = StrideWriter::new(compressor.clone(), tree.clone(), disk.clone());
//! writer.write_stride(&inode, &pages).unwrap().wait();
//!
//! // Read it back through a cold cache.
//! let cold = Inode::new(1, 4 * PAGE_SIZE as u64, Arc::new(MemPageCache::new()));
//! let reader = StrideReadScheduler::new(tree, disk, compressor);
//! let data = reader.read_range(&cold, 0, 4).unwrap();
//! assert_eq!(&data[3 * PAGE_SIZE..], &[3u8; PAGE_SIZE][..]);
//! ```

#![warn(missing_docs)]
#![deny(clippy::panic)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

mod cache;
pub mod codec;
mod completion;
mod error;
pub mod io;
pub mod lz4;
pub mod mapping;
pub mod mem;
mod page;
pub mod run;
pub mod scheduler;
mod stats;
pub mod stride;
pub mod workspace;
pub mod writeback;

pub use cache::{Inode, PageCache};
pub use codec::{Algorithm, Codec, Lz4Codec, StoreCodec};
pub use error::{Confusion, Error, ErrorKind, Result};
pub use io::{BlockIo, DeviceId, IoRequest};
pub use mapping::{BlockMapper, MapMode, Mapping, PageOutcome, ReadState};
pub use page::{
    CachePage, HeapAllocator, PageAllocator, PageBuf, PageFlags, PageRef, LENGTH_HEADER_LEN,
    PAGE_SHIFT, PAGE_SIZE, STRIDE_LEN,
};
pub use run::{CompressedRun, Direction, Placement, RunOutcome, RunState};
pub use scheduler::{ReadConfig, ReadReport, StrideReadScheduler};
pub use stats::CompressionStats;
pub use stride::{CompressorBuilder, EncodedRun, Padding, StrideCompressor};
pub use workspace::Workspace;
pub use writeback::{StrideWriter, WritebackSummary};
