//! In-memory collaborators.
//!
//! These implement the page cache, block mapper, block transport and page
//! allocator traits on plain memory. Tests use them to drive the read and
//! write paths deterministically; the CLI uses them to work on disk images.

mod alloc;
mod cache;
mod disk;
mod extent;

pub use alloc::FailingAllocator;
pub use cache::MemPageCache;
pub use disk::{CompletionMode, MemDisk, PendingIo};
pub use extent::{Extent, ExtentTree};
