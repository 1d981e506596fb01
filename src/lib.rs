//! # pagestride
//!
//! Stride-based page compression for filesystem page-cache I/O.
//!
//! This is the workspace root crate that re-exports core functionality.
//! For direct usage, depend on individual sub-crates:
//!
//! - [`pagestride-core`] - stride codec, compressed runs, batched read path
//! - [`pagestride-cli`] - CLI tool (`pagestride` binary)

pub use pagestride_core::*;
