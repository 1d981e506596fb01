//! Compression statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for stride compression operations.
#[derive(Debug, Clone, Default)]
pub struct CompressionStats {
    /// Total strides compressed.
    pub strides_compressed: u64,
    /// Strides whose compressed form was larger than the input.
    pub strides_expanded: u64,
    /// Runs decompressed successfully.
    pub strides_decompressed: u64,
    /// Runs whose decompression failed.
    pub decompress_failures: u64,
    /// Total bytes before compression.
    pub bytes_in: u64,
    /// Total on-disk bytes after compression, header and padding included.
    pub bytes_out: u64,
    /// Total compression time in nanoseconds.
    pub compress_time_ns: u64,
    /// Total decompression time in nanoseconds.
    pub decompress_time_ns: u64,
}

impl CompressionStats {
    /// Create new empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the overall compression ratio.
    #[must_use]
    pub fn overall_ratio(&self) -> f64 {
        if self.bytes_out == 0 {
            return 1.0;
        }
        self.bytes_in as f64 / self.bytes_out as f64
    }

    /// Get compression throughput in bytes per second.
    #[must_use]
    pub fn compress_throughput(&self) -> f64 {
        if self.compress_time_ns == 0 {
            return 0.0;
        }
        self.bytes_in as f64 / (self.compress_time_ns as f64 / 1e9)
    }
}

#[derive(Debug, Default)]
pub(crate) struct CompressorStats {
    strides_compressed: AtomicU64,
    strides_expanded: AtomicU64,
    strides_decompressed: AtomicU64,
    decompress_failures: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    compress_time_ns: AtomicU64,
    decompress_time_ns: AtomicU64,
}

impl CompressorStats {
    pub(crate) fn record_compress(&self, bytes_in: usize, bytes_out: usize, expanded: bool, ns: u64) {
        self.strides_compressed.fetch_add(1, Ordering::Relaxed);
        if expanded {
            self.strides_expanded.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_in.fetch_add(bytes_in as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out as u64, Ordering::Relaxed);
        self.compress_time_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub(crate) fn record_decompress(&self, ok: bool, ns: u64) {
        if ok {
            self.strides_decompressed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.decompress_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.decompress_time_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CompressionStats {
        CompressionStats {
            strides_compressed: self.strides_compressed.load(Ordering::Relaxed),
            strides_expanded: self.strides_expanded.load(Ordering::Relaxed),
            strides_decompressed: self.strides_decompressed.load(Ordering::Relaxed),
            decompress_failures: self.decompress_failures.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            compress_time_ns: self.compress_time_ns.load(Ordering::Relaxed),
            decompress_time_ns: self.decompress_time_ns.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.strides_compressed,
            &self.strides_expanded,
            &self.strides_decompressed,
            &self.decompress_failures,
            &self.bytes_in,
            &self.bytes_out,
            &self.compress_time_ns,
            &self.decompress_time_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
