//! Stride compression and read-path benchmarks using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagestride_core::mem::{ExtentTree, MemDisk, MemPageCache};
use pagestride_core::{
    CachePage, CompressorBuilder, DeviceId, Inode, PageRef, StrideReadScheduler, StrideWriter,
    PAGE_SIZE, STRIDE_LEN,
};
use std::sync::Arc;

fn generate_stride(kind: &str) -> Vec<u8> {
    let len = STRIDE_LEN * PAGE_SIZE;
    match kind {
        "zero" => vec![0u8; len],
        "text" => b"the quick brown fox jumps over the lazy dog\n".iter().copied().cycle().take(len).collect(),
        _ => {
            let mut state = 12345u64;
            (0..len)
                .map(|_| {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    (state >> 33) as u8
                })
                .collect()
        }
    }
}

fn benchmark_compress_stride(c: &mut Criterion) {
    let compressor = CompressorBuilder::new().build();
    let mut group = c.benchmark_group("compress_stride");
    group.throughput(Throughput::Bytes((STRIDE_LEN * PAGE_SIZE) as u64));

    for kind in ["zero", "text", "random"] {
        let data = generate_stride(kind);
        group.bench_with_input(BenchmarkId::new("lz4", kind), &data, |b, data| {
            b.iter(|| black_box(compressor.compress_bytes(data).unwrap()));
        });

        let run = compressor.compress_bytes(&data).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", kind), &run, |b, run| {
            b.iter(|| black_box(compressor.decode_run(&run.pages, run.len).unwrap()));
        });
    }
    group.finish();
}

fn benchmark_read_range(c: &mut Criterion) {
    const STRIDES: usize = 8;
    let pages = STRIDES * STRIDE_LEN;
    let size = (pages * PAGE_SIZE) as u64;
    let data = generate_stride("text").repeat(STRIDES);

    let compressor = CompressorBuilder::new().build();
    let tree = Arc::new(ExtentTree::new(DeviceId(0)));
    let disk = Arc::new(MemDisk::default());
    let inode = Inode::new(1, size, Arc::new(MemPageCache::new()));
    let all: Vec<PageRef> = data
        .chunks(PAGE_SIZE)
        .enumerate()
        .map(|(i, chunk)| CachePage::with_contents(i as u64, chunk).unwrap())
        .collect();
    let strides: Vec<Vec<PageRef>> = all.chunks(STRIDE_LEN).map(<[PageRef]>::to_vec).collect();
    let writer = StrideWriter::new(compressor.clone(), tree.clone(), disk.clone());
    for run in writer.write_strides(&inode, &strides) {
        run.unwrap().wait();
    }

    let scheduler = StrideReadScheduler::new(tree, disk, compressor);
    let mut group = c.benchmark_group("read_range");
    group.throughput(Throughput::Bytes(size));
    group.bench_function("cold_cache", |b| {
        b.iter(|| {
            let cold = Inode::new(1, size, Arc::new(MemPageCache::new()));
            black_box(scheduler.read_range(&cold, 0, pages).unwrap())
        });
    });
    group.finish();
}

criterion_group!(benches, benchmark_compress_stride, benchmark_read_range);
criterion_main!(benches);
