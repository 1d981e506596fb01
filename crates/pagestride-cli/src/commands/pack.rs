//! Pack a file into a stride-compressed image.

use crate::config::Config;
use crate::image::{Image, FILE_INO};
use anyhow::Context;
use clap::Args;
use pagestride_core::mem::{Extent, ExtentTree, MemDisk, MemPageCache};
use pagestride_core::{
    CachePage, CompressorBuilder, DeviceId, Inode, PageRef, RunOutcome, StrideWriter, PAGE_SIZE,
    STRIDE_LEN,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the pack command.
#[derive(Args)]
pub struct PackArgs {
    /// File to pack.
    pub input: PathBuf,

    /// Image directory to create.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Store pages uncompressed as plain extents.
    #[arg(long)]
    pub raw: bool,

    /// Compress all-zero strides instead of leaving holes.
    #[arg(long)]
    pub keep_zeros: bool,
}

/// Totals reported by [`pack`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PackSummary {
    /// Pages in the input.
    pub pages: usize,
    /// Strides written.
    pub strides: usize,
    /// Strides left as holes.
    pub holes: usize,
    /// Device blocks used.
    pub disk_blocks: u64,
}

/// Split `pages` into strides of `stride_pages`, never crossing a
/// 16-page-aligned boundary.
fn stride_windows(pages: &[PageRef], stride_pages: usize) -> Vec<Vec<PageRef>> {
    pages
        .chunks(STRIDE_LEN)
        .flat_map(|window| window.chunks(stride_pages).map(<[PageRef]>::to_vec))
        .collect()
}

fn is_zero(stride: &[PageRef]) -> bool {
    stride.iter().all(|p| p.with_data(|d| d.iter().all(|&b| b == 0)))
}

/// Pack a file into an image.
pub fn pack(args: &PackArgs, config: &Config) -> anyhow::Result<PackSummary> {
    let data = std::fs::read(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let algorithm = config.algorithm()?;
    let compressor = CompressorBuilder::new().algorithm(algorithm).build();
    let tree = Arc::new(ExtentTree::new(DeviceId(0)));
    let disk = Arc::new(MemDisk::default().with_completion(config.completion.into()));
    disk.set_max_pages(config.max_pages_per_request);
    let inode = Inode::new(FILE_INO, data.len() as u64, Arc::new(MemPageCache::new()));

    let pages = data
        .chunks(PAGE_SIZE)
        .enumerate()
        .map(|(i, chunk)| CachePage::with_contents(i as u64, chunk))
        .collect::<pagestride_core::Result<Vec<_>>>()?;
    let mut summary = PackSummary { pages: pages.len(), ..PackSummary::default() };

    if args.raw {
        let mut padded = data;
        padded.resize(pages.len() * PAGE_SIZE, 0);
        disk.write_at(0, &padded)?;
        if !pages.is_empty() {
            tree.insert(FILE_INO, Extent::plain(0, pages.len() as u64, 0));
        }
    } else {
        let (zero, strides): (Vec<_>, Vec<_>) = stride_windows(&pages, config.stride_pages)
            .into_iter()
            .partition(|s| !args.keep_zeros && is_zero(s));
        summary.holes = zero.len();

        let writer = StrideWriter::new(compressor, tree.clone(), disk.clone());
        for (run, stride) in writer.write_strides(&inode, &strides).into_iter().zip(&strides) {
            let start = stride[0].index();
            let run = run.with_context(|| format!("compressing stride at page {start}"))?;
            match run.wait() {
                RunOutcome::Written => summary.strides += 1,
                outcome => anyhow::bail!("writing stride at page {start} failed: {outcome:?}"),
            }
        }
    }

    summary.disk_blocks = tree.next_free();
    let image = Image::from_parts(algorithm, inode.size(), &tree, disk.to_bytes());
    image.save(&args.output)?;
    tracing::info!(
        input = %args.input.display(),
        pages = summary.pages,
        strides = summary.strides,
        holes = summary.holes,
        disk_blocks = summary.disk_blocks,
        "file packed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(n: u64) -> Vec<PageRef> {
        (0..n).map(|i| CachePage::try_new(i).unwrap()).collect()
    }

    #[test]
    fn test_stride_windows_stay_aligned() {
        let windows = stride_windows(&pages(40), 5);
        let starts: Vec<u64> = windows.iter().map(|w| w[0].index()).collect();
        assert_eq!(starts, vec![0, 5, 10, 15, 16, 21, 26, 31, 32, 37]);
        assert!(windows.iter().all(|w| w[0].index() / 16 == w[w.len() - 1].index() / 16));
    }

    #[test]
    fn test_pack_leaves_zero_strides_as_holes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let mut data = vec![0u8; 48 * PAGE_SIZE];
        data[20 * PAGE_SIZE] = 1;
        std::fs::write(&input, &data).unwrap();

        let args = PackArgs { input, output: dir.path().join("img"), raw: false, keep_zeros: false };
        let summary = pack(&args, &Config::default()).unwrap();
        assert_eq!(summary, PackSummary { pages: 48, strides: 1, holes: 2, disk_blocks: 1 });

        let image = Image::load(&args.output).unwrap();
        assert_eq!(image.manifest.extents.len(), 1);
        assert_eq!(image.manifest.extents[0].logical, 16);
    }

    #[test]
    fn test_pack_raw() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        std::fs::write(&input, vec![7u8; 3 * PAGE_SIZE + 10]).unwrap();

        let args = PackArgs { input, output: dir.path().join("img"), raw: true, keep_zeros: false };
        let summary = pack(&args, &Config::default()).unwrap();
        assert_eq!(summary.disk_blocks, 4);
        let image = Image::load(&args.output).unwrap();
        assert_eq!(image.manifest.extents[0].disk_blocks, None);
        assert_eq!(image.disk.len(), 4 * PAGE_SIZE);
    }
}
