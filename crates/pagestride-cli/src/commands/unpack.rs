//! Unpack an image back into a file through the read scheduler.

use crate::config::Config;
use crate::image::{Image, FILE_INO};
use anyhow::Context;
use clap::Args;
use pagestride_core::mem::{MemDisk, MemPageCache};
use pagestride_core::{CompressorBuilder, Inode, StrideReadScheduler, PAGE_SIZE};
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the unpack command.
#[derive(Args)]
pub struct UnpackArgs {
    /// Image directory to read.
    pub image: PathBuf,

    /// File to write.
    #[arg(short, long)]
    pub output: PathBuf,
}

/// Read every page of the packed file and write it to `args.output`.
/// Returns the number of bytes written.
pub fn unpack(args: &UnpackArgs, config: &Config) -> anyhow::Result<u64> {
    let image = Image::load(&args.image)?;
    let file_size = image.manifest.file_size;
    let compressor = CompressorBuilder::new().algorithm(image.algorithm()?).build();
    let tree = Arc::new(image.extent_tree());
    let disk = Arc::new(MemDisk::from_bytes(image.disk).with_completion(config.completion.into()));
    disk.set_max_pages(config.max_pages_per_request);

    let inode = Inode::new(FILE_INO, file_size, Arc::new(MemPageCache::new()));
    let scheduler = StrideReadScheduler::with_config(tree, disk.clone(), compressor.clone(), config.read_config());
    let pages = usize::try_from(file_size.div_ceil(PAGE_SIZE as u64))?;
    let mut data = scheduler
        .read_range(&inode, 0, pages)
        .with_context(|| format!("reading {}", args.image.display()))?;
    data.truncate(usize::try_from(file_size)?);

    std::fs::write(&args.output, &data).with_context(|| format!("writing {}", args.output.display()))?;
    let stats = compressor.stats();
    tracing::info!(
        output = %args.output.display(),
        bytes = file_size,
        runs = stats.strides_decompressed,
        requests = disk.requests_submitted(),
        "file unpacked"
    );
    Ok(file_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::pack::{pack, PackArgs};
    use crate::config::Completion;

    fn sample_data() -> Vec<u8> {
        let mut data: Vec<u8> =
            b"stride compression round trip\n".iter().copied().cycle().take(37 * PAGE_SIZE + 123).collect();
        data[10 * PAGE_SIZE..14 * PAGE_SIZE].fill(0);
        data
    }

    fn roundtrip(config: &Config, raw: bool) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let data = sample_data();
        std::fs::write(&input, &data).unwrap();

        let img = dir.path().join("img");
        pack(&PackArgs { input, output: img.clone(), raw, keep_zeros: false }, config).unwrap();
        let output = dir.path().join("output.bin");
        let written = unpack(&UnpackArgs { image: img, output: output.clone() }, config).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(&output).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_default() {
        roundtrip(&Config::default(), false);
    }

    #[test]
    fn test_roundtrip_raw() {
        roundtrip(&Config::default(), true);
    }

    #[test]
    fn test_roundtrip_threaded_small_requests() {
        let config = Config {
            stride_pages: 3,
            max_pages_per_request: 1,
            completion: Completion::Threaded,
            ..Config::default()
        };
        roundtrip(&config, false);
    }

    #[test]
    fn test_roundtrip_store_without_readahead() {
        let config = Config { algorithm: "none".to_string(), readahead: false, ..Config::default() };
        roundtrip(&config, false);
    }
}
