//! Inspect the runs stored in an image.

use crate::image::{ExtentRecord, Image};
use crate::output::{format_size, OutputFormat};
use anyhow::Context;
use clap::Args;
use pagestride_core::stride::read_length_header;
use pagestride_core::{CompressorBuilder, PageBuf, StrideCompressor, PAGE_SIZE};
use serde::Serialize;
use std::path::PathBuf;

/// Arguments for the inspect command.
#[derive(Args)]
pub struct InspectArgs {
    /// Image directory to inspect.
    pub image: PathBuf,

    /// Decode every compressed run and report failures.
    #[arg(long)]
    pub verify: bool,
}

/// One row of the inspect report.
#[derive(Debug, Serialize)]
pub struct RunInfo {
    /// First logical page.
    pub start_page: u64,
    /// Logical pages covered.
    pub pages: u64,
    /// First physical block.
    pub physical: u64,
    /// Blocks used on disk.
    pub disk_blocks: u64,
    /// Whether the extent is a compressed run.
    pub compressed: bool,
    /// Payload length from the run's header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_len: Option<usize>,
    /// Logical bytes per on-disk byte.
    pub ratio: f64,
    /// Decode result, when verification was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

/// Whole-image totals.
#[derive(Debug, Serialize)]
pub struct InspectReport {
    /// Algorithm recorded in the manifest.
    pub algorithm: String,
    /// Packed file size.
    pub file_size: u64,
    /// Per-extent details.
    pub runs: Vec<RunInfo>,
    /// Logical pages stored in extents.
    pub stored_pages: u64,
    /// Device blocks referenced by extents.
    pub disk_blocks: u64,
}

impl InspectReport {
    /// Stored pages per device block.
    pub fn ratio(&self) -> f64 {
        if self.disk_blocks == 0 {
            return 1.0;
        }
        self.stored_pages as f64 / self.disk_blocks as f64
    }
}

fn decode(compressor: &StrideCompressor, bytes: &[u8], pages: u64) -> anyhow::Result<()> {
    let bufs = bytes
        .chunks(PAGE_SIZE)
        .map(|chunk| {
            let mut buf = PageBuf::try_new()?;
            buf.as_mut_slice().copy_from_slice(chunk);
            Ok(buf)
        })
        .collect::<pagestride_core::Result<Vec<_>>>()?;
    compressor.decode_run(&bufs, usize::try_from(pages)? * PAGE_SIZE)?;
    Ok(())
}

fn describe(image: &Image, record: &ExtentRecord, compressor: Option<&StrideCompressor>) -> anyhow::Result<RunInfo> {
    let bytes = image
        .extent_bytes(record)
        .with_context(|| format!("extent at block {} outside device", record.logical))?;
    let disk_blocks = record.disk_blocks.unwrap_or(record.len);
    let header_len = match record.disk_blocks {
        Some(_) => Some(read_length_header(bytes)?),
        None => None,
    };
    let verified = match (compressor, record.disk_blocks) {
        (Some(compressor), Some(_)) => {
            let result = decode(compressor, bytes, record.len);
            if let Err(e) = &result {
                tracing::warn!(start = record.logical, error = %e, "run failed to decode");
            }
            Some(result.is_ok())
        }
        _ => None,
    };
    Ok(RunInfo {
        start_page: record.logical,
        pages: record.len,
        physical: record.physical,
        disk_blocks,
        compressed: record.disk_blocks.is_some(),
        header_len,
        ratio: record.len as f64 / disk_blocks as f64,
        verified,
    })
}

/// Build the report for an image.
pub fn build_report(args: &InspectArgs) -> anyhow::Result<InspectReport> {
    let image = Image::load(&args.image)?;
    let compressor = if args.verify {
        Some(CompressorBuilder::new().algorithm(image.algorithm()?).build())
    } else {
        None
    };
    let runs = image
        .manifest
        .extents
        .iter()
        .map(|record| describe(&image, record, compressor.as_deref()))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(InspectReport {
        algorithm: image.manifest.algorithm.clone(),
        file_size: image.manifest.file_size,
        stored_pages: runs.iter().map(|r| r.pages).sum(),
        disk_blocks: runs.iter().map(|r| r.disk_blocks).sum(),
        runs,
    })
}

/// Print the runs stored in an image.
pub fn inspect(args: &InspectArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = build_report(args)?;
    match format {
        OutputFormat::Table => print_table(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Raw => {
            for r in &report.runs {
                println!(
                    "{} {} {} {} {} {}",
                    r.start_page,
                    r.pages,
                    r.physical,
                    r.disk_blocks,
                    r.header_len.map_or_else(|| "-".to_string(), |l| l.to_string()),
                    r.verified.map_or("-", |ok| if ok { "ok" } else { "bad" })
                );
            }
        }
    }
    if report.runs.iter().any(|r| r.verified == Some(false)) {
        anyhow::bail!("image holds runs that do not decode");
    }
    Ok(())
}

fn print_table(report: &InspectReport) {
    println!(
        "{} {} ({} pages in {} blocks, {:.2}x)",
        report.algorithm,
        format_size(report.file_size),
        report.stored_pages,
        report.disk_blocks,
        report.ratio()
    );
    println!(
        "{:>8} {:>6} {:>10} {:>6} {:>8} {:>7} {:>6}",
        "START", "PAGES", "PHYSICAL", "BLOCKS", "HEADER", "RATIO", "CHECK"
    );
    for r in &report.runs {
        println!(
            "{:>8} {:>6} {:>10} {:>6} {:>8} {:>6.2}x {:>6}",
            r.start_page,
            r.pages,
            r.physical,
            r.disk_blocks,
            r.header_len.map_or_else(|| "plain".to_string(), |l| l.to_string()),
            r.ratio,
            r.verified.map_or("-", |ok| if ok { "ok" } else { "bad" })
        );
    }
}
