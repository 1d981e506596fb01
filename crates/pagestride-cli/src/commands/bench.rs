//! Benchmark command for stride compression throughput.

use crate::output::OutputFormat;
use clap::Args;
use pagestride_core::{Algorithm, CompressorBuilder, EncodedRun, Padding, PAGE_SIZE};
use serde::Serialize;
use std::time::Instant;

/// Arguments for the bench command.
#[derive(Args)]
pub struct BenchArgs {
    /// Number of strides to compress.
    #[arg(short, long, default_value = "1000")]
    pub strides: usize,

    /// Pages per stride (1-16).
    #[arg(long, default_value = "16", value_parser = clap::value_parser!(u8).range(1..=16))]
    pub stride_pages: u8,

    /// Algorithm to benchmark (lz4, none, all).
    #[arg(short, long, default_value = "all")]
    pub algorithm: String,

    /// Data pattern (zero, random, text, mixed).
    #[arg(short = 'p', long, default_value = "mixed")]
    pub pattern: String,
}

/// Results for one algorithm.
#[derive(Debug, Serialize)]
pub struct BenchResult {
    /// Algorithm name.
    pub algorithm: String,
    /// Compression throughput in GB/s.
    pub compress_gbps: f64,
    /// Decompression throughput in GB/s.
    pub decompress_gbps: f64,
    /// Input bytes per on-disk byte.
    pub ratio: f64,
    /// Strides that needed worst-case padding.
    pub expanded: usize,
}

fn algorithms(name: &str) -> anyhow::Result<Vec<Algorithm>> {
    if name == "all" {
        Ok(vec![Algorithm::Lz4, Algorithm::None])
    } else {
        Ok(vec![name.parse()?])
    }
}

/// Run the benchmark for every selected algorithm.
pub fn run_bench(args: &BenchArgs) -> anyhow::Result<Vec<BenchResult>> {
    let stride_len = usize::from(args.stride_pages) * PAGE_SIZE;
    let strides = generate_strides(args.strides, stride_len, &args.pattern)?;
    let total_bytes = (strides.len() * stride_len) as f64;

    let mut results = Vec::new();
    for algo in algorithms(&args.algorithm)? {
        let compressor = CompressorBuilder::new().algorithm(algo).build();

        let start = Instant::now();
        let runs = strides
            .iter()
            .map(|s| compressor.compress_bytes(s))
            .collect::<pagestride_core::Result<Vec<EncodedRun>>>()?;
        let compress_time = start.elapsed();

        let start = Instant::now();
        for run in &runs {
            compressor.decode_run(&run.pages, run.len)?;
        }
        let decompress_time = start.elapsed();

        let disk_bytes: usize = runs.iter().map(|r| r.pages.len() * PAGE_SIZE).sum();
        results.push(BenchResult {
            algorithm: crate::image::algorithm_name(algo).to_string(),
            compress_gbps: total_bytes / compress_time.as_secs_f64().max(1e-9) / 1e9,
            decompress_gbps: total_bytes / decompress_time.as_secs_f64().max(1e-9) / 1e9,
            ratio: total_bytes / disk_bytes.max(1) as f64,
            expanded: runs.iter().filter(|r| r.padding == Padding::WorstCase).count(),
        });
    }
    Ok(results)
}

/// Run compression benchmarks and print the results.
pub fn bench(args: &BenchArgs, format: OutputFormat) -> anyhow::Result<()> {
    let results = run_bench(args)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Raw => {
            for r in &results {
                println!(
                    "{} {:.3} {:.3} {:.3} {}",
                    r.algorithm, r.compress_gbps, r.decompress_gbps, r.ratio, r.expanded
                );
            }
        }
        OutputFormat::Table => {
            println!("pagestride Stride Benchmark");
            println!("===========================");
            println!("Strides: {} x {} pages", args.strides, args.stride_pages);
            println!("Pattern: {}", args.pattern);
            println!();
            println!(
                "{:<10} {:>14} {:>14} {:>9} {:>9}",
                "Algorithm", "Compress", "Decompress", "Ratio", "Expanded"
            );
            println!("{}", "-".repeat(60));
            for r in &results {
                println!(
                    "{:<10} {:>9.2} GB/s {:>9.2} GB/s {:>8.2}x {:>9}",
                    r.algorithm, r.compress_gbps, r.decompress_gbps, r.ratio, r.expanded
                );
            }
        }
    }
    Ok(())
}

fn generate_strides(count: usize, len: usize, pattern: &str) -> anyhow::Result<Vec<Vec<u8>>> {
    const TEXT: &[u8] = b"The quick brown fox jumps over the lazy dog. ";
    let mut rng_state = 12345u64;
    let mut random = |len: usize| -> Vec<u8> {
        (0..len)
            .map(|_| {
                rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
                (rng_state >> 33) as u8
            })
            .collect()
    };

    (0..count)
        .map(|i| -> anyhow::Result<Vec<u8>> {
            let stride = match (pattern, i % 4) {
                ("zero", _) | ("mixed", 0) => vec![0u8; len],
                ("random", _) | ("mixed", 1) => random(len),
                ("text", _) | ("mixed", 3) => TEXT.iter().copied().cycle().take(len).collect(),
                ("mixed", _) => (0..len).map(|j| (j % 16) as u8).collect(),
                (other, _) => anyhow::bail!("unknown pattern: {other}"),
            };
            Ok(stride)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pattern: &str, algorithm: &str) -> BenchArgs {
        BenchArgs { strides: 8, stride_pages: 4, algorithm: algorithm.to_string(), pattern: pattern.to_string() }
    }

    #[test]
    fn test_generate_mixed() {
        let strides = generate_strides(4, PAGE_SIZE, "mixed").unwrap();
        assert!(strides[0].iter().all(|&b| b == 0));
        assert_eq!(strides[2][17], 1);
        assert!(generate_strides(1, PAGE_SIZE, "bogus").is_err());
    }

    #[test]
    fn test_bench_random_expands() {
        let results = run_bench(&args("random", "lz4")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].expanded, 8);
        assert!(results[0].ratio < 1.0);
    }

    #[test]
    fn test_bench_all_algorithms() {
        let results = run_bench(&args("zero", "all")).unwrap();
        let names: Vec<&str> = results.iter().map(|r| r.algorithm.as_str()).collect();
        assert_eq!(names, vec!["lz4", "none"]);
        assert!(results[0].ratio > 3.0);
        assert!(run_bench(&args("zero", "zstd")).is_err());
    }
}
