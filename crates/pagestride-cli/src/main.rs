//! pagestride CLI - pack files into stride-compressed images and read them
//! back through the batched read path.
//!
//! # Usage
//!
//! ```bash
//! # Pack a file into an image directory
//! pagestride pack data.bin -o data.img
//!
//! # List its runs, decoding each one
//! pagestride inspect data.img --verify
//!
//! # Read it back
//! pagestride unpack data.img -o data.out
//! ```

#![deny(missing_docs)]
#![deny(clippy::panic)]
#![warn(clippy::all, clippy::pedantic)]

mod commands;
mod config;
mod image;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// pagestride: stride-compressed page images
#[derive(Parser)]
#[command(name = "pagestride")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Output format
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a file into an image
    Pack(commands::PackArgs),

    /// Unpack an image into a file
    Unpack(commands::UnpackArgs),

    /// List the runs stored in an image
    Inspect(commands::InspectArgs),

    /// Run stride compression benchmarks
    Bench(commands::BenchArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Pack(args) => {
            let summary = commands::pack(&args, &config)?;
            println!(
                "Packed {} pages into {} strides ({} holes), {} disk blocks",
                summary.pages, summary.strides, summary.holes, summary.disk_blocks
            );
        }
        Commands::Unpack(args) => {
            let bytes = commands::unpack(&args, &config)?;
            println!("Wrote {} to {}", output::format_size(bytes), args.output.display());
        }
        Commands::Inspect(args) => commands::inspect(&args, cli.format)?,
        Commands::Bench(args) => commands::bench(&args, cli.format)?,
    }
    Ok(())
}
