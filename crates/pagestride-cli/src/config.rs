//! Configuration for image packing and reading.

use anyhow::{bail, Context};
use pagestride_core::mem::CompletionMode;
use pagestride_core::{Algorithm, ReadConfig, STRIDE_LEN};
use serde::Deserialize;
use std::path::Path;

/// How the in-memory disk completes requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    /// On the submitting thread.
    #[default]
    Inline,
    /// On the rayon pool.
    Threaded,
}

impl From<Completion> for CompletionMode {
    fn from(c: Completion) -> Self {
        match c {
            Completion::Inline => Self::Inline,
            Completion::Threaded => Self::Threaded,
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Compression algorithm (`lz4` or `none`).
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Pages per stride, 1..=16.
    #[serde(default = "default_stride_pages")]
    pub stride_pages: usize,

    /// Largest request the disk accepts, in pages.
    #[serde(default = "default_max_pages_per_request")]
    pub max_pages_per_request: usize,

    /// Extend reads with read-ahead.
    #[serde(default = "default_readahead")]
    pub readahead: bool,

    /// Request completion mode.
    #[serde(default)]
    pub completion: Completion,
}

fn default_algorithm() -> String {
    "lz4".to_string()
}

fn default_stride_pages() -> usize {
    STRIDE_LEN
}

fn default_max_pages_per_request() -> usize {
    32
}

fn default_readahead() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            stride_pages: default_stride_pages(),
            max_pages_per_request: default_max_pages_per_request(),
            readahead: default_readahead(),
            completion: Completion::default(),
        }
    }
}

impl Config {
    /// Load and validate a TOML config file, or the defaults when `path`
    /// is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=STRIDE_LEN).contains(&self.stride_pages) {
            bail!("stride_pages must be in 1..={STRIDE_LEN}, got {}", self.stride_pages);
        }
        if self.max_pages_per_request == 0 {
            bail!("max_pages_per_request must be at least 1");
        }
        self.algorithm()?;
        Ok(())
    }

    /// The configured algorithm.
    pub fn algorithm(&self) -> anyhow::Result<Algorithm> {
        Ok(self.algorithm.parse()?)
    }

    /// Scheduler settings derived from this config.
    pub fn read_config(&self) -> ReadConfig {
        ReadConfig { readahead: self.readahead, ..ReadConfig::default() }
    }
}
