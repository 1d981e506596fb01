//! On-disk image layout: a raw device file plus a JSON extent manifest.
//!
//! ```text
//! <image>/
//!   disk.img      device contents, 4 KiB blocks
//!   extents.json  file size, algorithm and extent table
//! ```

use anyhow::{bail, Context};
use pagestride_core::mem::{Extent, ExtentTree};
use pagestride_core::{Algorithm, DeviceId, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Device file name inside an image directory.
pub const DISK_FILE: &str = "disk.img";
/// Manifest file name inside an image directory.
pub const MANIFEST_FILE: &str = "extents.json";
/// Current manifest version.
pub const MANIFEST_VERSION: u32 = 1;

/// Inode number used for the single packed file.
pub const FILE_INO: u64 = 1;

/// One extent of the packed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRecord {
    /// First logical block.
    pub logical: u64,
    /// Logical blocks covered.
    pub len: u64,
    /// First physical block.
    pub physical: u64,
    /// On-disk blocks of a compressed run, absent for plain extents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_blocks: Option<u64>,
}

impl From<Extent> for ExtentRecord {
    fn from(e: Extent) -> Self {
        Self { logical: e.logical, len: e.len, physical: e.physical, disk_blocks: e.disk_blocks }
    }
}

impl From<ExtentRecord> for Extent {
    fn from(r: ExtentRecord) -> Self {
        match r.disk_blocks {
            Some(disk_blocks) => Extent::compressed(r.logical, r.len, r.physical, disk_blocks),
            None => Extent::plain(r.logical, r.len, r.physical),
        }
    }
}

/// Image metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest format version.
    pub version: u32,
    /// Algorithm the runs were compressed with.
    pub algorithm: String,
    /// Size of the packed file in bytes.
    pub file_size: u64,
    /// Extents in logical order.
    pub extents: Vec<ExtentRecord>,
}

/// A loaded image.
#[derive(Debug, Clone)]
pub struct Image {
    /// Image metadata.
    pub manifest: Manifest,
    /// Device contents.
    pub disk: Vec<u8>,
}

/// Name stored in the manifest for `algorithm`.
pub fn algorithm_name(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::None => "none",
        Algorithm::Lz4 => "lz4",
    }
}

impl Image {
    /// Build an image from a populated extent tree and device contents.
    pub fn from_parts(algorithm: Algorithm, file_size: u64, tree: &ExtentTree, disk: Vec<u8>) -> Self {
        let extents = tree.extents(FILE_INO).into_iter().map(ExtentRecord::from).collect();
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            algorithm: algorithm_name(algorithm).to_string(),
            file_size,
            extents,
        };
        Self { manifest, disk }
    }

    /// Read an image directory.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let manifest: Manifest =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", manifest_path.display()))?;
        if manifest.version != MANIFEST_VERSION {
            bail!("unsupported manifest version {}", manifest.version);
        }
        let disk_path = dir.join(DISK_FILE);
        let disk = std::fs::read(&disk_path).with_context(|| format!("reading {}", disk_path.display()))?;
        let image = Self { manifest, disk };
        image.check()?;
        Ok(image)
    }

    /// Write the image into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        std::fs::write(dir.join(DISK_FILE), &self.disk)?;
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_string_pretty(&self.manifest)?)?;
        tracing::info!(
            dir = %dir.display(),
            extents = self.manifest.extents.len(),
            disk_bytes = self.disk.len(),
            "image saved"
        );
        Ok(())
    }

    /// The algorithm named by the manifest.
    pub fn algorithm(&self) -> anyhow::Result<Algorithm> {
        Ok(self.manifest.algorithm.parse()?)
    }

    /// An extent tree holding the manifest's extents.
    pub fn extent_tree(&self) -> ExtentTree {
        let tree = ExtentTree::new(DeviceId(0));
        for record in &self.manifest.extents {
            tree.insert(FILE_INO, Extent::from(*record));
        }
        tree
    }

    /// The on-disk bytes of an extent.
    pub fn extent_bytes(&self, record: &ExtentRecord) -> Option<&[u8]> {
        let start = usize::try_from(record.physical).ok()? * PAGE_SIZE;
        let blocks = usize::try_from(record.disk_blocks.unwrap_or(record.len)).ok()?;
        self.disk.get(start..start + blocks * PAGE_SIZE)
    }

    /// Reject manifests whose extents overlap or point outside the device.
    fn check(&self) -> anyhow::Result<()> {
        let mut next_logical = 0;
        for record in &self.manifest.extents {
            if record.len == 0 {
                bail!("empty extent at block {}", record.logical);
            }
            if record.logical < next_logical {
                bail!("extent at block {} overlaps its predecessor", record.logical);
            }
            if self.extent_bytes(record).is_none() {
                bail!("extent at block {} lies outside {}", record.logical, DISK_FILE);
            }
            next_logical = record.logical + record.len;
        }
        let file_blocks = self.manifest.file_size.div_ceil(PAGE_SIZE as u64);
        if next_logical > file_blocks {
            bail!("extents reach block {next_logical} past end of file ({file_blocks} blocks)");
        }
        self.algorithm()?;
        Ok(())
    }
}
