//! Pluggable byte-stream codecs used for stride compression.

use crate::lz4;
use crate::{Error, Result};

/// Compression algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// No compression (payload stored as-is behind the length header).
    None,
    /// LZ4 fast compression.
    #[default]
    Lz4,
}

impl Algorithm {
    /// Compression-type tag recorded in a run descriptor.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
        }
    }

    /// Resolve a tag back to an algorithm.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }

    /// The codec implementing this algorithm.
    #[must_use]
    pub fn codec(self) -> Box<dyn Codec> {
        match self {
            Self::None => Box::new(StoreCodec),
            Self::Lz4 => Box::new(Lz4Codec),
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lz4" => Ok(Self::Lz4),
            "none" | "store" => Ok(Self::None),
            other => Err(Error::InvalidInput(format!("unknown algorithm: {other}"))),
        }
    }
}

/// A byte-stream compressor with bounded-output decompression.
pub trait Codec: Send + Sync {
    /// Algorithm implemented by this codec.
    fn algorithm(&self) -> Algorithm;

    /// Largest possible output for `len` input bytes.
    fn worst_case_len(&self, len: usize) -> usize;

    /// Working memory, in 32-bit words, needed by [`Codec::compress`].
    fn scratch_words(&self) -> usize;

    /// Compress `input` into `output`, returning the compressed length.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec rejects the input or `output` is too
    /// small. The codec never writes past `output`.
    fn compress(&self, input: &[u8], output: &mut [u8], scratch: &mut [u32]) -> Result<usize>;

    /// Decompress `input` into `output`, returning the decompressed length.
    ///
    /// # Errors
    ///
    /// Returns an error for corrupted input or if the result would not fit.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

/// LZ4 block codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Lz4
    }

    fn worst_case_len(&self, len: usize) -> usize {
        lz4::worst_case_len(len)
    }

    fn scratch_words(&self) -> usize {
        lz4::constants::HASH_SIZE_U32
    }

    fn compress(&self, input: &[u8], output: &mut [u8], scratch: &mut [u32]) -> Result<usize> {
        lz4::compress_into(input, output, scratch)
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        lz4::decompress(input, output)
    }
}

/// Identity codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreCodec;

impl Codec for StoreCodec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::None
    }

    fn worst_case_len(&self, len: usize) -> usize {
        len
    }

    fn scratch_words(&self) -> usize {
        0
    }

    fn compress(&self, input: &[u8], output: &mut [u8], _scratch: &mut [u32]) -> Result<usize> {
        let available = output.len();
        let dst = output.get_mut(..input.len()).ok_or(Error::BufferTooSmall {
            needed: input.len(),
            available,
        })?;
        dst.copy_from_slice(input);
        Ok(input.len())
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        self.compress(input, output, &mut [])
    }
}
