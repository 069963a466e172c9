//! Block-hashed image fingerprint with a zero-block fast path.

use blake2::Blake2b;
use digest::consts::U32;
use digest::{Digest, DynDigest};
use sha1::Sha1;
use thiserror::Error;

/// Default block size, matching the granularity used by image transfers.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

type Blake2b256 = Blake2b<U32>;

/// The digest algorithm used for both the per-block and the outer hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Algorithm {
    /// BLAKE2b with a 32-byte digest, the default.
    Blake2b256,
    /// SHA-1, kept for callers comparing against legacy fingerprints.
    Sha1,
}

/// Returned when parsing an unsupported algorithm name.
#[derive(Debug, Error)]
#[error("unknown checksum algorithm: {0:?}")]
pub struct UnknownAlgorithm(pub String);

impl Algorithm {
    /// Returns the canonical lowercase name of the algorithm.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Blake2b256 => "blake2b",
            Self::Sha1 => "sha1",
        }
    }

    /// Parses an algorithm name as it appears in requests and tool output.
    pub fn parse(name: &str) -> Result<Self, UnknownAlgorithm> {
        match name {
            "blake2b" => Ok(Self::Blake2b256),
            "sha1" => Ok(Self::Sha1),
            other => Err(UnknownAlgorithm(other.to_string())),
        }
    }

    fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            Self::Blake2b256 => Box::new(Blake2b256::new()),
            Self::Sha1 => Box::new(Sha1::new()),
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::Blake2b256
    }
}

/// A computed fingerprint together with its parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Checksum {
    /// Algorithm name (`"blake2b"`, `"sha1"`).
    pub algorithm: &'static str,
    /// Block size the image was split by.
    pub block_size: u64,
    /// Hex-encoded outer digest.
    pub checksum: String,
}

/// Streaming block hasher.
///
/// Feed image bytes with [`update`](Self::update) and known-zero byte counts
/// with [`zero`](Self::zero), in image order. Both paths produce identical
/// fingerprints for identical logical content.
pub struct Blkhash {
    algorithm: Algorithm,
    block_size: usize,
    outer: Box<dyn DynDigest>,
    // Digest of a full zero block, computed on first use.
    zero_digest: Option<Box<[u8]>>,
    // Buffered tail of the current, not yet complete block.
    pending: Vec<u8>,
}

impl Blkhash {
    /// Creates a hasher for the given algorithm and block size.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    #[must_use]
    pub fn new(algorithm: Algorithm, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must not be zero");
        Self {
            algorithm,
            block_size,
            outer: algorithm.hasher(),
            zero_digest: None,
            pending: Vec::new(),
        }
    }

    /// Creates a hasher with the default algorithm and [`BLOCK_SIZE`].
    #[must_use]
    pub fn default_hasher() -> Self {
        Self::new(Algorithm::default(), BLOCK_SIZE)
    }

    /// Consumes image bytes at the current position.
    pub fn update(&mut self, mut data: &[u8]) {
        if !self.pending.is_empty() {
            let take = data.len().min(self.block_size - self.pending.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.flush_pending_if_full();
        }
        while data.len() >= self.block_size {
            let (block, rest) = data.split_at(self.block_size);
            self.digest_block(block);
            data = rest;
        }
        self.pending.extend_from_slice(data);
    }

    /// Consumes `count` bytes known to be zero without hashing them.
    ///
    /// Whole aligned blocks are replaced by the precomputed zero-block
    /// digest; bytes that fall inside a partial block are buffered as zeros
    /// so mixed data/zero blocks hash correctly.
    pub fn zero(&mut self, mut count: u64) {
        if !self.pending.is_empty() {
            let room = (self.block_size - self.pending.len()) as u64;
            let take = count.min(room) as usize;
            self.pending.resize(self.pending.len() + take, 0);
            count -= take as u64;
            self.flush_pending_if_full();
        }

        let full_blocks = count / self.block_size as u64;
        if full_blocks > 0 {
            let digest = self.zero_block_digest();
            for _ in 0..full_blocks {
                self.outer.update(&digest);
            }
        }

        let tail = (count % self.block_size as u64) as usize;
        if tail > 0 {
            self.pending.resize(tail, 0);
        }
    }

    /// Finishes the hash, zero-padding the final partial block, and returns
    /// the raw outer digest.
    #[must_use]
    pub fn finalize(mut self) -> Vec<u8> {
        if !self.pending.is_empty() {
            self.pending.resize(self.block_size, 0);
            let block = std::mem::take(&mut self.pending);
            self.digest_block(&block);
        }
        self.outer.finalize().to_vec()
    }

    /// Finishes the hash and returns the hex-encoded outer digest.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }

    /// Finishes the hash into a [`Checksum`] record.
    #[must_use]
    pub fn finalize_checksum(self) -> Checksum {
        let algorithm = self.algorithm.name();
        let block_size = self.block_size as u64;
        Checksum {
            algorithm,
            block_size,
            checksum: self.finalize_hex(),
        }
    }

    fn flush_pending_if_full(&mut self) {
        if self.pending.len() == self.block_size {
            let block = std::mem::take(&mut self.pending);
            self.digest_block(&block);
        }
    }

    fn digest_block(&mut self, block: &[u8]) {
        let mut inner = self.algorithm.hasher();
        inner.update(block);
        let digest = inner.finalize();
        self.outer.update(&digest);
    }

    fn zero_block_digest(&mut self) -> Box<[u8]> {
        if self.zero_digest.is_none() {
            let mut inner = self.algorithm.hasher();
            inner.update(&vec![0u8; self.block_size]);
            self.zero_digest = Some(inner.finalize());
        }
        self.zero_digest.clone().expect("digest just computed")
    }
}
