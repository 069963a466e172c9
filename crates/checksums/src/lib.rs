#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `checksums` provides the block-hashed image fingerprint used to compare
//! disk images at block granularity. The fingerprint is stable across sparse
//! and dense representations of the same byte sequence, so an image uploaded
//! through the daemon can be verified against a local copy regardless of how
//! either side stores its holes.
//!
//! # Design
//!
//! The [`blkhash`] module implements the algorithm: the image is split into
//! fixed-size blocks (4 MiB by default), every block is hashed on its own,
//! and a second, outer hash is fed the per-block digests. A block known to be
//! all zeros contributes a digest that is computed once and reused, which
//! lets callers with extent information fingerprint a mostly-sparse terabyte
//! image while hashing almost no bytes.
//!
//! # Invariants
//!
//! - Hashing raw bytes and hashing with the zero-block shortcut produce the
//!   same fingerprint for the same logical content.
//! - The final partial block is zero-padded to the block size before hashing,
//!   so an image's fingerprint does not depend on whether the tail was
//!   written or truncated into existence.
//!
//! # Examples
//!
//! ```
//! use checksums::blkhash::{Algorithm, Blkhash};
//!
//! let mut dense = Blkhash::new(Algorithm::Blake2b256, 64 * 1024);
//! dense.update(&vec![0u8; 128 * 1024]);
//!
//! let mut sparse = Blkhash::new(Algorithm::Blake2b256, 64 * 1024);
//! sparse.zero(128 * 1024);
//!
//! assert_eq!(dense.finalize_hex(), sparse.finalize_hex());
//! ```

pub mod blkhash;

pub use blkhash::{Algorithm, Blkhash, Checksum, UnknownAlgorithm};
