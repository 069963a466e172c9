#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `nbd` is a blocking Network Block Device client used to serve images
//! exported by a remote block server (typically `qemu-nbd` or a qemu
//! process). It implements the fixed-newstyle handshake, structured replies,
//! and the `base:allocation` metadata context needed to enumerate allocation
//! and zero extents without reading the image.
//!
//! # Design
//!
//! The crate splits along protocol phases:
//!
//! - [`proto`] holds wire constants, flag sets, and reply framing shared by
//!   the handshake and transmission phases.
//! - [`client`] drives a single connection: option haggling at connect time,
//!   then read/write/zero/trim/flush/block-status commands.
//! - [`extents`] normalizes the liberal block-status replies the protocol
//!   permits into a clean, monotonically increasing extent stream.
//!
//! Servers are surprisingly creative about block-status replies: a reply may
//! describe a single extent, stop short of the requested range, or overshoot
//! it with the final extent. [`extents::extents`] absorbs all of that and is
//! the one place where upstream-protocol robustness lives.
//!
//! # Errors
//!
//! All operations return [`Error`]. Command failures reported by the server
//! preserve the NBD errno and message; protocol violations that cannot be
//! clipped away close the connection.

pub mod client;
pub mod extents;
pub mod proto;

use std::io;

use thiserror::Error;

/// Errors returned by the NBD client.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure talking to the server.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The server violated the NBD protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server failed a command, preserving its errno and message.
    #[error("server error {errno}: {message}")]
    Server {
        /// POSIX-style error number from the reply.
        errno: u32,
        /// Human readable message, possibly empty.
        message: String,
    },

    /// The server does not support a required feature.
    #[error("unsupported by server: {0}")]
    Unsupported(String),
}

/// Result alias for NBD operations.
pub type Result<T> = std::result::Result<T, Error>;

pub use client::Client;
pub use extents::{extents, Extent, ExtentSource};
