#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `cli` implements `imageioctl`, the admin tool for a running imageio
//! daemon. It speaks plain HTTP to the daemon's control listener, over the
//! UNIX socket or localhost TCP, whichever the daemon config selects, and
//! maps every failure to a one-line message and exit code 1.
//!
//! # Design
//!
//! [`frontend`] owns the clap command tree and maps each subcommand onto
//! one [`control::Client`] call. The client is deliberately small: the
//! control API is a handful of fixed routes with tiny JSON bodies, so it
//! writes requests by hand and parses responses with `httparse`, the same
//! parser the daemon uses.

pub mod control;
pub mod frontend;
