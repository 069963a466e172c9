//! TLS termination for the data-plane listener.
//!
//! The daemon accepts TLS 1.2 and 1.3. SSLv2, SSLv3, TLS 1.0 and TLS 1.1
//! are rejected in every mode: rustls does not implement them, which is
//! exactly the guarantee the configuration promises.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tracing::warn;

use crate::config::TlsConfig;

/// Errors preparing the TLS acceptor.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Certificate or key file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// No usable key material in the files.
    #[error("no {kind} found in {path}")]
    Missing {
        /// "certificate" or "private key".
        kind: &'static str,
        /// Offending path.
        path: String,
    },

    /// rustls rejected the material.
    #[error("tls configuration failed: {0}")]
    Config(#[from] rustls::Error),
}

/// Builds the rustls server configuration from the `[tls]` section.
pub fn server_config(config: &TlsConfig) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    if config.enable_tls1_1 {
        // The legacy knob is kept for config compatibility only.
        warn!("enable_tls1_1 is set but this build supports only TLS 1.2+");
    }

    let certs = load_certs(config)?;
    let key = load_key(config)?;

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(server))
}

fn load_certs(config: &TlsConfig) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let path = config.cert_file.display().to_string();
    let file = File::open(&config.cert_file).map_err(|source| TlsError::Read {
        path: path.clone(),
        source,
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Read {
            path: path.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::Missing {
            kind: "certificate",
            path,
        });
    }
    Ok(certs)
}

fn load_key(config: &TlsConfig) -> Result<PrivateKeyDer<'static>, TlsError> {
    let path = config.key_file.display().to_string();
    let file = File::open(&config.key_file).map_err(|source| TlsError::Read {
        path: path.clone(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| TlsError::Read {
            path: path.clone(),
            source,
        })?
        .ok_or(TlsError::Missing {
            kind: "private key",
            path,
        })
}
