//! Image URL parsing.
//!
//! Tickets name their backing image with a URL:
//!
//! - `file:/absolute/path` names a regular file or block device;
//! - `nbd:unix:/socket:exportname=name` names an NBD export over a UNIX
//!   socket, qemu style;
//! - `nbd://host:port/name` names an NBD export over TCP;
//! - `memory:` names an in-process buffer, used by tests.

use std::path::PathBuf;

use url::Url;

use crate::{Error, Result};

/// Location of an NBD export.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NbdAddress {
    /// UNIX socket path plus export name.
    Unix {
        /// Socket path.
        path: PathBuf,
        /// Export name; empty selects the default export.
        export: String,
    },
    /// TCP host and port plus export name.
    Tcp {
        /// Server host.
        host: String,
        /// Server port.
        port: u16,
        /// Export name; empty selects the default export.
        export: String,
    },
}

/// Parsed image URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageUrl {
    /// Local file or block device.
    File(PathBuf),
    /// Remote NBD export.
    Nbd(NbdAddress),
    /// In-process buffer.
    Memory,
}

impl ImageUrl {
    /// Parses a ticket image URL.
    pub fn parse(text: &str) -> Result<Self> {
        let url = Url::parse(text).map_err(|e| Error::InvalidUrl(format!("{text:?}: {e}")))?;
        match url.scheme() {
            "file" => {
                let path = if let Some(host) = url.host_str() {
                    // file://host/path is not meaningful for a local daemon.
                    if !host.is_empty() {
                        return Err(Error::InvalidUrl(format!(
                            "{text:?}: file url must not name a host"
                        )));
                    }
                    url.path().to_string()
                } else {
                    url.path().to_string()
                };
                if path.is_empty() || !path.starts_with('/') {
                    return Err(Error::InvalidUrl(format!(
                        "{text:?}: file path must be absolute"
                    )));
                }
                Ok(Self::File(PathBuf::from(path)))
            }
            "nbd" => parse_nbd(text, &url),
            "memory" => Ok(Self::Memory),
            other => Err(Error::InvalidUrl(format!("unsupported scheme {other:?}"))),
        }
    }
}

fn parse_nbd(text: &str, url: &Url) -> Result<ImageUrl> {
    // nbd://host:port/export
    if let Some(host) = url.host_str() {
        let port = url
            .port()
            .ok_or_else(|| Error::InvalidUrl(format!("{text:?}: nbd url requires a port")))?;
        let export = url.path().trim_start_matches('/').to_string();
        return Ok(ImageUrl::Nbd(NbdAddress::Tcp {
            host: host.to_string(),
            port,
            export,
        }));
    }

    // nbd:unix:/socket:exportname=name, matching qemu's spelling.
    let rest = url.path();
    let rest = rest
        .strip_prefix("unix:")
        .ok_or_else(|| Error::InvalidUrl(format!("{text:?}: expected nbd:unix: or nbd://")))?;
    let (path, export) = match rest.split_once(":exportname=") {
        Some((path, export)) => (path, export.to_string()),
        None => (rest, String::new()),
    };
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::InvalidUrl(format!(
            "{text:?}: nbd socket path must be absolute"
        )));
    }
    Ok(ImageUrl::Nbd(NbdAddress::Unix {
        path: PathBuf::from(path),
        export,
    }))
}

#[cfg(test)]
mod tests {
    use super::{ImageUrl, NbdAddress};
    use std::path::PathBuf;

    #[test]
    fn parse_file_url() {
        assert_eq!(
            ImageUrl::parse("file:/var/tmp/disk.img").unwrap(),
            ImageUrl::File(PathBuf::from("/var/tmp/disk.img"))
        );
        assert_eq!(
            ImageUrl::parse("file:///var/tmp/disk.img").unwrap(),
            ImageUrl::File(PathBuf::from("/var/tmp/disk.img"))
        );
    }

    #[test]
    fn parse_memory_url() {
        assert_eq!(ImageUrl::parse("memory:").unwrap(), ImageUrl::Memory);
    }

    #[test]
    fn parse_nbd_unix_url() {
        assert_eq!(
            ImageUrl::parse("nbd:unix:/run/nbd.sock:exportname=sda").unwrap(),
            ImageUrl::Nbd(NbdAddress::Unix {
                path: PathBuf::from("/run/nbd.sock"),
                export: "sda".to_string(),
            })
        );
        assert_eq!(
            ImageUrl::parse("nbd:unix:/run/nbd.sock").unwrap(),
            ImageUrl::Nbd(NbdAddress::Unix {
                path: PathBuf::from("/run/nbd.sock"),
                export: String::new(),
            })
        );
    }

    #[test]
    fn parse_nbd_tcp_url() {
        assert_eq!(
            ImageUrl::parse("nbd://localhost:10809/sda").unwrap(),
            ImageUrl::Nbd(NbdAddress::Tcp {
                host: "localhost".to_string(),
                port: 10809,
                export: "sda".to_string(),
            })
        );
    }

    #[test]
    fn reject_unknown_urls() {
        assert!(ImageUrl::parse("http://example.com/image").is_err());
        assert!(ImageUrl::parse("nbd:tcp:localhost").is_err());
        assert!(ImageUrl::parse("not a url").is_err());
    }
}
