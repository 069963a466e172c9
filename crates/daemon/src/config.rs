//! INI-style configuration loader.
//!
//! The daemon is configured entirely from a config file; environment
//! variables are not consulted. The file uses ini format with the sections
//! mirrored by the [`Config`] struct:
//!
//! ```ini
//! [daemon]
//! port = 54322
//! buffer_size = 1048576
//!
//! [tls]
//! enable = true
//! cert_file = /etc/imageio/pki/cert.pem
//! key_file = /etc/imageio/pki/key.pem
//!
//! [control]
//! transport = unix
//! socket = /run/imageio.sock
//! ```
//!
//! Unknown sections and options are ignored so configs can carry options
//! for newer versions. Values that fail to parse are errors.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors produced while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the file.
    #[error("cannot read config {path}: {source}")]
    Read {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A line was not `key = value`, `[section]`, a comment, or blank.
    #[error("malformed line {line}: {text:?}")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
        /// Offending text.
        text: String,
    },

    /// A value did not parse for its option.
    #[error("invalid value for {section}.{option}: {value:?}")]
    InvalidValue {
        /// Section name.
        section: String,
        /// Option name.
        option: String,
        /// Offending value.
        value: String,
    },
}

/// `[daemon]` section: the data-plane listener and transfer engine.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Listener transport: `"tcp"` or `"unix"`.
    pub transport: String,
    /// Bind host for tcp transport.
    pub host: String,
    /// Bind port for tcp transport.
    pub port: u16,
    /// Socket path for unix transport.
    pub socket: PathBuf,
    /// Transfer buffer size in bytes.
    pub buffer_size: usize,
    /// Open file backends with `O_DIRECT`.
    pub direct_io: bool,
    /// Per-request idle read timeout in seconds.
    pub read_timeout: u64,
    /// Interval between ticket sweeper runs in seconds.
    pub sweep_interval: u64,
    /// Log filter directive, `tracing_subscriber` syntax.
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            host: "".to_string(),
            port: 54322,
            socket: PathBuf::from("/run/imageio/daemon.sock"),
            buffer_size: 1024 * 1024,
            direct_io: false,
            read_timeout: 60,
            sweep_interval: 60,
            log_level: "info".to_string(),
        }
    }
}

/// `[tls]` section: data-plane TLS termination.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Whether the data-plane listener terminates TLS.
    pub enable: bool,
    /// PEM certificate chain.
    pub cert_file: PathBuf,
    /// PEM private key.
    pub key_file: PathBuf,
    /// Compatibility knob for TLS 1.1 peers. This build cannot honor it;
    /// see the startup warning.
    pub enable_tls1_1: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            cert_file: PathBuf::from("/etc/imageio/pki/cert.pem"),
            key_file: PathBuf::from("/etc/imageio/pki/key.pem"),
            enable_tls1_1: false,
        }
    }
}

/// `[control]` section: the trusted control listener.
#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Listener transport: `"unix"` or `"tcp"`.
    pub transport: String,
    /// Socket path for unix transport. Access control is filesystem
    /// permissions on this path.
    pub socket: PathBuf,
    /// Bind port for tcp transport, bound to localhost only.
    pub port: u16,
    /// Default seconds to wait for active connections when deleting a
    /// ticket.
    pub remove_timeout: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            transport: "unix".to_string(),
            socket: PathBuf::from("/run/imageio/control.sock"),
            port: 54324,
            remove_timeout: 1,
        }
    }
}

/// Complete daemon configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// `[daemon]` section.
    pub daemon: DaemonConfig,
    /// `[tls]` section.
    pub tls: TlsConfig,
    /// `[control]` section.
    pub control: ControlConfig,
}

impl Config {
    /// Loads configuration from a file, applying it over the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::default();
        config.apply(&text)?;
        Ok(config)
    }

    /// Applies ini-format text over the current values.
    pub fn apply(&mut self, text: &str) -> Result<(), ConfigError> {
        let mut section = String::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine {
                    line: index + 1,
                    text: raw.to_string(),
                });
            };
            self.set(&section, key.trim(), value.trim())?;
        }
        Ok(())
    }

    fn set(&mut self, section: &str, option: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            section: section.to_string(),
            option: option.to_string(),
            value: value.to_string(),
        };
        match (section, option) {
            ("daemon", "transport") => self.daemon.transport = parse_transport(value).ok_or_else(invalid)?,
            ("daemon", "host") => self.daemon.host = value.to_string(),
            ("daemon", "port") => self.daemon.port = value.parse().map_err(|_| invalid())?,
            ("daemon", "socket") => self.daemon.socket = PathBuf::from(value),
            ("daemon", "buffer_size") => {
                self.daemon.buffer_size = value.parse().map_err(|_| invalid())?;
                if self.daemon.buffer_size == 0 {
                    return Err(invalid());
                }
            }
            ("daemon", "direct_io") => self.daemon.direct_io = parse_bool(value).ok_or_else(invalid)?,
            ("daemon", "read_timeout") => self.daemon.read_timeout = value.parse().map_err(|_| invalid())?,
            ("daemon", "sweep_interval") => {
                self.daemon.sweep_interval = value.parse().map_err(|_| invalid())?;
                if self.daemon.sweep_interval == 0 {
                    return Err(invalid());
                }
            }
            ("daemon", "log_level") => self.daemon.log_level = value.to_string(),
            ("tls", "enable") => self.tls.enable = parse_bool(value).ok_or_else(invalid)?,
            ("tls", "cert_file") => self.tls.cert_file = PathBuf::from(value),
            ("tls", "key_file") => self.tls.key_file = PathBuf::from(value),
            ("tls", "enable_tls1_1") => self.tls.enable_tls1_1 = parse_bool(value).ok_or_else(invalid)?,
            ("control", "transport") => self.control.transport = parse_transport(value).ok_or_else(invalid)?,
            ("control", "socket") => self.control.socket = PathBuf::from(value),
            ("control", "port") => self.control.port = value.parse().map_err(|_| invalid())?,
            ("control", "remove_timeout") => {
                self.control.remove_timeout = value.parse().map_err(|_| invalid())?;
            }
            // Unknown sections and options are ignored.
            _ => {}
        }
        Ok(())
    }
}

fn parse_transport(value: &str) -> Option<String> {
    match value.to_ascii_lowercase().as_str() {
        transport @ ("tcp" | "unix") => Some(transport.to_string()),
        _ => None,
    }
}

// The same spellings configparser accepts.
fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError};
    use std::path::PathBuf;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.daemon.port, 54322);
        assert_eq!(config.daemon.buffer_size, 1024 * 1024);
        assert!(!config.tls.enable);
        assert_eq!(config.control.transport, "unix");
    }

    #[test]
    fn apply_overrides_options() {
        let mut config = Config::default();
        config
            .apply(
                "[daemon]\n\
                 port = 10000\n\
                 buffer_size = 65536\n\
                 direct_io = yes\n\
                 \n\
                 # comment\n\
                 [control]\n\
                 transport = tcp\n\
                 port = 10001\n",
            )
            .unwrap();
        assert_eq!(config.daemon.port, 10000);
        assert_eq!(config.daemon.buffer_size, 65536);
        assert!(config.daemon.direct_io);
        assert_eq!(config.control.transport, "tcp");
        assert_eq!(config.control.port, 10001);
    }

    #[test]
    fn unknown_sections_and_options_are_ignored() {
        let mut config = Config::default();
        config
            .apply("[future]\nshiny = yes\n[daemon]\nunknown_option = 1\n")
            .unwrap();
        assert_eq!(config.daemon.port, 54322);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        let err = config.apply("[daemon]\nport = not-a-port\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = config.apply("[daemon]\nbuffer_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = config.apply("[tls]\nenable = maybe\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let mut config = Config::default();
        let err = config.apply("[daemon]\nthis is not an option\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedLine { line: 2, .. }));
    }

    #[test]
    fn tls_paths_are_applied() {
        let mut config = Config::default();
        config
            .apply("[tls]\nenable = true\ncert_file = /tmp/c.pem\nkey_file = /tmp/k.pem\n")
            .unwrap();
        assert!(config.tls.enable);
        assert_eq!(config.tls.cert_file, PathBuf::from("/tmp/c.pem"));
        assert_eq!(config.tls.key_file, PathBuf::from("/tmp/k.pem"));
    }
}
