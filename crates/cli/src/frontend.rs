//! Command-line frontend for `imageioctl`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use daemon::config::Config;
use thiserror::Error;

use crate::control::{Client, ClientError};

/// Default configuration file, shared with the daemon.
pub const DEFAULT_CONF: &str = "/etc/imageio/daemon.conf";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors reported to the user as one line on stderr.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration problems.
    #[error("cannot load configuration: {0}")]
    Config(#[from] daemon::config::ConfigError),

    /// Local file problems (ticket file).
    #[error("cannot read {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The ticket file is not valid JSON.
    #[error("invalid ticket file: {0}")]
    BadTicket(#[from] serde_json::Error),

    /// Control API failures.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Control the imageio daemon.
#[derive(Debug, Parser)]
#[command(name = "imageioctl", about = "Control the imageio daemon", version)]
pub struct Cli {
    /// Configuration file read for the control listener address.
    #[arg(short = 'c', long = "conf", global = true)]
    conf: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a ticket from a JSON file.
    AddTicket {
        /// Ticket filename.
        filename: PathBuf,
    },
    /// Show a ticket's status.
    ShowTicket {
        /// Ticket id.
        ticket_id: String,
    },
    /// Modify a ticket.
    ModTicket {
        /// Ticket id.
        ticket_id: String,
        /// New timeout in seconds.
        #[arg(long)]
        timeout: u64,
    },
    /// Delete a ticket.
    DelTicket {
        /// Ticket id.
        ticket_id: String,
    },
    /// Start server profiling.
    StartProfile,
    /// Stop server profiling.
    StopProfile,
}

/// Runs one parsed invocation.
pub fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.conf.as_deref())?;
    let mut client = Client::connect(&config.control, CONNECT_TIMEOUT)?;

    match cli.command {
        Command::AddTicket { filename } => {
            let text = std::fs::read_to_string(&filename).map_err(|source| CliError::Read {
                path: filename.clone(),
                source,
            })?;
            let ticket: serde_json::Value = serde_json::from_str(&text)?;
            client.add_ticket(&ticket)?;
        }
        Command::ShowTicket { ticket_id } => {
            let info = client.get_ticket(&ticket_id)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::ModTicket { ticket_id, timeout } => {
            client.mod_ticket(&ticket_id, timeout)?;
        }
        Command::DelTicket { ticket_id } => {
            client.del_ticket(&ticket_id)?;
        }
        Command::StartProfile => client.start_profile()?,
        Command::StopProfile => client.stop_profile()?,
    }
    Ok(())
}

// The default config path may not exist on a dev box; fall back to the
// built-in defaults so imageioctl still reaches a default-configured daemon.
fn load_config(conf: Option<&std::path::Path>) -> Result<Config, CliError> {
    match conf {
        Some(path) => Ok(Config::load(path)?),
        None => {
            let default = std::path::Path::new(DEFAULT_CONF);
            if default.exists() {
                Ok(Config::load(default)?)
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{load_config, Cli, Command};
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn parse_add_ticket() {
        let cli = Cli::try_parse_from(["imageioctl", "add-ticket", "ticket.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::AddTicket { ref filename } if filename.as_os_str() == "ticket.json"
        ));
    }

    #[test]
    fn parse_mod_ticket_requires_timeout() {
        assert!(Cli::try_parse_from(["imageioctl", "mod-ticket", "abc"]).is_err());
        let cli =
            Cli::try_parse_from(["imageioctl", "mod-ticket", "abc", "--timeout", "600"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::ModTicket { ref ticket_id, timeout: 600 } if ticket_id == "abc"
        ));
    }

    #[test]
    fn parse_global_conf_flag() {
        let cli =
            Cli::try_parse_from(["imageioctl", "del-ticket", "abc", "-c", "/tmp/x.conf"]).unwrap();
        assert_eq!(cli.conf.as_deref(), Some(std::path::Path::new("/tmp/x.conf")));
    }

    #[test]
    fn parse_profile_commands() {
        let cli = Cli::try_parse_from(["imageioctl", "start-profile"]).unwrap();
        assert!(matches!(cli.command, Command::StartProfile));
        let cli = Cli::try_parse_from(["imageioctl", "stop-profile"]).unwrap();
        assert!(matches!(cli.command, Command::StopProfile));
    }

    #[test]
    fn load_config_reads_control_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[control]\ntransport = tcp\nport = 9999").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.control.transport, "tcp");
        assert_eq!(config.control.port, 9999);
    }

    #[test]
    fn missing_default_config_falls_back_to_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.daemon.port, 54322);
    }
}
