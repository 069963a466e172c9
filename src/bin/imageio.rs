//! The imageio daemon binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use daemon::config::Config;
use daemon::Daemon;
use tracing_subscriber::EnvFilter;

static TERMINATE: AtomicBool = AtomicBool::new(false);

// Only async-signal-safe work here: set the flag, let main act on it.
extern "C" fn on_signal(_signal: libc::c_int) {
    TERMINATE.store(true, Ordering::Release);
}

/// Transfer disk images over HTTP(S).
#[derive(Debug, Parser)]
#[command(name = "imageio", version)]
struct Cli {
    /// Configuration file.
    #[arg(short = 'c', long = "conf", default_value = "/etc/imageio/daemon.conf")]
    conf: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = if cli.conf.exists() {
        match Config::load(&cli.conf) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("imageio: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    install_signal_handlers();

    let daemon = match Daemon::start(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("imageio: {e}");
            return ExitCode::FAILURE;
        }
    };

    while !TERMINATE.load(Ordering::Acquire) && !daemon.stopping() {
        std::thread::sleep(Duration::from_millis(100));
    }
    daemon.stop();
    ExitCode::SUCCESS
}

#[allow(unsafe_code)]
fn install_signal_handlers() {
    let handler: extern "C" fn(libc::c_int) = on_signal;
    let handler = handler as usize as libc::sighandler_t;
    // SAFETY: installing a handler that only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}
