#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `daemon` is the image transfer service itself: a ticket authority, a
//! streaming transfer engine, and two blocking HTTP listeners. The
//! data-plane listener streams image bytes to and from remote clients; the
//! control listener takes ticket lifecycle commands from the local
//! controller over a trusted socket.
//!
//! # Design
//!
//! One thread per connection, blocking I/O throughout. Per-operation work is
//! dominated by disk and network waits, so parallel workers beat an event
//! loop here and keep every handler a straight-line function. Shared state
//! is confined to the [`auth::Authority`] ticket map behind a reader/writer
//! lock and is only touched in short critical sections; streaming loops
//! never hold it.
//!
//! Request flow: [`server`] accepts and spawns, [`http`] parses,
//! [`handlers`] dispatch on path and method, [`auth`] authorizes and
//! accounts, [`ops`] moves bytes between the socket and a
//! [`storage::Backend`], and [`errors`] translates every failure into the
//! one JSON error body clients see. OS errors propagate unchanged from the
//! backends; the HTTP boundary is the single place they become status codes.
//!
//! # Invariants
//!
//! - A connection owns its backend; Keep-Alive requests for the same ticket
//!   reuse it, a different ticket replaces it.
//! - `connections` and the transferred range merge are updated on success
//!   and on every error path.
//! - Ticket deletion while transfers are in flight flips the cancel flag;
//!   operations observe it between chunks and finish with 410.

pub mod auth;
pub mod clock;
pub mod config;
pub mod cors;
pub mod errors;
pub mod handlers;
pub mod http;
pub mod ops;
pub mod profiler;
pub mod server;
pub mod tls;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::auth::Authority;
use crate::config::Config;
use crate::profiler::Profiler;
use crate::server::{Listener, Shutdown};

/// Daemon version reported by `GET /info/`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state injected into every handler.
pub struct App {
    /// Loaded configuration.
    pub config: Config,
    /// The ticket authority.
    pub auth: Authority,
    /// Process-wide profiler service.
    pub profiler: Profiler,
}

impl App {
    /// Creates the application state from a configuration.
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            auth: Authority::new(),
            profiler: Profiler::new(),
        })
    }
}

/// Errors that prevent the daemon from starting.
#[derive(Debug, Error)]
pub enum StartError {
    /// A listener could not be bound.
    #[error("cannot bind {name} listener: {source}")]
    Bind {
        /// "daemon" or "control".
        name: &'static str,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TLS was enabled but could not be configured.
    #[error(transparent)]
    Tls(#[from] tls::TlsError),
}

/// A running daemon: both listeners, the sweeper, and the shutdown flag.
pub struct Daemon {
    app: Arc<App>,
    shutdown: Arc<Shutdown>,
    threads: Vec<JoinHandle<()>>,
    data_port: Option<u16>,
    control_port: Option<u16>,
}

impl Daemon {
    /// Binds both listeners and starts serving.
    pub fn start(config: Config) -> Result<Self, StartError> {
        let app = App::new(config);
        let shutdown = Arc::new(Shutdown::new());
        let mut threads = Vec::new();

        let data_listener = match app.config.daemon.transport.as_str() {
            "unix" => Listener::bind_unix(&app.config.daemon.socket),
            _ => Listener::bind_tcp(&app.config.daemon.host, app.config.daemon.port),
        }
        .map_err(|source| StartError::Bind {
            name: "daemon",
            source,
        })?;
        let data_port = data_listener.local_port();

        let tls_config = if app.config.tls.enable {
            Some(tls::server_config(&app.config.tls)?)
        } else {
            None
        };

        let control_listener = match app.config.control.transport.as_str() {
            "tcp" => Listener::bind_tcp("127.0.0.1", app.config.control.port),
            _ => Listener::bind_unix(&app.config.control.socket),
        }
        .map_err(|source| StartError::Bind {
            name: "control",
            source,
        })?;
        let control_port = control_listener.local_port();

        info!(
            version = VERSION,
            data = ?data_port,
            control = ?control_port,
            tls = tls_config.is_some(),
            "starting imageio daemon"
        );

        threads.push(spawn_listener(
            "data-plane",
            data_listener,
            Arc::clone(&app),
            handlers::data_plane,
            tls_config,
            Arc::clone(&shutdown),
        ));
        threads.push(spawn_listener(
            "control",
            control_listener,
            Arc::clone(&app),
            handlers::control,
            None,
            Arc::clone(&shutdown),
        ));
        threads.push(spawn_sweeper(Arc::clone(&app), Arc::clone(&shutdown)));

        Ok(Self {
            app,
            shutdown,
            threads,
            data_port,
            control_port,
        })
    }

    /// The data-plane TCP port, when bound over TCP.
    #[must_use]
    pub const fn data_port(&self) -> Option<u16> {
        self.data_port
    }

    /// The control TCP port, when bound over TCP.
    #[must_use]
    pub const fn control_port(&self) -> Option<u16> {
        self.control_port
    }

    /// The shared application state.
    #[must_use]
    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    /// The shutdown flag; trigger it to stop the daemon.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Stops accepting, drains connections, and joins the service threads.
    pub fn stop(self) {
        self.shutdown.trigger();
        for thread in self.threads {
            if thread.join().is_err() {
                warn!("service thread panicked");
            }
        }
        info!("imageio daemon stopped");
    }
}

fn spawn_listener(
    name: &'static str,
    listener: Listener,
    app: Arc<App>,
    router: server::Router,
    tls: Option<Arc<rustls::ServerConfig>>,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(e) = server::serve(listener, app, router, tls, shutdown) {
            error!(name, "listener failed: {e}");
        }
    })
}

fn spawn_sweeper(app: Arc<App>, shutdown: Arc<Shutdown>) -> JoinHandle<()> {
    let interval = Duration::from_secs(app.config.daemon.sweep_interval);
    std::thread::spawn(move || {
        while !shutdown.wait_timeout(interval) {
            app.auth.sweep();
        }
    })
}
