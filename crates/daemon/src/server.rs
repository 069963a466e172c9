//! Blocking listeners and the per-connection exchange loop.
//!
//! One thread per connection. The listener accepts, wraps the socket in TLS
//! when configured, and hands it to [`Connection`], which parses request
//! heads, frames bodies (identity and chunked), and writes responses. The
//! accept loop polls a shutdown flag so the daemon can stop accepting,
//! drain active connections up to a deadline, and exit.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{title, Error, Failure};
use crate::http::{self, ParseStatus, Request};
use crate::App;

// How long shutdown waits for in-flight requests before giving up.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);
// Accept loop poll interval while checking the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(250);
// Largest chunk-size line we accept in a chunked body.
const MAX_CHUNK_LINE: usize = 256;

/// A handler table: dispatches one parsed request on one connection.
pub type Router = fn(&App, &mut Connection, &Request) -> Result<(), Failure>;

/// Cooperative shutdown flag with a waitable condition.
#[derive(Default)]
pub struct Shutdown {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes all waiters.
    pub fn trigger(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    /// Whether the flag is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Waits up to `timeout` for the flag; returns whether it is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        if *guard {
            return true;
        }
        let (guard, _) = self
            .cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// Counts live connection threads so shutdown can drain them.
#[derive(Default)]
struct Active {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Active {
    fn enter(self: &Arc<Self>) -> ActiveGuard {
        *self.lock() += 1;
        ActiveGuard {
            active: Arc::clone(self),
        }
    }

    fn wait_idle(&self, deadline: Instant) -> bool {
        let mut count = self.lock();
        while *count > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            count = self
                .idle
                .wait_timeout(count, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.count
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct ActiveGuard {
    active: Arc<Active>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut count = self.active.lock();
        *count -= 1;
        if *count == 0 {
            self.active.idle.notify_all();
        }
    }
}

/// One accepted client socket, possibly TLS-wrapped.
pub enum Stream {
    /// Plain TCP.
    Tcp(TcpStream),
    /// UNIX domain socket.
    Unix(UnixStream),
    /// TLS over TCP.
    Tls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        let timeout = Some(timeout);
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
            Self::Unix(stream) => stream.set_read_timeout(timeout),
            Self::Tls(stream) => stream.sock.set_read_timeout(timeout),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Unix(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Unix(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Unix(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// A bound listener for either address family.
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// UNIX socket listener.
    Unix(UnixListener),
}

impl Listener {
    /// Binds a TCP listener with address reuse and a deep backlog.
    pub fn bind_tcp(host: &str, port: u16) -> io::Result<Self> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let address: std::net::SocketAddr = format!("{host}:{port}")
            .parse()
            .or_else(|_| {
                // Hostname; resolve through the system.
                use std::net::ToSocketAddrs;
                (host, port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cannot resolve host"))
            })?;
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&address.into())?;
        socket.listen(128)?;
        Ok(Self::Tcp(socket.into()))
    }

    /// Binds a UNIX socket listener, replacing a stale socket file.
    ///
    /// Access control is delegated to filesystem permissions: the socket is
    /// created with mode 0660.
    pub fn bind_unix(path: &Path) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
        Ok(Self::Unix(listener))
    }

    /// The bound TCP port, for tests binding port 0.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok().map(|addr| addr.port()),
            Self::Unix(_) => None,
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(listener) => listener.set_nonblocking(nonblocking),
            Self::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok((Stream::Unix(stream), "unix".to_string()))
            }
        }
    }
}

/// Runs the accept loop until shutdown, serving each connection on its own
/// thread, then drains in-flight requests.
pub fn serve(
    listener: Listener,
    app: Arc<App>,
    router: Router,
    tls: Option<Arc<rustls::ServerConfig>>,
    shutdown: Arc<Shutdown>,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let active = Arc::new(Active::default());
    let read_timeout = Duration::from_secs(app.config.daemon.read_timeout.max(1));

    while !shutdown.is_set() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let stream = match &tls {
                    None => stream,
                    Some(config) => match wrap_tls(stream, config) {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(%peer, "tls setup failed: {e}");
                            continue;
                        }
                    },
                };
                if let Err(e) = stream.set_read_timeout(read_timeout) {
                    warn!(%peer, "cannot set read timeout: {e}");
                    continue;
                }
                let guard = active.enter();
                let app = Arc::clone(&app);
                std::thread::spawn(move || {
                    let _guard = guard;
                    let mut connection = Connection::new(stream, peer);
                    connection.serve(&app, router);
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                shutdown.wait_timeout(ACCEPT_POLL);
            }
            Err(e) => {
                error!("accept failed: {e}");
                shutdown.wait_timeout(ACCEPT_POLL);
            }
        }
    }

    info!("draining connections");
    if !active.wait_idle(Instant::now() + DRAIN_DEADLINE) {
        warn!("connections still active after drain deadline");
    }
    Ok(())
}

fn wrap_tls(stream: Stream, config: &Arc<rustls::ServerConfig>) -> io::Result<Stream> {
    let Stream::Tcp(tcp) = stream else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tls requires a tcp listener",
        ));
    };
    let conn = rustls::ServerConnection::new(Arc::clone(config))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(Stream::Tls(Box::new(rustls::StreamOwned::new(conn, tcp))))
}

enum BodyState {
    None,
    Length { remaining: u64 },
    Chunked { in_chunk: u64, done: bool },
}

/// One client connection: owns the socket, the read buffer, and the
/// per-exchange body and response state.
pub struct Connection {
    stream: Stream,
    peer: String,
    // Bytes read from the socket but not yet consumed.
    read_buf: Vec<u8>,
    body: BodyState,
    continue_pending: bool,
    http10: bool,
    response_started: bool,
    response_remaining: u64,
    close: bool,
    // Connection-scoped backend, reused across Keep-Alive requests for the
    // same ticket. The URL guards against a ticket deleted and re-added
    // with a different backing image while this connection was idle.
    pub(crate) backend: Option<(Uuid, storage::ImageUrl, Box<dyn storage::Backend>)>,
}

impl Connection {
    fn new(stream: Stream, peer: String) -> Self {
        Self {
            stream,
            peer,
            read_buf: Vec::new(),
            body: BodyState::None,
            continue_pending: false,
            http10: false,
            response_started: false,
            response_remaining: 0,
            close: false,
            backend: None,
        }
    }

    fn serve(&mut self, app: &App, router: Router) {
        loop {
            self.response_started = false;
            self.response_remaining = 0;
            self.body = BodyState::None;
            self.continue_pending = false;

            let request = match self.read_request() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(ReadError::Io(e)) => {
                    debug!(peer = %self.peer, "connection closed: {e}");
                    break;
                }
                Err(ReadError::Http(e)) => {
                    let _ = self.send_error(&e);
                    break;
                }
            };
            self.http10 = !request.version_11;
            self.close = !request.keep_alive();

            let result = self.dispatch(app, router, &request);
            match result {
                Ok(()) => {
                    if !self.response_started {
                        let error = Error::internal("handler produced no response");
                        error!(peer = %self.peer, method = %request.method, path = %request.path, %error, "request failed");
                        if self.send_error(&error).is_err() {
                            break;
                        }
                    }
                }
                Err(Failure::Response(e)) => {
                    if e.code >= 500 {
                        error!(peer = %self.peer, method = %request.method, path = %request.path, error = %e, "request failed");
                    } else {
                        info!(peer = %self.peer, method = %request.method, path = %request.path, error = %e, "request refused");
                    }
                    if self.response_started {
                        // Headers are on the wire; the only honest signal
                        // left is dropping the connection mid-body.
                        break;
                    }
                    if self.send_error(&e).is_err() {
                        break;
                    }
                }
                Err(Failure::Connection(e)) => {
                    debug!(peer = %self.peer, "client disconnected: {e}");
                    break;
                }
            }

            if self.response_remaining != 0 {
                // Short response body; the framing is broken.
                error!(peer = %self.peer, "handler wrote a short response");
                break;
            }
            if self.continue_pending {
                // The client is still waiting for 100 Continue, so the body
                // was never sent; there is nothing to drain and the
                // connection cannot be reused.
                break;
            }
            if self.drain_body().is_err() {
                break;
            }
            if self.close {
                break;
            }
        }
    }

    fn dispatch(&mut self, app: &App, router: Router, request: &Request) -> Result<(), Failure> {
        if !http::ALLOWED_METHODS.contains(&request.method.as_str()) {
            return Err(Error::method_not_allowed(format!(
                "invalid method {:?}",
                request.method
            ))
            .into());
        }
        self.prepare_body(request)?;
        router(app, self, request)
    }

    fn prepare_body(&mut self, request: &Request) -> Result<(), Error> {
        self.body = if request.chunked()? {
            BodyState::Chunked {
                in_chunk: 0,
                done: false,
            }
        } else {
            match request.content_length()? {
                Some(length) => BodyState::Length { remaining: length },
                None => BodyState::None,
            }
        };
        self.continue_pending =
            request.expects_continue() && !matches!(self.body, BodyState::None);
        Ok(())
    }

    fn read_request(&mut self) -> Result<Option<Request>, ReadError> {
        loop {
            if !self.read_buf.is_empty() {
                match http::parse_request(&self.read_buf).map_err(ReadError::Http)? {
                    ParseStatus::Complete(request, consumed) => {
                        self.read_buf.drain(..consumed);
                        return Ok(Some(request));
                    }
                    ParseStatus::Partial => {}
                }
                if self.read_buf.len() > http::MAX_HEAD_SIZE {
                    return Err(ReadError::Http(Error::bad_request(
                        "request head too large",
                    )));
                }
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).map_err(ReadError::Io)?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ReadError::Io(io::Error::from(
                    io::ErrorKind::UnexpectedEof,
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads body bytes into `buf`; 0 means the body is complete.
    ///
    /// Sends the pending `100 Continue` on the first call, so a refused
    /// request never invites the client to upload.
    pub fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, Failure> {
        if self.continue_pending {
            self.continue_pending = false;
            self.stream
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        }
        match &mut self.body {
            BodyState::None => Ok(0),
            BodyState::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let want = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let n = self.read_some(&mut buf[..want])?;
                if n == 0 {
                    return Err(Failure::Connection(io::Error::from(
                        io::ErrorKind::UnexpectedEof,
                    )));
                }
                if let BodyState::Length { remaining } = &mut self.body {
                    *remaining -= n as u64;
                }
                Ok(n)
            }
            BodyState::Chunked { in_chunk, done } => {
                if *done {
                    return Ok(0);
                }
                if *in_chunk == 0 {
                    let size = self.next_chunk_size()?;
                    if size == 0 {
                        self.finish_chunked()?;
                        return Ok(0);
                    }
                    if let BodyState::Chunked { in_chunk, .. } = &mut self.body {
                        *in_chunk = size;
                    }
                    return self.read_body(buf);
                }
                let want = buf.len().min(usize::try_from(*in_chunk).unwrap_or(usize::MAX));
                let n = self.read_some(&mut buf[..want])?;
                if n == 0 {
                    return Err(Failure::Connection(io::Error::from(
                        io::ErrorKind::UnexpectedEof,
                    )));
                }
                if let BodyState::Chunked { in_chunk, .. } = &mut self.body {
                    *in_chunk -= n as u64;
                    if *in_chunk == 0 {
                        // Chunk data is followed by CRLF.
                        self.expect_crlf()?;
                    }
                }
                Ok(n)
            }
        }
    }

    /// Reads the whole body into memory, refusing bodies above `limit`.
    pub fn read_body_to_vec(&mut self, limit: usize) -> Result<Vec<u8>, Failure> {
        let mut body = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read_body(&mut chunk)?;
            if n == 0 {
                return Ok(body);
            }
            if body.len() + n > limit {
                self.close = true;
                return Err(Error::payload_too_large("request body too large").into());
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    // Serves read_body from the parse buffer first, then the socket.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.read_buf.is_empty() {
            let n = buf.len().min(self.read_buf.len());
            buf[..n].copy_from_slice(&self.read_buf[..n]);
            self.read_buf.drain(..n);
            return Ok(n);
        }
        self.stream.read(buf)
    }

    fn read_line(&mut self) -> Result<String, Failure> {
        loop {
            if let Some(pos) = self.read_buf.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&self.read_buf[..pos]).into_owned();
                self.read_buf.drain(..pos + 2);
                return Ok(line);
            }
            if self.read_buf.len() > MAX_CHUNK_LINE {
                self.close = true;
                return Err(Error::bad_request("invalid chunked framing").into());
            }
            let mut chunk = [0u8; 256];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(Failure::Connection(io::Error::from(
                    io::ErrorKind::UnexpectedEof,
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn next_chunk_size(&mut self) -> Result<u64, Failure> {
        let line = self.read_line()?;
        // Ignore chunk extensions.
        let size = line.split(';').next().unwrap_or("").trim();
        u64::from_str_radix(size, 16).map_err(|_| {
            self.close = true;
            Error::bad_request(format!("invalid chunk size {size:?}")).into()
        })
    }

    fn expect_crlf(&mut self) -> Result<(), Failure> {
        let line = self.read_line()?;
        if !line.is_empty() {
            self.close = true;
            return Err(Error::bad_request("missing chunk delimiter").into());
        }
        Ok(())
    }

    fn finish_chunked(&mut self) -> Result<(), Failure> {
        // Consume (and ignore) trailers up to the blank line.
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                break;
            }
        }
        self.body = BodyState::Chunked {
            in_chunk: 0,
            done: true,
        };
        Ok(())
    }

    fn drain_body(&mut self) -> Result<(), Failure> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.read_body(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes the status line and headers. `content_length` frames the body
    /// the handler will stream with [`write_body`](Self::write_body).
    pub fn start_response(
        &mut self,
        status: u16,
        headers: &[(&str, String)],
        content_length: u64,
    ) -> Result<(), Failure> {
        assert!(!self.response_started, "response already started");
        let mut head = format!("HTTP/1.1 {status} {}\r\n", title(status));
        head.push_str(&format!("Content-Length: {content_length}\r\n"));
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if self.close {
            head.push_str("Connection: close\r\n");
        } else if self.http10 {
            head.push_str("Connection: keep-alive\r\n");
        }
        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes())?;
        self.response_started = true;
        self.response_remaining = content_length;
        Ok(())
    }

    /// Streams part of the response body.
    pub fn write_body(&mut self, data: &[u8]) -> Result<(), Failure> {
        debug_assert!(self.response_started, "body before headers");
        self.stream.write_all(data)?;
        self.response_remaining = self.response_remaining.saturating_sub(data.len() as u64);
        Ok(())
    }

    /// Sends a complete JSON response.
    pub fn send_json(
        &mut self,
        status: u16,
        extra: &[(&str, String)],
        body: &str,
    ) -> Result<(), Failure> {
        let mut headers = vec![("Content-Type", "application/json".to_string())];
        headers.extend(extra.iter().map(|(name, value)| (*name, value.clone())));
        self.start_response(status, &headers, body.len() as u64)?;
        self.write_body(body.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Sends a bodyless response.
    pub fn send_empty(&mut self, status: u16, extra: &[(&str, String)]) -> Result<(), Failure> {
        self.start_response(status, extra, 0)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Sends the canonical JSON error body.
    pub fn send_error(&mut self, error: &Error) -> Result<(), Failure> {
        self.send_json(error.code, &[], &error.body())
    }

    /// Flushes buffered response bytes to the socket.
    pub fn flush(&mut self) -> Result<(), Failure> {
        self.stream.flush()?;
        Ok(())
    }

    /// Marks the connection to close after the current response.
    pub fn set_close(&mut self) {
        self.close = true;
    }

    /// The peer description for logs.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

enum ReadError {
    Io(io::Error),
    Http(Error),
}

#[cfg(test)]
mod tests {
    use super::Shutdown;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn shutdown_wakes_waiters() {
        let shutdown = Arc::new(Shutdown::new());
        let other = Arc::clone(&shutdown);
        let waiter =
            std::thread::spawn(move || other.wait_timeout(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        assert!(waiter.join().unwrap());
        assert!(shutdown.is_set());
    }

    #[test]
    fn wait_timeout_expires_when_not_triggered() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));
    }
}
