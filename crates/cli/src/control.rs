//! Blocking client for the daemon's control API.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use daemon::config::ControlConfig;
use thiserror::Error;

/// Errors talking to the control listener.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach or talk to the daemon.
    #[error("cannot communicate with the daemon: {0}")]
    Io(#[from] std::io::Error),

    /// The daemon sent something that is not HTTP.
    #[error("invalid response from the daemon: {0}")]
    BadResponse(String),

    /// The daemon refused the request.
    #[error("server error: {code} {body}")]
    Server {
        /// HTTP status code.
        code: u16,
        /// Response body, usually the daemon's JSON error.
        body: String,
    },
}

/// Result alias for control operations.
pub type Result<T> = std::result::Result<T, ClientError>;

enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Unix(stream) => stream.flush(),
        }
    }
}

/// A connected admin client.
pub struct Client {
    stream: Transport,
    // Response bytes read past the previous message.
    buffer: Vec<u8>,
}

impl Client {
    /// Connects to the control listener selected by the daemon config.
    pub fn connect(config: &ControlConfig, timeout: Duration) -> Result<Self> {
        let stream = match config.transport.as_str() {
            "tcp" => {
                let stream = TcpStream::connect(("127.0.0.1", config.port))?;
                stream.set_read_timeout(Some(timeout))?;
                Transport::Tcp(stream)
            }
            _ => {
                let stream = UnixStream::connect(&config.socket)?;
                stream.set_read_timeout(Some(timeout))?;
                Transport::Unix(stream)
            }
        };
        Ok(Self {
            stream,
            buffer: Vec::new(),
        })
    }

    /// Adds a ticket from its JSON representation.
    pub fn add_ticket(&mut self, ticket: &serde_json::Value) -> Result<()> {
        let uuid = ticket
            .get("uuid")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ClientError::BadResponse("ticket has no uuid".to_string()))?
            .to_string();
        let body = ticket.to_string();
        let (code, body) =
            self.request("PUT", &format!("/tickets/{uuid}"), Some(body.as_bytes()))?;
        expect(200, code, body)
    }

    /// Fetches a ticket's status.
    pub fn get_ticket(&mut self, ticket_id: &str) -> Result<serde_json::Value> {
        let (code, body) = self.request("GET", &format!("/tickets/{ticket_id}"), None)?;
        expect(200, code, body.clone())?;
        serde_json::from_str(&body).map_err(|e| ClientError::BadResponse(e.to_string()))
    }

    /// Changes a ticket's timeout.
    pub fn mod_ticket(&mut self, ticket_id: &str, timeout: u64) -> Result<()> {
        let body = serde_json::json!({ "timeout": timeout }).to_string();
        let (code, body) = self.request(
            "PATCH",
            &format!("/tickets/{ticket_id}"),
            Some(body.as_bytes()),
        )?;
        expect(200, code, body)
    }

    /// Deletes a ticket.
    pub fn del_ticket(&mut self, ticket_id: &str) -> Result<()> {
        let (code, body) = self.request("DELETE", &format!("/tickets/{ticket_id}"), None)?;
        expect(204, code, body)
    }

    /// Starts the daemon profiler.
    pub fn start_profile(&mut self) -> Result<()> {
        let (code, body) = self.request("POST", "/profile/?run=y", None)?;
        expect(200, code, body)
    }

    /// Stops the daemon profiler.
    pub fn stop_profile(&mut self) -> Result<()> {
        let (code, body) = self.request("POST", "/profile/?run=n", None)?;
        expect(200, code, body)
    }

    fn request(&mut self, method: &str, uri: &str, body: Option<&[u8]>) -> Result<(u16, String)> {
        let mut head = format!("{method} {uri} HTTP/1.1\r\nHost: localhost\r\n");
        head.push_str(&format!("Content-Length: {}\r\n", body.map_or(0, <[u8]>::len)));
        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes())?;
        if let Some(body) = body {
            self.stream.write_all(body)?;
        }
        self.stream.flush()?;
        self.read_response()
    }

    fn read_response(&mut self) -> Result<(u16, String)> {
        let (code, content_length, consumed) = loop {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut response = httparse::Response::new(&mut headers);
            match response
                .parse(&self.buffer)
                .map_err(|e| ClientError::BadResponse(e.to_string()))?
            {
                httparse::Status::Complete(consumed) => {
                    let code = response
                        .code
                        .ok_or_else(|| ClientError::BadResponse("missing status".to_string()))?;
                    let content_length = headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                        .and_then(|h| std::str::from_utf8(h.value).ok())
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    break (code, content_length, consumed);
                }
                httparse::Status::Partial => {}
            }
            if self.fill()? == 0 {
                return Err(ClientError::BadResponse(
                    "connection closed mid-response".to_string(),
                ));
            }
        };
        self.buffer.drain(..consumed);

        while self.buffer.len() < content_length {
            if self.fill()? == 0 {
                return Err(ClientError::BadResponse(
                    "connection closed mid-body".to_string(),
                ));
            }
        }
        let body: Vec<u8> = self.buffer.drain(..content_length).collect();
        Ok((code, String::from_utf8_lossy(&body).into_owned()))
    }

    fn fill(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

fn expect(wanted: u16, code: u16, body: String) -> Result<()> {
    if code == wanted {
        return Ok(());
    }
    Err(ClientError::Server { code, body })
}
