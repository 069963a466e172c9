//! Shared helpers for daemon integration tests: an in-process daemon on
//! ephemeral ports and a minimal blocking HTTP client.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use daemon::config::Config;
use daemon::Daemon;

/// A daemon bound to ephemeral localhost ports.
pub struct TestDaemon {
    daemon: Option<Daemon>,
    pub data_port: u16,
    pub control_port: u16,
}

impl TestDaemon {
    pub fn start() -> Self {
        let mut config = Config::default();
        config.daemon.host = "127.0.0.1".to_string();
        config.daemon.port = 0;
        config.daemon.read_timeout = 5;
        config.control.transport = "tcp".to_string();
        config.control.port = 0;
        let daemon = Daemon::start(config).expect("daemon starts");
        let data_port = daemon.data_port().expect("tcp data port");
        let control_port = daemon.control_port().expect("tcp control port");
        Self {
            daemon: Some(daemon),
            data_port,
            control_port,
        }
    }

    pub fn data_client(&self) -> TestClient {
        TestClient::connect(self.data_port)
    }

    pub fn control_client(&self) -> TestClient {
        TestClient::connect(self.control_port)
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.stop();
        }
    }
}

/// One parsed HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(stored, _)| *stored == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

/// Minimal blocking HTTP/1.1 client driving one Keep-Alive connection.
pub struct TestClient {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl TestClient {
    pub fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub fn request(
        &mut self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Response {
        let mut head = format!("{method} {uri} HTTP/1.1\r\nHost: localhost\r\n");
        if !body.is_empty() || matches!(method, "PUT" | "PATCH" | "POST") {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes()).expect("send head");
        self.stream.write_all(body).expect("send body");
        self.stream.flush().expect("flush");
        self.read_response()
    }

    /// Sends pre-built request bytes, for framing the helper cannot build.
    pub fn raw_request(&mut self, raw: &[u8]) -> Response {
        self.stream.write_all(raw).expect("send raw request");
        self.stream.flush().expect("flush");
        self.read_response()
    }

    fn read_response(&mut self) -> Response {
        let (status, headers, content_length, consumed) = loop {
            let mut header_storage = [httparse::EMPTY_HEADER; 32];
            let mut response = httparse::Response::new(&mut header_storage);
            match response.parse(&self.buffer).expect("valid response") {
                httparse::Status::Complete(consumed) => {
                    let status = response.code.expect("status code");
                    let headers: Vec<(String, String)> = header_storage
                        .iter()
                        .take_while(|h| !h.name.is_empty())
                        .map(|h| {
                            (
                                h.name.to_ascii_lowercase(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect();
                    let content_length = headers
                        .iter()
                        .find(|(name, _)| name == "content-length")
                        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    break (status, headers, content_length, consumed);
                }
                httparse::Status::Partial => {
                    if self.fill() == 0 {
                        panic!("connection closed before response head");
                    }
                }
            }
        };
        self.buffer.drain(..consumed);
        while self.buffer.len() < content_length {
            if self.fill() == 0 {
                panic!("connection closed before response body");
            }
        }
        let body: Vec<u8> = self.buffer.drain(..content_length).collect();
        Response {
            status,
            headers,
            body,
        }
    }

    fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).expect("read response");
        self.buffer.extend_from_slice(&chunk[..n]);
        n
    }
}

/// A ticket JSON body for the control channel.
pub fn ticket_json(uuid: &str, size: u64, url: &str, ops: &[&str], timeout: u64) -> String {
    serde_json::json!({
        "uuid": uuid,
        "timeout": timeout,
        "ops": ops,
        "size": size,
        "url": url,
    })
    .to_string()
}
