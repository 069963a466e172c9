//! HTTP/1.1 request parsing and header semantics.
//!
//! This module is the pure side of the protocol: request heads, header
//! lookups, and the `Range`/`Content-Range` grammars. The socket-facing
//! connection loop lives in [`crate::server`].

use std::collections::HashMap;

use crate::errors::Error;

/// Methods the dispatcher accepts at all; anything else is 405.
pub const ALLOWED_METHODS: &[&str] =
    &["GET", "PUT", "PATCH", "POST", "DELETE", "OPTIONS", "HEAD"];

/// Upper bound on a request head; bigger heads are abusive.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Case-insensitive header collection. Names are stored lowercase.
#[derive(Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Returns the value of `name`, case-insensitive.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(stored, _)| *stored == name)
            .map(|(_, value)| value.as_str())
    }

    /// Whether `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_ascii_lowercase(), value.to_string()));
    }
}

/// A parsed request head. The body, if any, stays on the connection.
#[derive(Debug)]
pub struct Request {
    /// Uppercase method token.
    pub method: String,
    /// Decoded path without the query string.
    pub path: String,
    /// Query parameters, last occurrence wins.
    pub query: HashMap<String, String>,
    /// Whether the request was HTTP/1.1 (as opposed to 1.0).
    pub version_11: bool,
    /// Request headers.
    pub headers: Headers,
}

/// Result of feeding buffered bytes to the head parser.
#[derive(Debug)]
pub enum ParseStatus {
    /// A complete head consuming this many bytes of the buffer.
    Complete(Request, usize),
    /// More bytes are needed.
    Partial,
}

/// Parses a request head from the start of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<ParseStatus, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed
        .parse(buf)
        .map_err(|e| Error::bad_request(format!("cannot parse request: {e}")))?;
    let consumed = match status {
        httparse::Status::Complete(consumed) => consumed,
        httparse::Status::Partial => return Ok(ParseStatus::Partial),
    };

    let method = parsed.method.unwrap_or_default().to_string();
    let target = parsed.path.unwrap_or_default();
    let version_11 = parsed.version == Some(1);

    let (path, query_string) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    let mut query = HashMap::new();
    for pair in query_string.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) => query.insert(key.to_string(), value.to_string()),
            None => query.insert(pair.to_string(), String::new()),
        };
    }

    let mut request = Request {
        method,
        path: path.to_string(),
        query,
        version_11,
        headers: Headers::default(),
    };
    for header in parsed.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::bad_request(format!("header {} is not utf-8", header.name)))?;
        request.headers.push(header.name, value.trim());
    }
    Ok(ParseStatus::Complete(request, consumed))
}

impl Request {
    /// Path segments with the empty leading segment removed. A trailing
    /// slash yields a trailing empty segment, so `/info/` splits to
    /// `["info", ""]`.
    #[must_use]
    pub fn segments(&self) -> Vec<&str> {
        self.path.trim_start_matches('/').split('/').collect()
    }

    /// Parsed `Content-Length`, if present.
    pub fn content_length(&self) -> Result<Option<u64>, Error> {
        match self.headers.get("content-length") {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| Error::bad_request(format!("invalid content-length {value:?}"))),
        }
    }

    /// Whether the body uses chunked transfer encoding.
    pub fn chunked(&self) -> Result<bool, Error> {
        match self.headers.get("transfer-encoding") {
            None => Ok(false),
            Some(value) if value.eq_ignore_ascii_case("chunked") => Ok(true),
            Some(value) => Err(Error::bad_request(format!(
                "unsupported transfer-encoding {value:?}"
            ))),
        }
    }

    /// Whether the client asked for a 100 Continue before sending the body.
    #[must_use]
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("expect")
            .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"))
    }

    /// Whether the connection should stay open after this exchange.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            // HTTP/1.1 defaults to keep-alive, 1.0 to close.
            _ => self.version_11,
        }
    }

    /// Parsed `Range` header, if present.
    pub fn range(&self) -> Result<Option<ByteRange>, Error> {
        match self.headers.get("range") {
            None => Ok(None),
            Some(value) => ByteRange::parse(value).map(Some),
        }
    }

    /// Parsed `Content-Range` header, if present.
    pub fn content_range(&self) -> Result<Option<ContentRange>, Error> {
        match self.headers.get("content-range") {
            None => Ok(None),
            Some(value) => ContentRange::parse(value).map(Some),
        }
    }
}

/// A `Range: bytes=first-last` request header, ends inclusive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ByteRange {
    /// First byte requested.
    pub first: u64,
    /// Last byte requested, or `None` for "to the end".
    pub last: Option<u64>,
}

impl ByteRange {
    /// Parses `bytes=first-last` and `bytes=first-`.
    ///
    /// Multi-range and suffix forms are not used by image clients and are
    /// rejected as malformed.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let malformed = || Error::bad_request(format!("invalid range {value:?}"));
        let spec = value.strip_prefix("bytes=").ok_or_else(malformed)?;
        if spec.contains(',') {
            return Err(malformed());
        }
        let (first, last) = spec.split_once('-').ok_or_else(malformed)?;
        let first: u64 = first.trim().parse().map_err(|_| malformed())?;
        let last = match last.trim() {
            "" => None,
            text => {
                let last: u64 = text.parse().map_err(|_| malformed())?;
                if last < first {
                    return Err(malformed());
                }
                Some(last)
            }
        };
        Ok(Self { first, last })
    }

    /// The requested length, when bounded.
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.last.map(|last| last - self.first + 1)
    }
}

/// A `Content-Range: bytes first-last/total` request header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContentRange {
    /// First byte of the payload's position in the image.
    pub first: u64,
    /// Last byte, inclusive.
    pub last: u64,
    /// Total image size, or `None` for `*`.
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parses `bytes first-last/total` with `total` possibly `*`.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let malformed = || Error::bad_request(format!("invalid content-range {value:?}"));
        let spec = value.strip_prefix("bytes").ok_or_else(malformed)?.trim_start();
        let (range, total) = spec.split_once('/').ok_or_else(malformed)?;
        let (first, last) = range.split_once('-').ok_or_else(malformed)?;
        let first: u64 = first.trim().parse().map_err(|_| malformed())?;
        let last: u64 = last.trim().parse().map_err(|_| malformed())?;
        if last < first {
            return Err(malformed());
        }
        let total = match total.trim() {
            "*" => None,
            text => Some(text.parse().map_err(|_| malformed())?),
        };
        if let Some(total) = total {
            if last >= total {
                return Err(malformed());
            }
        }
        Ok(Self { first, last, total })
    }

    /// Payload length described by the header.
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.last - self.first + 1
    }
}
