//! HTTP error taxonomy and the single OS-error translation point.
//!
//! Backends and the authority return typed errors; nothing below the HTTP
//! boundary knows about status codes. Handlers bubble failures up as
//! [`Error`] and the connection loop serializes the canonical JSON body:
//!
//! ```json
//! {"code": 416, "title": "Requested Range Not Satisfiable",
//!  "explanation": "...", "detail": "ticket size = 1048576"}
//! ```

use std::fmt;

use serde_json::json;

use crate::auth::AuthError;

/// An error destined for the HTTP client.
#[derive(Debug)]
pub struct Error {
    /// HTTP status code.
    pub code: u16,
    /// Canonical reason phrase for the code.
    pub title: &'static str,
    /// Human readable explanation.
    pub explanation: String,
    /// Optional machine-checkable detail.
    pub detail: Option<String>,
}

impl Error {
    /// Creates an error with the canonical title for `code`.
    #[must_use]
    pub fn new(code: u16, explanation: impl Into<String>) -> Self {
        Self {
            code,
            title: title(code),
            explanation: explanation.into(),
            detail: None,
        }
    }

    /// Attaches a detail string.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request(explanation: impl Into<String>) -> Self {
        Self::new(400, explanation)
    }

    /// 401 Unauthorized.
    #[must_use]
    pub fn unauthorized(explanation: impl Into<String>) -> Self {
        Self::new(401, explanation)
    }

    /// 403 Forbidden.
    #[must_use]
    pub fn forbidden(explanation: impl Into<String>) -> Self {
        Self::new(403, explanation)
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found(explanation: impl Into<String>) -> Self {
        Self::new(404, explanation)
    }

    /// 405 Method Not Allowed.
    #[must_use]
    pub fn method_not_allowed(explanation: impl Into<String>) -> Self {
        Self::new(405, explanation)
    }

    /// 409 Conflict.
    #[must_use]
    pub fn conflict(explanation: impl Into<String>) -> Self {
        Self::new(409, explanation)
    }

    /// 410 Gone.
    #[must_use]
    pub fn gone(explanation: impl Into<String>) -> Self {
        Self::new(410, explanation)
    }

    /// 413 Payload Too Large.
    #[must_use]
    pub fn payload_too_large(explanation: impl Into<String>) -> Self {
        Self::new(413, explanation)
    }

    /// 416 Requested Range Not Satisfiable.
    #[must_use]
    pub fn range_not_satisfiable(explanation: impl Into<String>) -> Self {
        Self::new(416, explanation)
    }

    /// 500 Internal Server Error.
    #[must_use]
    pub fn internal(explanation: impl Into<String>) -> Self {
        Self::new(500, explanation)
    }

    /// The canonical JSON body for this error.
    #[must_use]
    pub fn body(&self) -> String {
        let mut payload = json!({
            "code": self.code,
            "title": self.title,
            "explanation": self.explanation,
        });
        if let Some(detail) = &self.detail {
            payload["detail"] = json!(detail);
        }
        payload.to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code, self.title, self.explanation)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Canonical reason phrase for a status code.
#[must_use]
pub fn title(code: u16) -> &'static str {
    match code {
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        416 => "Requested Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthorized(detail) => {
                Self::unauthorized("You are not allowed to access this resource").with_detail(detail)
            }
            AuthError::Forbidden(detail) => {
                Self::forbidden("Operation not allowed by ticket").with_detail(detail)
            }
            AuthError::Expired => Self::gone("You are too late"),
            AuthError::Cancelled => {
                Self::gone("Operation was interrupted").with_detail("ticket canceled")
            }
            AuthError::RangeNotSatisfiable { size } => {
                Self::range_not_satisfiable("Requested range is out of the ticket size")
                    .with_detail(format!("ticket size = {size}"))
            }
            AuthError::AlreadyExists(uuid) => {
                Self::conflict(format!("Ticket {uuid} already exists"))
            }
            AuthError::Busy { connections } => Self::conflict("Ticket is busy")
                .with_detail(format!("ticket is used by {connections} connections")),
            AuthError::NotFound(uuid) => Self::not_found(format!("No such ticket {uuid}")),
        }
    }
}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        match e {
            storage::Error::InvalidUrl(detail) => {
                Self::bad_request("Invalid image url").with_detail(detail)
            }
            // Raw OS and protocol errors reach the client as 500 with the
            // cause preserved in detail; the full error goes to the log.
            other => Self::internal("Image backend failure").with_detail(other.to_string()),
        }
    }
}

/// Failure mode of one request: either a response we can still send, or a
/// broken connection we can only drop.
#[derive(Debug)]
pub enum Failure {
    /// Respond with this error.
    Response(Error),
    /// The client connection failed; close it.
    Connection(std::io::Error),
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Self::Response(e)
    }
}

impl From<AuthError> for Failure {
    fn from(e: AuthError) -> Self {
        Self::Response(e.into())
    }
}

impl From<storage::Error> for Failure {
    fn from(e: storage::Error) -> Self {
        Self::Response(e.into())
    }
}

impl From<std::io::Error> for Failure {
    fn from(e: std::io::Error) -> Self {
        Self::Connection(e)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::auth::AuthError;

    #[test]
    fn body_includes_detail_when_present() {
        let error = Error::range_not_satisfiable("Requested range is out of the ticket size")
            .with_detail("ticket size = 1048576");
        let body: serde_json::Value = serde_json::from_str(&error.body()).unwrap();
        assert_eq!(body["code"], 416);
        assert_eq!(body["title"], "Requested Range Not Satisfiable");
        assert_eq!(body["detail"], "ticket size = 1048576");
    }

    #[test]
    fn body_omits_missing_detail() {
        let error = Error::bad_request("Malformed request");
        let body: serde_json::Value = serde_json::from_str(&error.body()).unwrap();
        assert!(body.get("detail").is_none());
    }

    #[test]
    fn canceled_ticket_maps_to_410_with_detail() {
        let error: Error = AuthError::Cancelled.into();
        assert_eq!(error.code, 410);
        assert_eq!(error.detail.as_deref(), Some("ticket canceled"));
    }

    #[test]
    fn expired_ticket_maps_to_410() {
        let error: Error = AuthError::Expired.into();
        assert_eq!(error.code, 410);
    }

    #[test]
    fn range_error_maps_to_416_with_size_detail() {
        let error: Error = AuthError::RangeNotSatisfiable { size: 1048576 }.into();
        assert_eq!(error.code, 416);
        assert_eq!(error.detail.as_deref(), Some("ticket size = 1048576"));
    }
}
