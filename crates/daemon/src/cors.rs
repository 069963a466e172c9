//! Cross-Origin Resource Sharing headers.
//!
//! Browsers send an OPTIONS preflight before uploading through the webadmin,
//! then attach an `Origin` header to the actual requests. We allow any
//! origin, any header, and the data-plane methods; the browser may cache the
//! verdict for a day.

use crate::http::Request;

const ALLOW_ORIGIN: &str = "*";
const ALLOW_HEADERS: &str = "*";
const ALLOW_METHODS: &str = "OPTIONS,GET,PUT,PATCH";
const EXPOSE_HEADERS: &str = "Content-Length, Content-Range, Range";
const MAX_AGE: &str = "86400";

/// Returns the CORS headers warranted by a request.
///
/// Headers are only added when the request carries CORS markers, so plain
/// API clients get plain responses.
#[must_use]
pub fn headers(request: &Request) -> Vec<(&'static str, String)> {
    let mut decorated = Vec::new();
    if request.headers.contains("origin") {
        decorated.push(("Access-Control-Allow-Origin", ALLOW_ORIGIN.to_string()));
        decorated.push((
            "Access-Control-Expose-Headers",
            EXPOSE_HEADERS.to_string(),
        ));
    }
    if request.headers.contains("access-control-request-headers") {
        decorated.push(("Access-Control-Allow-Headers", ALLOW_HEADERS.to_string()));
    }
    if request.headers.contains("access-control-request-method") {
        decorated.push(("Access-Control-Allow-Methods", ALLOW_METHODS.to_string()));
    }
    if !decorated.is_empty() {
        decorated.push(("Access-Control-Max-Age", MAX_AGE.to_string()));
    }
    decorated
}
