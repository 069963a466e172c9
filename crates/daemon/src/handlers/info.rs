//! `GET /info/` version report.

use crate::errors::Failure;
use crate::http::Request;
use crate::server::Connection;
use crate::App;

use super::method_not_allowed;

/// Reports the daemon version.
pub fn handle(_app: &App, conn: &mut Connection, request: &Request) -> Result<(), Failure> {
    if request.method != "GET" {
        return Err(method_not_allowed(request));
    }
    let body = serde_json::json!({ "version": crate::VERSION });
    conn.send_json(200, &[], &body.to_string())
}
