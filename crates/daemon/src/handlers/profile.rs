//! Control-channel handler for `/profile/`.

use crate::errors::{Error, Failure};
use crate::http::Request;
use crate::server::Connection;
use crate::App;

use super::{method_not_allowed, query_enum};

/// Starts or stops the process-wide profiler.
pub fn handle(app: &App, conn: &mut Connection, request: &Request) -> Result<(), Failure> {
    match request.method.as_str() {
        "POST" => {
            let run = query_enum(request, "run", &["y", "n"])?
                .ok_or_else(|| Error::bad_request("missing required value for \"run\""))?;
            let result = if run == "y" {
                app.profiler.start()
            } else {
                app.profiler.stop()
            };
            result.map_err(|e| Error::bad_request(e.to_string()))?;
            conn.send_empty(200, &[])
        }
        "GET" => {
            let body = serde_json::json!({ "running": app.profiler.running() });
            conn.send_json(200, &[], &body.to_string())
        }
        _ => Err(method_not_allowed(request)),
    }
}
