//! Control-channel handler for `/tickets/{uuid}`.
//!
//! The control channel is trust-on-socket: anyone who can open the socket
//! may manage tickets, so handlers validate shape, not identity.

use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::auth::{AuthError, Ticket, TicketSpec};
use crate::errors::{Error, Failure};
use crate::http::Request;
use crate::server::Connection;
use crate::App;

use super::{method_not_allowed, required_u64};

const MAX_TICKET_BODY: usize = 1024 * 1024;

/// Dispatches one `/tickets/{uuid}` request by method.
pub fn handle(
    app: &App,
    conn: &mut Connection,
    request: &Request,
    ticket: &str,
) -> Result<(), Failure> {
    match request.method.as_str() {
        "PUT" => put(app, conn, request, ticket),
        "GET" => get(app, conn, ticket),
        "PATCH" => patch(app, conn, request, ticket),
        "DELETE" => delete(app, conn, request, ticket),
        _ => Err(method_not_allowed(request)),
    }
}

fn parse_ticket(ticket: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(ticket).map_err(|e| Error::bad_request(format!("bad ticket id {ticket:?}: {e}")))
}

fn put(app: &App, conn: &mut Connection, _request: &Request, ticket: &str) -> Result<(), Failure> {
    let uuid = parse_ticket(ticket)?;
    let body = conn.read_body_to_vec(MAX_TICKET_BODY)?;
    let spec: TicketSpec = serde_json::from_slice(&body)
        .map_err(|e| Error::bad_request(format!("invalid ticket: {e}")))?;
    if spec.uuid != ticket {
        return Err(Error::bad_request(format!(
            "ticket uuid {:?} does not match url {ticket:?}",
            spec.uuid
        ))
        .into());
    }
    let parsed = Ticket::from_spec(spec).map_err(|e| Error::bad_request(e.to_string()))?;
    app.auth.add(parsed)?;
    info!(%uuid, "ticket added");
    conn.send_empty(200, &[])
}

fn get(app: &App, conn: &mut Connection, ticket: &str) -> Result<(), Failure> {
    let uuid = parse_ticket(ticket)?;
    let view = app.auth.get(uuid)?;
    let body = serde_json::to_string(&view)
        .map_err(|e| Error::internal(format!("cannot encode ticket: {e}")))?;
    conn.send_json(200, &[], &body)
}

fn patch(app: &App, conn: &mut Connection, _request: &Request, ticket: &str) -> Result<(), Failure> {
    let uuid = parse_ticket(ticket)?;
    let body = conn.read_body_to_vec(MAX_TICKET_BODY)?;
    let message: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| Error::bad_request(format!("invalid json message: {e}")))?;
    let timeout = required_u64(&message, "timeout")?;
    app.auth.patch(uuid, timeout)?;
    info!(%uuid, timeout, "ticket extended");
    conn.send_empty(200, &[])
}

fn delete(app: &App, conn: &mut Connection, request: &Request, ticket: &str) -> Result<(), Failure> {
    let uuid = parse_ticket(ticket)?;
    let wait = match request.query.get("timeout") {
        None => app.config.control.remove_timeout,
        Some(value) => value
            .parse()
            .map_err(|_| Error::bad_request(format!("invalid timeout {value:?}")))?,
    };
    match app.auth.remove(uuid, Duration::from_secs(wait)) {
        // Deleting a missing ticket is a no-op so retried deletes converge.
        Ok(()) | Err(AuthError::NotFound(_)) => {
            info!(%uuid, "ticket removed");
            conn.send_empty(204, &[])
        }
        Err(e) => Err(e.into()),
    }
}
