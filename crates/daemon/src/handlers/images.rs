//! Data-plane handler for `/images/{ticket}`.

use checksums::Algorithm;
use tracing::info;
use uuid::Uuid;

use crate::auth::TicketOp;
use crate::cors;
use crate::errors::{Error, Failure};
use crate::http::Request;
use crate::ops::Operation;
use crate::server::Connection;
use crate::App;

use super::{
    method_not_allowed, optional_bool, optional_u64, query_enum, required_str, required_u64,
    store_backend, take_backend, HandleKey,
};

// PATCH bodies are tiny json messages.
const MAX_PATCH_BODY: usize = 64 * 1024;

/// Dispatches one `/images/{ticket}` request by method.
pub fn handle(
    app: &App,
    conn: &mut Connection,
    request: &Request,
    ticket: &str,
) -> Result<(), Failure> {
    match request.method.as_str() {
        "GET" => get(app, conn, request, ticket),
        "PUT" => put(app, conn, request, ticket),
        "PATCH" => patch(app, conn, request, ticket),
        "OPTIONS" => options(conn, request),
        _ => Err(method_not_allowed(request)),
    }
}

fn parse_ticket(ticket: &str) -> Result<Uuid, Error> {
    // An unparsable id cannot match any ticket; same failure as unknown.
    Uuid::parse_str(ticket)
        .map_err(|_| Error::unauthorized(format!("no such ticket {ticket:?}")))
}

fn get(app: &App, conn: &mut Connection, request: &Request, ticket: &str) -> Result<(), Failure> {
    let uuid = parse_ticket(ticket)?;
    let range = request.range()?;
    let (offset, length) = match range {
        None => (0, None),
        Some(range) => (range.first, range.length()),
    };
    let handle = app.auth.authorize(uuid, TicketOp::Read, offset, length)?;
    let length = handle.length();
    if range.is_some() && length == 0 {
        return Err(Error::range_not_satisfiable("empty range")
            .with_detail(format!("ticket size = {}", handle.size()))
            .into());
    }

    let mut headers = vec![(
        "Content-Type",
        "application/octet-stream".to_string(),
    )];
    if let Some(filename) = handle.filename() {
        headers.push((
            "Content-Disposition",
            format!("attachment; filename={filename:?}"),
        ));
    }
    let status = if range.is_some() {
        headers.push((
            "Content-Range",
            format!(
                "bytes {offset}-{}/{}",
                offset + length.saturating_sub(1),
                handle.size()
            ),
        ));
        206
    } else {
        200
    };
    headers.extend(cors::headers(request));

    let mut backend = take_backend(conn, &handle, &app.config)?;
    let key = HandleKey::of(&handle);
    let mut op = Operation::new(handle, backend.as_mut(), app.config.daemon.buffer_size);
    let result = conn
        .start_response(status, &headers, length)
        .and_then(|()| op.read_to(conn));
    let clock = op.finish();
    store_backend(conn, &key, backend);
    info!(ticket = %uuid, offset, length, %clock, "read");
    result
}

fn put(app: &App, conn: &mut Connection, request: &Request, ticket: &str) -> Result<(), Failure> {
    let uuid = parse_ticket(ticket)?;
    let flush = query_enum(request, "flush", &["y", "n"])? == Some("y");
    let content_range = request.content_range()?;
    let content_length = request.content_length()?;
    if content_length.is_none() && !request.chunked()? {
        return Err(Error::bad_request("missing content-length").into());
    }

    let (offset, length) = match content_range {
        Some(range) => {
            if let Some(content_length) = content_length {
                if content_length != range.length() {
                    return Err(Error::bad_request(format!(
                        "content-length {content_length} does not match content-range {}-{}",
                        range.first, range.last
                    ))
                    .into());
                }
            }
            (range.first, Some(range.length()))
        }
        None => (0, content_length),
    };
    let handle = app.auth.authorize(uuid, TicketOp::Write, offset, length)?;
    let length = handle.length();

    let mut backend = take_backend(conn, &handle, &app.config)?;
    let key = HandleKey::of(&handle);
    let mut op = Operation::new(handle, backend.as_mut(), app.config.daemon.buffer_size);
    let result = op.write_from(conn, flush);
    let clock = op.finish();
    store_backend(conn, &key, backend);
    info!(ticket = %uuid, offset, length, flush, %clock, "write");
    result?;

    conn.send_empty(200, &cors::headers(request))
}

fn patch(app: &App, conn: &mut Connection, request: &Request, ticket: &str) -> Result<(), Failure> {
    let uuid = parse_ticket(ticket)?;
    let body = conn.read_body_to_vec(MAX_PATCH_BODY)?;
    let message: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| Error::bad_request(format!("invalid json message: {e}")))?;

    match required_str(&message, "op")? {
        "zero" => zero(app, conn, request, uuid, &message),
        "flush" => flush(app, conn, request, uuid),
        unknown => Err(Error::bad_request(format!("unknown op {unknown:?}")).into()),
    }
}

fn zero(
    app: &App,
    conn: &mut Connection,
    request: &Request,
    uuid: Uuid,
    message: &serde_json::Value,
) -> Result<(), Failure> {
    let size = required_u64(message, "size")?;
    let offset = optional_u64(message, "offset", 0)?;
    let flush = optional_bool(message, "flush", false)?;

    let handle = app.auth.authorize(uuid, TicketOp::Write, offset, Some(size))?;
    let mut backend = take_backend(conn, &handle, &app.config)?;
    let key = HandleKey::of(&handle);
    let mut op = Operation::new(handle, backend.as_mut(), app.config.daemon.buffer_size);
    let result = op.zero(flush);
    let clock = op.finish();
    store_backend(conn, &key, backend);
    info!(ticket = %uuid, offset, size, flush, %clock, "zero");
    result?;

    conn.send_empty(200, &cors::headers(request))
}

fn flush(
    app: &App,
    conn: &mut Connection,
    request: &Request,
    uuid: Uuid,
) -> Result<(), Failure> {
    let handle = app.auth.authorize(uuid, TicketOp::Write, 0, Some(0))?;
    let mut backend = take_backend(conn, &handle, &app.config)?;
    let key = HandleKey::of(&handle);
    let mut op = Operation::new(handle, backend.as_mut(), app.config.daemon.buffer_size);
    let result = op.flush();
    let clock = op.finish();
    store_backend(conn, &key, backend);
    info!(ticket = %uuid, %clock, "flush");
    result?;

    conn.send_empty(200, &cors::headers(request))
}

fn options(conn: &mut Connection, request: &Request) -> Result<(), Failure> {
    let mut headers = vec![("Allow", "OPTIONS,GET,PUT,PATCH".to_string())];
    headers.extend(cors::headers(request));
    let features = serde_json::json!({ "features": ["checksum", "flush", "zero"] });
    conn.send_json(200, &headers, &features.to_string())
}

/// `GET /images/{ticket}/checksum` fingerprints the backing image.
pub fn handle_checksum(
    app: &App,
    conn: &mut Connection,
    request: &Request,
    ticket: &str,
) -> Result<(), Failure> {
    if request.method != "GET" {
        return Err(method_not_allowed(request));
    }
    let uuid = parse_ticket(ticket)?;
    let algorithm = match query_enum(request, "algorithm", &["blake2b", "sha1"])? {
        None => Algorithm::default(),
        Some(name) => {
            Algorithm::parse(name).map_err(|e| Error::bad_request(e.to_string()))?
        }
    };

    let handle = app.auth.authorize(uuid, TicketOp::Read, 0, None)?;
    let mut backend = take_backend(conn, &handle, &app.config)?;
    let key = HandleKey::of(&handle);
    let mut op = Operation::new(handle, backend.as_mut(), app.config.daemon.buffer_size);
    let result = op.checksum(algorithm);
    let clock = op.finish();
    store_backend(conn, &key, backend);
    info!(ticket = %uuid, %clock, "checksum");
    let checksum = result?;

    let body = serde_json::json!({
        "checksum": checksum.checksum,
        "algorithm": checksum.algorithm,
        "block_size": checksum.block_size,
    });
    conn.send_json(200, &cors::headers(request), &body.to_string())
}
