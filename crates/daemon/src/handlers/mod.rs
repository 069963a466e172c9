//! Request dispatch and shared handler helpers.
//!
//! Two routers share one connection loop: [`data_plane`] serves image bytes
//! to remote clients, [`control`] serves ticket lifecycle commands to the
//! local controller. Dispatch is on path segments first, then each handler
//! matches its methods; an unknown method on a known path is 405, an
//! unknown path is 404.

pub mod images;
pub mod info;
pub mod profile;
pub mod tickets;

use storage::Backend;

use crate::auth::Authorized;
use crate::config::Config;
use crate::errors::{Error, Failure};
use crate::http::Request;
use crate::server::Connection;
use crate::App;

/// Router for the public data-plane listener.
pub fn data_plane(app: &App, conn: &mut Connection, request: &Request) -> Result<(), Failure> {
    if request.path == "*" {
        return server_options(conn, request);
    }
    let segments = request.segments();
    match segments.as_slice() {
        ["images", ticket] => images::handle(app, conn, request, ticket),
        ["images", ticket, "checksum"] => {
            images::handle_checksum(app, conn, request, ticket)
        }
        ["info"] | ["info", ""] => info::handle(app, conn, request),
        _ => Err(Error::not_found(format!("no handler for {:?}", request.path)).into()),
    }
}

/// Router for the trusted control listener.
pub fn control(app: &App, conn: &mut Connection, request: &Request) -> Result<(), Failure> {
    let segments = request.segments();
    match segments.as_slice() {
        ["tickets", ticket] => tickets::handle(app, conn, request, ticket),
        ["profile"] | ["profile", ""] => profile::handle(app, conn, request),
        _ => Err(Error::not_found(format!("no handler for {:?}", request.path)).into()),
    }
}

// OPTIONS * reports every method the dispatcher accepts.
fn server_options(conn: &mut Connection, request: &Request) -> Result<(), Failure> {
    if request.method != "OPTIONS" {
        return Err(Error::method_not_allowed(format!(
            "method {:?} not defined for {:?}",
            request.method, request.path
        ))
        .into());
    }
    let allow = crate::http::ALLOWED_METHODS.join(",");
    conn.send_empty(200, &[("Allow", allow)])
}

/// 405 for a method a handler does not implement.
pub(crate) fn method_not_allowed(request: &Request) -> Failure {
    Error::method_not_allowed(format!(
        "method {:?} not defined for {:?}",
        request.method, request.path
    ))
    .into()
}

/// Takes the connection-scoped backend for this ticket, opening one when
/// the connection has none or served a different ticket.
pub(crate) fn take_backend(
    conn: &mut Connection,
    handle: &Authorized,
    config: &Config,
) -> Result<Box<dyn Backend>, Failure> {
    if let Some((uuid, url, mut backend)) = conn.backend.take() {
        if uuid == handle.uuid() && url == *handle.url() {
            return Ok(backend);
        }
        // This connection moved to another ticket or the ticket was
        // replaced; the old backend is done.
        let _ = backend.close();
    }
    let options = storage::Options {
        direct: config.daemon.direct_io,
        sparse: handle.sparse(),
    };
    Ok(storage::open(handle.url(), handle.mode(), &options)?)
}

/// Returns the backend to the connection for Keep-Alive reuse.
pub(crate) fn store_backend(conn: &mut Connection, handle: &HandleKey, backend: Box<dyn Backend>) {
    conn.backend = Some((handle.uuid, handle.url.clone(), backend));
}

/// The cache key remembered from an authorized handle, so the backend can
/// be returned to the connection after the handle is consumed.
pub(crate) struct HandleKey {
    pub uuid: uuid::Uuid,
    pub url: storage::ImageUrl,
}

impl HandleKey {
    pub fn of(handle: &Authorized) -> Self {
        Self {
            uuid: handle.uuid(),
            url: handle.url().clone(),
        }
    }
}

// JSON body field validation, the daemon's equivalent of checking typed
// message fields one by one.

pub(crate) fn required_str<'a>(
    message: &'a serde_json::Value,
    name: &str,
) -> Result<&'a str, Error> {
    message
        .get(name)
        .ok_or_else(|| Error::bad_request(format!("missing required value for {name:?}")))?
        .as_str()
        .ok_or_else(|| Error::bad_request(format!("string required for {name:?}")))
}

pub(crate) fn required_u64(message: &serde_json::Value, name: &str) -> Result<u64, Error> {
    message
        .get(name)
        .ok_or_else(|| Error::bad_request(format!("missing required value for {name:?}")))?
        .as_u64()
        .ok_or_else(|| Error::bad_request(format!("integer required for {name:?}")))
}

pub(crate) fn optional_u64(
    message: &serde_json::Value,
    name: &str,
    default: u64,
) -> Result<u64, Error> {
    match message.get(name) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| Error::bad_request(format!("integer required for {name:?}"))),
    }
}

pub(crate) fn optional_bool(
    message: &serde_json::Value,
    name: &str,
    default: bool,
) -> Result<bool, Error> {
    match message.get(name) {
        None => Ok(default),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| Error::bad_request(format!("boolean required for {name:?}"))),
    }
}

/// Validates a query parameter against a fixed set of values.
pub(crate) fn query_enum<'a>(
    request: &'a Request,
    name: &str,
    values: &[&str],
) -> Result<Option<&'a str>, Error> {
    match request.query.get(name) {
        None => Ok(None),
        Some(value) if values.contains(&value.as_str()) => Ok(Some(value)),
        Some(value) => Err(Error::bad_request(format!(
            "unsupported value {value:?} for {name:?}, expecting one of {values:?}"
        ))),
    }
}
