//! Ticket authority: store, refresh, authorize, and account transfer
//! tickets.
//!
//! A ticket grants time-bounded, range-bounded access to one image. The
//! authority is the only shared mutable state in the daemon: a map behind a
//! reader/writer lock, with each ticket's counters behind their own mutex.
//! Authorization takes a short critical section to mint an [`Authorized`]
//! handle; streaming operations run without any lock and report back through
//! the handle when they finish.
//!
//! Cancellation flows ticket to handles through the shared record, never the
//! other way: deleting a busy ticket flips the canceled flag and in-flight
//! operations observe it at their next chunk boundary.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, RwLock};
use std::time::{Duration, Instant};

use measure::{Range, RangeList};
use serde::{Deserialize, Serialize};
use storage::{ImageUrl, Mode};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Authorization failures, translated to HTTP statuses at the boundary.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No usable ticket for this request.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The ticket does not permit the requested operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The ticket's idle timeout has passed.
    #[error("ticket expired")]
    Expired,

    /// The ticket was canceled while the operation was running.
    #[error("ticket canceled")]
    Cancelled,

    /// The requested range does not fit the ticket size.
    #[error("requested range out of ticket size {size}")]
    RangeNotSatisfiable {
        /// The ticket's size ceiling.
        size: u64,
    },

    /// An active ticket with this UUID already exists.
    #[error("ticket {0} already exists")]
    AlreadyExists(Uuid),

    /// The ticket still has active connections.
    #[error("ticket is used by {connections} connections")]
    Busy {
        /// Number of connections still attached.
        connections: u64,
    },

    /// No ticket with this UUID.
    #[error("no such ticket {0}")]
    NotFound(Uuid),
}

/// A ticket that failed validation; surfaces as 400.
#[derive(Debug, Error)]
#[error("invalid ticket: {0}")]
pub struct InvalidTicket(pub String);

/// Operations a ticket may permit.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketOp {
    /// Reading image bytes.
    Read,
    /// Writing, zeroing, and flushing image bytes.
    Write,
}

impl fmt::Display for TicketOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// The ticket JSON accepted by the control channel.
#[derive(Debug, Deserialize)]
pub struct TicketSpec {
    /// Ticket UUID, string encoded.
    pub uuid: String,
    /// Idle timeout in seconds.
    pub timeout: u64,
    /// Permitted operations.
    pub ops: Vec<TicketOp>,
    /// Size ceiling in bytes.
    pub size: u64,
    /// Backing image URL.
    pub url: String,
    /// Whether writes may deallocate zeroed ranges.
    #[serde(default)]
    pub sparse: bool,
    /// Filename hint for download responses.
    #[serde(default)]
    pub filename: Option<String>,
}

/// A validated ticket.
#[derive(Clone, Debug)]
pub struct Ticket {
    /// Ticket UUID.
    pub uuid: Uuid,
    /// Permitted operations.
    pub ops: Vec<TicketOp>,
    /// Size ceiling in bytes.
    pub size: u64,
    /// Parsed backing image URL.
    pub url: ImageUrl,
    /// Whether writes may deallocate zeroed ranges.
    pub sparse: bool,
    /// Filename hint for download responses.
    pub filename: Option<String>,
    /// Idle timeout in seconds.
    pub timeout: u64,
}

impl Ticket {
    /// Validates a wire spec into a ticket.
    pub fn from_spec(spec: TicketSpec) -> Result<Self, InvalidTicket> {
        let uuid = Uuid::parse_str(&spec.uuid)
            .map_err(|e| InvalidTicket(format!("bad uuid {:?}: {e}", spec.uuid)))?;
        if spec.ops.is_empty() {
            return Err(InvalidTicket("ops must not be empty".to_string()));
        }
        let url = ImageUrl::parse(&spec.url).map_err(|e| InvalidTicket(e.to_string()))?;
        Ok(Self {
            uuid,
            ops: spec.ops,
            size: spec.size,
            url,
            sparse: spec.sparse,
            filename: spec.filename,
            timeout: spec.timeout,
        })
    }

    /// The backend open mode covering the ticket's operations.
    #[must_use]
    pub fn mode(&self) -> Mode {
        match (
            self.ops.contains(&TicketOp::Read),
            self.ops.contains(&TicketOp::Write),
        ) {
            (true, true) => Mode::ReadWrite,
            (false, true) => Mode::Write,
            // ops is never empty, so the remaining cases read.
            _ => Mode::Read,
        }
    }
}

/// Redacted ticket projection returned by the control channel.
///
/// The URL never leaves the daemon; a controller that lost it cannot recover
/// credentials through this API.
#[derive(Debug, Deserialize, Serialize)]
pub struct TicketInfo {
    /// Ticket UUID.
    pub uuid: String,
    /// Size ceiling in bytes.
    pub size: u64,
    /// Idle timeout in seconds.
    pub timeout: u64,
    /// Expiration time, seconds on the daemon's monotonic clock.
    pub expires: u64,
    /// Seconds since the last successful authorization.
    pub idle_time: u64,
    /// Bytes transferred, counting each image byte once.
    pub transferred: u64,
    /// Number of connections currently attached.
    pub active: u64,
}

#[derive(Debug)]
struct TicketState {
    timeout_ms: u64,
    expires_ms: u64,
    connections: u64,
    ranges: RangeList,
    canceled: bool,
}

#[derive(Debug)]
struct TicketRecord {
    uuid: Uuid,
    ops: Vec<TicketOp>,
    size: u64,
    url: ImageUrl,
    sparse: bool,
    filename: Option<String>,
    state: Mutex<TicketState>,
    // Signaled when connections drops to zero or the ticket is canceled.
    idle: Condvar,
}

impl TicketRecord {
    fn lock(&self) -> MutexGuard<'_, TicketState> {
        // A panic while holding the lock leaves counters consistent enough
        // for cleanup; do not poison the whole daemon.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn monotonic_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

// Milliseconds on the process monotonic clock. Wall clock jumps must not
// expire tickets.
fn now_ms() -> u64 {
    monotonic_base().elapsed().as_millis() as u64
}

/// The process-wide ticket store.
#[derive(Clone, Default)]
pub struct Authority {
    tickets: Arc<RwLock<HashMap<Uuid, Arc<TicketRecord>>>>,
}

impl Authority {
    /// Creates an empty authority.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a ticket, replacing an existing one only when it is canceled or
    /// expired.
    pub fn add(&self, ticket: Ticket) -> Result<(), AuthError> {
        let mut tickets = self.write_map();
        if let Some(existing) = tickets.get(&ticket.uuid) {
            let state = existing.lock();
            let replaceable = state.canceled || now_ms() >= state.expires_ms;
            if !replaceable {
                return Err(AuthError::AlreadyExists(ticket.uuid));
            }
        }
        let now = now_ms();
        let timeout_ms = ticket.timeout.saturating_mul(1000);
        debug!(uuid = %ticket.uuid, size = ticket.size, timeout = ticket.timeout, "adding ticket");
        tickets.insert(
            ticket.uuid,
            Arc::new(TicketRecord {
                uuid: ticket.uuid,
                ops: ticket.ops,
                size: ticket.size,
                url: ticket.url,
                sparse: ticket.sparse,
                filename: ticket.filename,
                state: Mutex::new(TicketState {
                    timeout_ms,
                    expires_ms: now.saturating_add(timeout_ms),
                    connections: 0,
                    ranges: RangeList::new(),
                    canceled: false,
                }),
                idle: Condvar::new(),
            }),
        );
        Ok(())
    }

    /// Returns the redacted projection of a ticket.
    pub fn get(&self, uuid: Uuid) -> Result<TicketInfo, AuthError> {
        let record = self.find(uuid).ok_or(AuthError::NotFound(uuid))?;
        let state = record.lock();
        let now = now_ms();
        let last_access_ms = state.expires_ms.saturating_sub(state.timeout_ms);
        Ok(TicketInfo {
            uuid: record.uuid.to_string(),
            size: record.size,
            timeout: state.timeout_ms / 1000,
            expires: state.expires_ms / 1000,
            idle_time: now.saturating_sub(last_access_ms) / 1000,
            transferred: state.ranges.sum(),
            active: state.connections,
        })
    }

    /// Refreshes a ticket's timeout and recomputes its expiration.
    pub fn patch(&self, uuid: Uuid, timeout: u64) -> Result<(), AuthError> {
        let record = self.find(uuid).ok_or(AuthError::NotFound(uuid))?;
        let mut state = record.lock();
        state.timeout_ms = timeout.saturating_mul(1000);
        state.expires_ms = now_ms().saturating_add(state.timeout_ms);
        debug!(%uuid, timeout, "refreshed ticket timeout");
        Ok(())
    }

    /// Cancels a ticket and deletes it once idle, waiting up to `wait`.
    ///
    /// On timeout the ticket stays canceled, since in-flight operations
    /// are observing the flag, and [`AuthError::Busy`] is returned so the
    /// caller can retry the delete.
    pub fn remove(&self, uuid: Uuid, wait: Duration) -> Result<(), AuthError> {
        let record = self.find(uuid).ok_or(AuthError::NotFound(uuid))?;

        let mut state = record.lock();
        state.canceled = true;
        record.idle.notify_all();

        let deadline = Instant::now() + wait;
        while state.connections > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!(%uuid, connections = state.connections, "delete timed out, ticket canceled");
                return Err(AuthError::Busy {
                    connections: state.connections,
                });
            }
            state = record
                .idle
                .wait_timeout(state, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        drop(state);

        self.write_map().remove(&uuid);
        debug!(%uuid, "removed ticket");
        Ok(())
    }

    /// Checks a request against a ticket and accounts the new connection.
    ///
    /// `length` of `None` means "to the end of the ticket". On success the
    /// ticket's expiration is extended and its connection count bumped; on
    /// failure nothing changes.
    pub fn authorize(
        &self,
        uuid: Uuid,
        op: TicketOp,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Authorized, AuthError> {
        let record = self
            .find(uuid)
            .ok_or_else(|| AuthError::Unauthorized(format!("no such ticket {uuid}")))?;

        let mut state = record.lock();
        if state.canceled {
            return Err(AuthError::Unauthorized(format!("ticket {uuid} canceled")));
        }
        if now_ms() >= state.expires_ms {
            return Err(AuthError::Expired);
        }
        if !record.ops.contains(&op) {
            return Err(AuthError::Forbidden(format!(
                "ticket {uuid} does not allow {op}"
            )));
        }
        let length = match length {
            Some(length) => length,
            None => record.size.saturating_sub(offset),
        };
        let end = offset.checked_add(length);
        match end {
            Some(end) if end <= record.size => {}
            _ => {
                return Err(AuthError::RangeNotSatisfiable { size: record.size });
            }
        }

        state.expires_ms = now_ms().saturating_add(state.timeout_ms);
        state.connections += 1;
        drop(state);

        Ok(Authorized {
            record,
            offset,
            length,
            released: false,
        })
    }

    /// Deletes tickets that are both dead (expired or canceled) and idle.
    pub fn sweep(&self) {
        let now = now_ms();
        let mut tickets = self.write_map();
        tickets.retain(|uuid, record| {
            let state = record.lock();
            let dead =
                (state.canceled || now >= state.expires_ms) && state.connections == 0;
            if dead {
                info!(%uuid, "sweeping expired ticket");
            }
            !dead
        });
    }

    /// Number of stored tickets, dead or alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    fn find(&self, uuid: Uuid) -> Option<Arc<TicketRecord>> {
        self.read_map().get(&uuid).cloned()
    }

    fn read_map(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<TicketRecord>>> {
        self.tickets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_map(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<TicketRecord>>> {
        self.tickets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[cfg(test)]
    fn force_expire(&self, uuid: Uuid) {
        let record = self.find(uuid).expect("ticket exists");
        record.lock().expires_ms = 0;
    }
}

/// Proof of a successful authorization, bound to one operation.
///
/// Dropping the handle releases the connection slot; operations release
/// explicitly so the bytes they actually touched are merged into the
/// ticket's accounting on success and error paths alike.
#[derive(Debug)]
pub struct Authorized {
    record: Arc<TicketRecord>,
    offset: u64,
    length: u64,
    released: bool,
}

impl Authorized {
    /// The authorized byte offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The authorized byte length.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// The ticket's size ceiling.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.record.size
    }

    /// Whether the ticket allows sparse writes.
    #[must_use]
    pub fn sparse(&self) -> bool {
        self.record.sparse
    }

    /// The ticket's backing image URL.
    #[must_use]
    pub fn url(&self) -> &ImageUrl {
        &self.record.url
    }

    /// The ticket's UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.record.uuid
    }

    /// The download filename hint, if the controller provided one.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.record.filename.as_deref()
    }

    /// The backend mode covering the ticket's operations.
    #[must_use]
    pub fn mode(&self) -> Mode {
        match (
            self.record.ops.contains(&TicketOp::Read),
            self.record.ops.contains(&TicketOp::Write),
        ) {
            (true, true) => Mode::ReadWrite,
            (false, true) => Mode::Write,
            _ => Mode::Read,
        }
    }

    /// Fails once the ticket is canceled or its deadline has passed.
    ///
    /// Streaming operations call this between chunks, so a delete does not
    /// wait for a slow client and an operation cannot outlive the ticket
    /// timeout it was authorized under.
    pub fn check_cancel(&self) -> Result<(), AuthError> {
        let state = self.record.lock();
        if state.canceled {
            return Err(AuthError::Cancelled);
        }
        if now_ms() >= state.expires_ms {
            return Err(AuthError::Expired);
        }
        Ok(())
    }

    /// Releases the connection slot, merging the accessed range into the
    /// ticket's accounting. Safe to call more than once; only the first
    /// call has an effect.
    pub fn release(&mut self, accessed: Option<Range>) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.record.lock();
        state.connections = state.connections.saturating_sub(1);
        if let Some(range) = accessed {
            state.ranges.add(range);
        }
        if state.connections == 0 {
            self.record.idle.notify_all();
        }
    }
}

impl Drop for Authorized {
    fn drop(&mut self) {
        self.release(None);
    }
}
