use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Global counter for assigning session numbers.
///
/// Session numbers are process-unique and monotonically increasing. They
/// show up in logs and as the suffix of per-session record files
/// (`FILE.<session>`), so they intentionally start at 1 and stay small.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate the next session number
pub fn next_session_id() -> u64 {
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a single proxied console session.
///
/// A session moves strictly forward; `Closed` is reachable from every
/// state when an error occurs or either peer goes away.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Token extracted, waiting on the authorization service
    Authenticating,
    /// Opening the TCP connection to the resolved target
    Connecting,
    /// Running the CONNECT handshake against the internal access path
    Handshaking,
    /// Full-duplex byte relay in progress
    Relaying,
    /// Both connections torn down
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Authenticating => "authenticating",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-connection session bookkeeping.
///
/// Owned exclusively by the worker task that drives the connection;
/// nothing here is shared across sessions.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    state: SessionState,
}

impl Session {
    /// Create a new session in the `Authenticating` state
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: next_session_id(),
            peer,
            state: SessionState::Authenticating,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move the session to the next lifecycle state
    pub fn advance(&mut self, next: SessionState) {
        debug!(
            session = self.id,
            from = %self.state,
            to = %next,
            "session state change"
        );
        self.state = next;
    }
}
