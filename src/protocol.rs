//! Wire contract for the shared store and broker channels.
//!
//! The key and channel formats here are an interop contract: other processes
//! (possibly written in other languages) read and write the same keyspace, so
//! the formats must not drift.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a logical session that connections attach to.
pub type SessionId = i64;

/// Identifier of an authenticated user, when the collaborator supplies one.
pub type UserId = i64;

/// Time-to-live applied to every directory key, in seconds.
///
/// Entries for connections that were never explicitly disconnected (process
/// crash, leaked socket) disappear once this elapses. Refreshed on writes.
pub const DEFAULT_DIRECTORY_TTL_SECS: u64 = 3600;

/// Channel prefix for session event channels.
pub const SESSION_CHANNEL_PREFIX: &str = "session:";

/// Pattern matching every session channel.
pub const SESSION_CHANNEL_PATTERN: &str = "session:*";

/// Hash holding one field per live connection for a session.
pub fn session_connections_key(session_id: SessionId) -> String {
    format!("session:{session_id}:connections")
}

/// Reverse mapping from a connection id back to its session.
pub fn connection_session_key(connection_id: &str) -> String {
    format!("connection:{connection_id}:session")
}

/// Diagnostic connect/disconnect counter for a session. Not authoritative;
/// the hash length is.
pub fn session_counter_key(session_id: SessionId) -> String {
    format!("session:{session_id}:connection_count")
}

/// Pub/sub channel carrying events for one session.
pub fn session_channel(session_id: SessionId) -> String {
    format!("session:{session_id}")
}

/// Extract the session id from a channel name.
///
/// The channel format is `session:{id}` -- everything after the first colon
/// is the id. Returns `None` for channels outside the namespace or with a
/// non-numeric id.
pub fn parse_session_channel(channel: &str) -> Option<SessionId> {
    let rest = channel.strip_prefix(SESSION_CHANNEL_PREFIX)?;
    rest.parse().ok()
}

/// The JSON object published to a session channel: the caller's event with a
/// `server_id` field injected so recipients can trace provenance.
///
/// The listener deliberately does NOT use `server_id` to filter out messages
/// this process published itself -- provenance is best-effort, and local
/// delivery being keyed by connection id keeps the duplicate bounded to one
/// extra frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Short id of the process that published this event.
    pub server_id: String,
    /// The collaborator's event object, flattened alongside `server_id`.
    #[serde(flatten)]
    pub event: Map<String, Value>,
}

impl Envelope {
    pub fn new(server_id: &str, mut event: Map<String, Value>) -> Self {
        // The injected field wins; leaving a caller-supplied server_id in the
        // map would serialize the key twice through the flatten.
        event.remove("server_id");
        Self {
            server_id: server_id.to_string(),
            event,
        }
    }
}

/// Metadata stored as the value of one hash field in
/// `session:{id}:connections`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Short id of the process that accepted the socket. Connections are
    /// owned exclusively by that process and never migrate.
    pub server_id: String,
    pub user_id: Option<UserId>,
    /// Seconds since the Unix epoch at accept time.
    pub connected_at: f64,
    /// Always `"active"` today; kept in the record for forward compatibility
    /// with readers in other languages.
    pub status: String,
}

/// Diagnostic snapshot of a session's connection state, combining the
/// cross-process directory view with this process's local view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    /// Number of directory entries (authoritative cross-process count).
    pub total_connections: usize,
    /// Value of the diagnostic counter key.
    pub connection_count: i64,
    /// Connection ids attached to this process.
    pub local_connections: Vec<String>,
    /// This process's server id.
    pub server_id: String,
    /// Every connection id the directory knows for this session, local or not.
    pub remote_connection_ids: Vec<String>,
}
