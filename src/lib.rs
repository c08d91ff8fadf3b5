//! session-relay - cross-process WebSocket fan-out for session events.
//!
//! Multiple stateless server processes each hold live WebSocket connections;
//! a shared Redis-compatible store coordinates them. Events published to a
//! session reach every connection attached to it, on any process: the
//! publishing process writes to its local sockets immediately, and a pub/sub
//! channel per session replicates the event to the rest.
//!
//! The business layer talks to this crate through the [`Coordinator`]: an
//! accepted socket is `connect`ed, events go out via `send_to_session`, and
//! the socket is `disconnect`ed when it closes. Everything else (directory
//! bookkeeping, broker replication, stale-entry cleanup) happens behind that
//! surface.
//!
//! [`Coordinator`]: coordinator::Coordinator

pub mod api;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod store;
