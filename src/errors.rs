//! # Error Taxonomy
//!
//! This module defines the complete set of error conditions that can arise
//! while routing packets, dispatching handlers, or running the network peer
//! overlay. Handler-local failures are turned into `{"exception": ...}`
//! reply packets rather than propagated as Rust errors; the variants here
//! are what a caller of `Isle::request_response`, `Manager::add_isle`, or
//! the peer transport sees directly.

use thiserror::Error;

/// All error conditions surfaced by the isle runtime.
#[derive(Error, Debug)]
pub enum IsleError {
    /// A `request_response` call did not receive a matching reply before
    /// its deadline elapsed.
    #[error("timed out waiting for a reply to packet {identifier}")]
    Timeout {
        /// Identifier of the packet that was never answered.
        identifier: String,
    },

    /// A packet's next hop does not name a known isle or the manager
    /// itself.
    #[error("no route to destination: {destination}")]
    UnknownDestination {
        /// The hop that could not be resolved.
        destination: String,
    },

    /// A packet's bytes could not be parsed back into a `Packet`.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A handler was invoked with an argument shape it does not accept.
    #[error("invocation shape error calling {route}: {message}")]
    InvocationShapeError {
        /// The route that was called.
        route: String,
        /// Description of the shape mismatch.
        message: String,
    },

    /// A handler ran but returned an application-level error.
    #[error("handler error calling {route}: {message}")]
    HandlerError {
        /// The route that was called.
        route: String,
        /// The error message the handler produced.
        message: String,
    },

    /// The underlying transport (socket) was closed.
    #[error("transport closed")]
    TransportClosed,

    /// `log.txt` could not be written. Non-fatal: the buffer is retried on
    /// the next flush.
    #[error("failed to persist routing log: {0}")]
    LogPersistenceError(String),

    /// An isle identifier was already registered with the manager.
    #[error("isle '{0}' is already registered")]
    DuplicateIsle(String),

    /// A packet's `data` field could not be (de)serialized as JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
