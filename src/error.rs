//! # Error Taxonomy Module
//!
//! This module defines the typed error hierarchy used throughout the RPC
//! proxy. Every failure the proxy can encounter maps onto one of a small
//! number of kinds, each with a fixed recovery policy:
//!
//! | Kind | Local action | Wire consequence |
//! |---|---|---|
//! | `Transport` | Drop the link, release dependents, arm reconnect | none |
//! | `Format` | Drop the link | none |
//! | `ResourceExhausted` | Answer originator with a no-memory response | no-memory response |
//! | `ProtocolMismatch` | Reject the connect, keep the link up | error service-code |
//! | `ServiceUnavailable` | Drop at the sender | none |
//! | `ClientTimeout` | Close the requesting client's session | none |
//! | `Stream` | Close the stream | FORCE_CLOSE |
//!
//! Nothing in this table is fatal to the daemon itself: per-request errors
//! surface through the caller's normal completion channel, per-link errors
//! rely on the reconnect timer, per-service errors rely on the service
//! retry timer.

use thiserror::Error;

/// Errors produced by a transport link implementation.
///
/// Transport errors are always fatal *for the link they occur on*: the
/// supervisor tears the link down and arms the reconnect timer. They are
/// never fatal for the proxy process.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket/pipe error.
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection (EOF on receive).
    #[error("link closed by peer")]
    Closed,

    /// The link is not connected yet (or no longer).
    #[error("link not connected")]
    NotConnected,
}

/// The proxy-wide error type.
///
/// Each variant corresponds to one row of the recovery-policy table in the
/// module documentation. Code that detects an error condition constructs
/// the matching variant; code that *handles* errors matches on the variant
/// to select the recovery policy, never on message text.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Send/receive on a peer link failed.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The receiver saw bytes that do not form a valid proxy message:
    /// unknown message type, unexpected CBOR item, unknown semantic tag,
    /// truncated header, or an invalid file-stream flag combination.
    #[error("malformed wire data: {0}")]
    Format(String),

    /// A bounded table was full when the receive or send path needed a new
    /// entry. The embedded name identifies the table for diagnostics.
    #[error("table capacity exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A CONNECT_SERVICE_REQUEST named a protocol the local binding does
    /// not speak.
    #[error("protocol mismatch for service '{service}': peer offers '{offered}', local binding requires '{required}'")]
    ProtocolMismatch {
        service: String,
        offered: String,
        required: String,
    },

    /// A local client request arrived for a service that is not BOUND.
    #[error("service '{0}' is not bound")]
    ServiceUnavailable(String),

    /// The expiry timer for an in-flight client request fired.
    #[error("client request {0} timed out")]
    ClientTimeout(u32),

    /// Local I/O on a file stream failed.
    #[error("file stream {0} i/o error")]
    Stream(u16),

    /// The local IPC fabric rejected an operation.
    #[error("local ipc fabric: {0}")]
    Fabric(String),
}

impl ProxyError {
    /// Shorthand for building a [`ProxyError::Format`] from anything
    /// displayable. Used pervasively by the receive path.
    pub fn format(msg: impl std::fmt::Display) -> Self {
        ProxyError::Format(msg.to_string())
    }

    /// True when the error tears down the whole peer link (as opposed to a
    /// single request, service, or stream).
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, ProxyError::Transport(_) | ProxyError::Format(_))
    }
}

/// Crate-wide result alias.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
