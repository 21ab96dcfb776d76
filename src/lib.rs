//! # Inter-Node RPC Proxy
//!
//! A daemon that bridges a local component-based IPC fabric to peer
//! daemons on remote nodes over a pluggable byte-oriented transport. Each
//! side presents to its local processes exactly the same service
//! endpoints a local server would, while messages, references, embedded
//! file descriptors, and asynchronous callbacks are marshalled across the
//! link.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod fabric;
pub mod filestream;
pub mod network;
pub mod proxy;
pub mod receiver;
pub mod runtime;
pub mod sender;
pub mod service;
pub mod tables;
pub mod tracker;
pub mod transport;
pub mod wire;

pub use config::{ProxyConfig, ProxyTunables};
pub use error::{ProxyError, TransportError};
pub use proxy::{Action, LoopEvent, Proxy};
pub use runtime::ProxyRuntime;
pub use transport::{Transport, TransportFactory};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compile-time capacity bounds.
///
/// Every table in the proxy is bounded; a full table yields a typed
/// overflow error and the affected request is *answered* with a no-memory
/// response, never dropped silently.
pub mod limits {
    /// Simultaneous service bindings per proxy.
    pub const SERVICE_BINDINGS_MAX: usize = 32;

    /// In-flight proxy messages, both directions combined.
    pub const IN_FLIGHT_MSGS_MAX: usize = 64;

    /// Simultaneous file streams per proxy.
    pub const FILE_STREAMS_MAX: usize = 16;

    /// Live async-handler registrations per side.
    pub const EVENT_HANDLERS_MAX: usize = 32;

    /// Optimized output parameters per request.
    pub const OUT_PARAM_SLOTS_MAX: usize = 8;

    /// Output parameters at or below this size are copied inline instead
    /// of through the buffer table.
    pub const SMALL_OUT_PARAMETER_MAX: usize = 256;

    /// Largest byte-string payload of a single file-stream message.
    pub const FILESTREAM_PAYLOAD_MAX: usize = 4096;
}
