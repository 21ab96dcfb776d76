//! # Peer Link Transport Abstraction
//!
//! This module provides the unified abstraction for the byte-oriented
//! transports that carry proxy frames between peer systems. It defines the
//! core traits and the factory used to instantiate the configured link for
//! each peer.
//!
//! ## Key Design Principles
//!
//! - **Unified Interface**: every link mechanism implements the same
//!   [`Transport`] trait
//! - **Byte Orientation**: a link moves opaque bytes; framing is entirely
//!   the wire codec's concern
//! - **Split Halves**: connecting yields independent sender and receiver
//!   halves, so the receive pump can run while sends originate elsewhere
//! - **Async-First**: built on Tokio; the receive primitive may return
//!   fewer bytes than requested and never blocks the loop
//! - **Short Reads Are Normal**: the receiver state machine stores partial
//!   progress and resumes on the next readiness notification
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │    Network      │───▶│    Transport     │───▶│    Specific     │
//! │   Supervisor    │    │      Trait       │    │ Implementation  │
//! │   (per peer)    │    │  (abstraction)   │    │ (TCP/UDS/Mem)   │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! ## Supported Link Mechanisms
//!
//! - **TCP**: network-capable links with low-latency socket tuning
//! - **Unix Domain Sockets**: same-host links with filesystem addressing
//! - **In-Memory Duplex**: paired links for tests and single-process demos
//!
//! Each link is strictly point-to-point: a listening variant accepts
//! exactly one peer, matching the one-link-per-system model.

use crate::config::LinkTransport;
use crate::error::TransportError;
use async_trait::async_trait;

pub mod memory;
pub mod tcp;
pub mod uds;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;
pub use uds::UnixTransport;

/// Socket buffer size applied to network links.
pub const LINK_BUFFER_SIZE: usize = 64 * 1024;

/// Read chunk used by the receive pump; the receiver state machine accepts
/// arbitrary fragmentation, so this only bounds syscall granularity.
pub const RECV_CHUNK_SIZE: usize = 4096;

/// The sending half of an established link.
#[async_trait]
pub trait LinkSender: Send {
    /// Write one frame's bytes to the link. Any failure is fatal for the
    /// link: the caller tears it down and arms the reconnect timer.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// The receiving half of an established link.
#[async_trait]
pub trait LinkReceiver: Send {
    /// Read up to `buf.len()` bytes, returning how many arrived. May
    /// return fewer bytes than requested; an orderly peer close yields
    /// [`TransportError::Closed`].
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// A configured but not yet established link to one peer system.
#[async_trait]
pub trait Transport: Send {
    /// Human-readable link identifier for logging.
    fn id(&self) -> String;

    /// Establish the link (dial or accept one peer) and return its halves.
    async fn connect(
        &mut self,
    ) -> Result<(Box<dyn LinkSender>, Box<dyn LinkReceiver>), TransportError>;
}

/// Factory for creating transport instances from link configuration.
///
/// Mirrors the construction pattern used for the fabric: the supervisor
/// asks for a link by configuration value and receives a boxed trait
/// object ready to connect.
pub struct TransportFactory;

impl TransportFactory {
    /// Create the transport named by a [`LinkTransport`] value.
    pub fn create(link: &LinkTransport) -> Box<dyn Transport> {
        match link {
            LinkTransport::TcpConnect { addr } => Box::new(TcpTransport::dial(addr.clone())),
            LinkTransport::TcpListen { addr } => Box::new(TcpTransport::listen(addr.clone())),
            LinkTransport::UnixConnect { path } => Box::new(UnixTransport::dial(path.clone())),
            LinkTransport::UnixListen { path } => Box::new(UnixTransport::listen(path.clone())),
            // The runtime replaces this before running; a stray connect
            // attempt fails cleanly and retries on the reconnect timer.
            LinkTransport::InProcess => Box::new(MemoryTransport::unconnected("placeholder")),
        }
    }
}
