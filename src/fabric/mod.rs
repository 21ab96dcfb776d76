//! # Local IPC Fabric Contract
//!
//! The proxy is a *bridge*: on one side sits the wire protocol, on the
//! other the node-local IPC fabric that real client and server processes
//! talk to. The fabric itself is an external collaborator; the proxy
//! consumes it only through the narrow interface defined here, mirroring
//! the original daemon's use of its messaging API (session create, service
//! advertise, message send/respond, embedded descriptors, close handlers).
//!
//! ## Interaction Model
//!
//! Calls flow both ways:
//!
//! - The engine calls [`IpcFabric`] methods synchronously (advertise a
//!   service, open a session, deliver a reconstructed message, complete a
//!   client's request).
//! - The fabric reports local activity as [`FabricEvent`]s (a client sent a
//!   request, a session closed, a server completed a delivery). Events are
//!   queued inside the fabric and drained by the event loop; the engine is
//!   never re-entered from inside one of its own calls.
//!
//! ## Handles
//!
//! All fabric objects are named by opaque `u32` tokens. The proxy never
//! dereferences fabric state directly; a handle it holds may be
//! invalidated by the fabric at any time, and every call that takes one
//! tolerates staleness.
//!
//! ## Optimized Parameters
//!
//! Large string/byte-array parameters are carried *by token* within one
//! node: the payload holds `{size, buffer-token}` and the bytes live in the
//! fabric's buffer table. The repacker resolves and allocates these tokens
//! through the buffer methods below; tokens never travel the wire.

pub mod loopback;

use crate::error::ProxyError;
use std::os::fd::OwnedFd;

/// Handle to a service the proxy advertises on the fabric (host side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(pub u32);

/// Handle to a session: either a local client's session on a hosted
/// service, or the proxy's own session to a real local server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

/// Handle to one in-flight local message awaiting completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalMsgToken(pub u32);

/// Token naming an entry in the node-local buffer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferToken(pub u32);

/// One local IPC message: a payload plus an optional embedded descriptor.
#[derive(Debug, Default)]
pub struct LocalMessage {
    pub payload: Vec<u8>,
    pub fd: Option<OwnedFd>,
}

impl LocalMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload, fd: None }
    }

    pub fn with_fd(payload: Vec<u8>, fd: OwnedFd) -> Self {
        Self {
            payload,
            fd: Some(fd),
        }
    }
}

/// Local activity reported by the fabric, drained by the event loop.
#[derive(Debug)]
pub enum FabricEvent {
    /// A local client invoked a method on a service we advertise.
    ClientRequest {
        service: ServiceHandle,
        session: SessionHandle,
        /// Completion handle; answered via [`IpcFabric::complete_request`].
        token: LocalMsgToken,
        message: LocalMessage,
        /// False for fire-and-forget sends; no completion is expected.
        needs_response: bool,
    },
    /// A local client's session on a hosted service closed.
    SessionClosed {
        service: ServiceHandle,
        session: SessionHandle,
    },
    /// The real local server completed a request we delivered.
    Completion {
        token: LocalMsgToken,
        message: LocalMessage,
    },
    /// The real local server emitted an asynchronous event on one of the
    /// proxy's consumer sessions.
    AsyncEvent {
        session: SessionHandle,
        message: LocalMessage,
    },
}

/// The narrow fabric interface the proxy consumes.
pub trait IpcFabric {
    /// Create and advertise a service endpoint so local clients can bind
    /// to it (host side, on CONNECT_SERVICE_RESPONSE OK).
    fn advertise(
        &mut self,
        service_name: &str,
        protocol_id: &str,
        max_msg_size: usize,
    ) -> Result<ServiceHandle, ProxyError>;

    /// Withdraw and delete an advertised service. Sessions bound to it are
    /// closed by the fabric; no further events reference the handle.
    fn withdraw(&mut self, service: ServiceHandle);

    /// Open a session to a real local server (consumer side, on
    /// CONNECT_SERVICE_REQUEST).
    fn open_session(
        &mut self,
        service_name: &str,
        protocol_id: &str,
    ) -> Result<SessionHandle, ProxyError>;

    /// Close a session, either direction.
    fn close_session(&mut self, session: SessionHandle);

    /// Deliver a reconstructed request into a consumer session. The fabric
    /// reports the server's answer as [`FabricEvent::Completion`] carrying
    /// the returned token.
    fn deliver_request(
        &mut self,
        session: SessionHandle,
        message: LocalMessage,
        needs_response: bool,
    ) -> Result<LocalMsgToken, ProxyError>;

    /// Complete a local client's pending request (host side).
    fn complete_request(&mut self, token: LocalMsgToken, message: LocalMessage);

    /// Deliver an asynchronous event message to a local client session
    /// (host side).
    fn send_event(&mut self, session: SessionHandle, message: LocalMessage);

    /// Allocate a buffer in the node-local table and return its token.
    fn alloc_buffer(&mut self, data: Vec<u8>) -> Result<BufferToken, ProxyError>;

    /// Resolve a buffer token to a snapshot of its contents.
    fn buffer(&self, token: BufferToken) -> Option<Vec<u8>>;

    /// Overwrite a buffer's contents (out-parameter copy-back).
    fn write_buffer(&mut self, token: BufferToken, data: &[u8]) -> Result<(), ProxyError>;

    /// Release a buffer token.
    fn free_buffer(&mut self, token: BufferToken);

    /// Drain queued local activity.
    fn poll_events(&mut self) -> Vec<FabricEvent>;
}
