//! # Loopback Fabric
//!
//! An in-process implementation of the [`IpcFabric`] contract. It backs the
//! daemon's self-contained demo mode and every integration suite: test code
//! holds a [`LoopbackHandle`] and plays the role of the local client and
//! server processes, while the engine consumes the same `IpcFabric` surface
//! it would consume from a real fabric.
//!
//! Everything lives behind a single `Rc<RefCell<..>>`: the proxy is
//! single-threaded by design, so the fabric needs no locking, only interior
//! mutability shared between the engine's boxed trait object and the
//! endpoint handle.

use super::{
    BufferToken, FabricEvent, IpcFabric, LocalMessage, LocalMsgToken, ServiceHandle, SessionHandle,
};
use crate::error::ProxyError;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug)]
struct ServiceRec {
    name: String,
    #[allow(dead_code)]
    protocol_id: String,
    #[allow(dead_code)]
    max_msg_size: usize,
}

#[derive(Debug)]
struct LocalServerRec {
    protocol_id: String,
    /// The proxy's consumer session onto this server, once opened.
    session: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
enum SessionKind {
    /// A local client bound to a service the proxy advertises.
    ClientOnHosted { service: u32 },
    /// The proxy's own session to a registered real server.
    ProxyToServer,
}

#[derive(Debug, Clone)]
enum PendingKind {
    /// Minted when a local client sent a request; completion flows back to
    /// the client's completion queue.
    FromLocalClient { session: u32 },
    /// Minted when the proxy delivered a request into a server inbox; the
    /// server completes it through the endpoint handle.
    DeliveredToServer { server: String },
}

#[derive(Default)]
struct Inner {
    next_handle: u32,
    services: HashMap<u32, ServiceRec>,
    servers: HashMap<String, LocalServerRec>,
    sessions: HashMap<u32, SessionKind>,
    pending: HashMap<u32, PendingKind>,
    buffers: HashMap<u32, Vec<u8>>,
    events: VecDeque<FabricEvent>,
    client_completions: HashMap<u32, VecDeque<LocalMessage>>,
    client_events: HashMap<u32, VecDeque<LocalMessage>>,
    server_inbox: HashMap<String, VecDeque<(LocalMsgToken, LocalMessage)>>,
    notifier: Option<mpsc::UnboundedSender<()>>,
}

impl Inner {
    fn mint(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn push_event(&mut self, event: FabricEvent) {
        self.events.push_back(event);
        if let Some(tx) = &self.notifier {
            let _ = tx.send(());
        }
    }
}

/// The engine-facing fabric object.
pub struct LoopbackFabric {
    inner: Rc<RefCell<Inner>>,
}

/// The endpoint-facing handle used by demo and test code to act as the
/// local client and server processes.
#[derive(Clone)]
pub struct LoopbackHandle {
    inner: Rc<RefCell<Inner>>,
}

impl LoopbackFabric {
    /// Create a fabric and its endpoint handle.
    pub fn new() -> (Self, LoopbackHandle) {
        let inner = Rc::new(RefCell::new(Inner::default()));
        (
            Self {
                inner: inner.clone(),
            },
            LoopbackHandle { inner },
        )
    }
}

impl IpcFabric for LoopbackFabric {
    fn advertise(
        &mut self,
        service_name: &str,
        protocol_id: &str,
        max_msg_size: usize,
    ) -> Result<ServiceHandle, ProxyError> {
        let mut inner = self.inner.borrow_mut();
        let handle = inner.mint();
        debug!(service = service_name, handle, "advertising local service");
        inner.services.insert(
            handle,
            ServiceRec {
                name: service_name.to_owned(),
                protocol_id: protocol_id.to_owned(),
                max_msg_size,
            },
        );
        Ok(ServiceHandle(handle))
    }

    fn withdraw(&mut self, service: ServiceHandle) {
        let mut inner = self.inner.borrow_mut();
        if inner.services.remove(&service.0).is_none() {
            return;
        }
        // The fabric closes every session bound to a withdrawn service.
        let bound: Vec<u32> = inner
            .sessions
            .iter()
            .filter_map(|(&id, kind)| match kind {
                SessionKind::ClientOnHosted { service: s } if *s == service.0 => Some(id),
                _ => None,
            })
            .collect();
        for id in bound {
            inner.sessions.remove(&id);
            inner.client_completions.remove(&id);
            inner.client_events.remove(&id);
        }
    }

    fn open_session(
        &mut self,
        service_name: &str,
        protocol_id: &str,
    ) -> Result<SessionHandle, ProxyError> {
        let mut inner = self.inner.borrow_mut();
        let required = match inner.servers.get(service_name) {
            Some(rec) => rec.protocol_id.clone(),
            None => return Err(ProxyError::ServiceUnavailable(service_name.to_owned())),
        };
        if required != protocol_id {
            return Err(ProxyError::ProtocolMismatch {
                service: service_name.to_owned(),
                offered: protocol_id.to_owned(),
                required,
            });
        }
        let handle = inner.mint();
        inner.sessions.insert(handle, SessionKind::ProxyToServer);
        if let Some(rec) = inner.servers.get_mut(service_name) {
            rec.session = Some(handle);
        }
        debug!(service = service_name, handle, "opened consumer session");
        Ok(SessionHandle(handle))
    }

    fn close_session(&mut self, session: SessionHandle) {
        let mut inner = self.inner.borrow_mut();
        inner.sessions.remove(&session.0);
        inner.client_completions.remove(&session.0);
        inner.client_events.remove(&session.0);
        for rec in inner.servers.values_mut() {
            if rec.session == Some(session.0) {
                rec.session = None;
            }
        }
    }

    fn deliver_request(
        &mut self,
        session: SessionHandle,
        message: LocalMessage,
        needs_response: bool,
    ) -> Result<LocalMsgToken, ProxyError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.sessions.contains_key(&session.0) {
            return Err(ProxyError::Fabric(format!(
                "deliver on unknown session {}",
                session.0
            )));
        }
        let server = inner
            .servers
            .iter()
            .find(|(_, rec)| rec.session == Some(session.0))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| ProxyError::Fabric("session is not bound to a server".into()))?;
        let token = inner.mint();
        if needs_response {
            inner
                .pending
                .insert(token, PendingKind::DeliveredToServer { server: server.clone() });
        }
        inner
            .server_inbox
            .entry(server)
            .or_default()
            .push_back((LocalMsgToken(token), message));
        Ok(LocalMsgToken(token))
    }

    fn complete_request(&mut self, token: LocalMsgToken, message: LocalMessage) {
        let mut inner = self.inner.borrow_mut();
        match inner.pending.remove(&token.0) {
            Some(PendingKind::FromLocalClient { session }) => {
                inner
                    .client_completions
                    .entry(session)
                    .or_default()
                    .push_back(message);
            }
            Some(other) => {
                // Completing a server-delivered token from the engine side
                // is a wiring bug; put it back and drop the message.
                inner.pending.insert(token.0, other);
            }
            None => debug!(token = token.0, "completion for released message"),
        }
    }

    fn send_event(&mut self, session: SessionHandle, message: LocalMessage) {
        let mut inner = self.inner.borrow_mut();
        if inner.sessions.contains_key(&session.0) {
            inner
                .client_events
                .entry(session.0)
                .or_default()
                .push_back(message);
        }
    }

    fn alloc_buffer(&mut self, data: Vec<u8>) -> Result<BufferToken, ProxyError> {
        let mut inner = self.inner.borrow_mut();
        let token = inner.mint();
        inner.buffers.insert(token, data);
        Ok(BufferToken(token))
    }

    fn buffer(&self, token: BufferToken) -> Option<Vec<u8>> {
        self.inner.borrow().buffers.get(&token.0).cloned()
    }

    fn write_buffer(&mut self, token: BufferToken, data: &[u8]) -> Result<(), ProxyError> {
        let mut inner = self.inner.borrow_mut();
        let buf = inner
            .buffers
            .get_mut(&token.0)
            .ok_or_else(|| ProxyError::Fabric(format!("unknown buffer token {}", token.0)))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn free_buffer(&mut self, token: BufferToken) {
        self.inner.borrow_mut().buffers.remove(&token.0);
    }

    fn poll_events(&mut self) -> Vec<FabricEvent> {
        self.inner.borrow_mut().events.drain(..).collect()
    }
}

impl LoopbackHandle {
    /// Install a channel that is kicked whenever the fabric queues an
    /// event, so an async runtime can drain without polling.
    pub fn set_notifier(&self, tx: mpsc::UnboundedSender<()>) {
        self.inner.borrow_mut().notifier = Some(tx);
    }

    /// Register a real local server endpoint (consumer side collaborator).
    pub fn register_server(&self, service_name: &str, protocol_id: &str) {
        self.inner.borrow_mut().servers.insert(
            service_name.to_owned(),
            LocalServerRec {
                protocol_id: protocol_id.to_owned(),
                session: None,
            },
        );
    }

    /// Bind a local client to an advertised service.
    pub fn connect_client(&self, service_name: &str) -> Option<(ServiceHandle, SessionHandle)> {
        let mut inner = self.inner.borrow_mut();
        let service = inner
            .services
            .iter()
            .find(|(_, rec)| rec.name == service_name)
            .map(|(&id, _)| id)?;
        let session = inner.mint();
        inner
            .sessions
            .insert(session, SessionKind::ClientOnHosted { service });
        Some((ServiceHandle(service), SessionHandle(session)))
    }

    /// True once a service of this name is advertised.
    pub fn is_advertised(&self, service_name: &str) -> bool {
        self.inner
            .borrow()
            .services
            .values()
            .any(|rec| rec.name == service_name)
    }

    /// Send a request as a local client; the engine sees a
    /// [`FabricEvent::ClientRequest`].
    pub fn client_request(
        &self,
        service: ServiceHandle,
        session: SessionHandle,
        message: LocalMessage,
        needs_response: bool,
    ) -> LocalMsgToken {
        let mut inner = self.inner.borrow_mut();
        let token = inner.mint();
        if needs_response {
            inner.pending.insert(
                token,
                PendingKind::FromLocalClient { session: session.0 },
            );
        }
        inner.push_event(FabricEvent::ClientRequest {
            service,
            session,
            token: LocalMsgToken(token),
            message,
            needs_response,
        });
        LocalMsgToken(token)
    }

    /// Close a local client session; the engine sees a
    /// [`FabricEvent::SessionClosed`].
    pub fn close_client_session(&self, service: ServiceHandle, session: SessionHandle) {
        let mut inner = self.inner.borrow_mut();
        inner.sessions.remove(&session.0);
        inner.push_event(FabricEvent::SessionClosed { service, session });
    }

    /// Whether a session handle is still live in the fabric.
    pub fn session_is_open(&self, session: SessionHandle) -> bool {
        self.inner.borrow().sessions.contains_key(&session.0)
    }

    /// Pop the next completion delivered to a local client session.
    pub fn next_completion(&self, session: SessionHandle) -> Option<LocalMessage> {
        self.inner
            .borrow_mut()
            .client_completions
            .get_mut(&session.0)?
            .pop_front()
    }

    /// Pop the next async event delivered to a local client session.
    pub fn next_client_event(&self, session: SessionHandle) -> Option<LocalMessage> {
        self.inner
            .borrow_mut()
            .client_events
            .get_mut(&session.0)?
            .pop_front()
    }

    /// Pop the next request delivered into a registered server's inbox.
    pub fn next_delivered(&self, service_name: &str) -> Option<(LocalMsgToken, LocalMessage)> {
        self.inner
            .borrow_mut()
            .server_inbox
            .get_mut(service_name)?
            .pop_front()
    }

    /// The proxy's consumer session onto a registered server, once open.
    pub fn server_session(&self, service_name: &str) -> Option<SessionHandle> {
        self.inner
            .borrow()
            .servers
            .get(service_name)?
            .session
            .map(SessionHandle)
    }

    /// Complete a delivered request as the real server; the engine sees a
    /// [`FabricEvent::Completion`].
    pub fn complete(&self, token: LocalMsgToken, message: LocalMessage) {
        let mut inner = self.inner.borrow_mut();
        match inner.pending.remove(&token.0) {
            Some(PendingKind::DeliveredToServer { .. }) => {
                inner.push_event(FabricEvent::Completion { token, message });
            }
            other => {
                debug!(token = token.0, "complete() on non-delivered token");
                if let Some(kind) = other {
                    inner.pending.insert(token.0, kind);
                }
            }
        }
    }

    /// Emit an async event as the real server on the proxy's consumer
    /// session; the engine sees a [`FabricEvent::AsyncEvent`].
    pub fn emit_event(&self, session: SessionHandle, message: LocalMessage) {
        self.inner
            .borrow_mut()
            .push_event(FabricEvent::AsyncEvent { session, message });
    }

    /// Buffer-table access for endpoint code building optimized payloads.
    pub fn alloc_buffer(&self, data: Vec<u8>) -> BufferToken {
        let mut inner = self.inner.borrow_mut();
        let token = inner.mint();
        inner.buffers.insert(token, data);
        BufferToken(token)
    }

    /// Snapshot a buffer's contents.
    pub fn buffer_contents(&self, token: BufferToken) -> Option<Vec<u8>> {
        self.inner.borrow().buffers.get(&token.0).cloned()
    }

    /// Write into a buffer as the server stub would (out-parameter fill).
    pub fn write_buffer(&self, token: BufferToken, data: &[u8]) {
        if let Some(buf) = self.inner.borrow_mut().buffers.get_mut(&token.0) {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
        }
    }
}
