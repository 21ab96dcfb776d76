//! # Async Event-Handler Context Tables
//!
//! Asynchronous callbacks cross the proxy twice: a local client registers a
//! handler (its context cookie travels to the peer inside the add-handler
//! request), and much later the remote server fires events that must land
//! back on the registering client's session with the original cookie
//! restored. Raw local values never travel the wire; each side keeps a
//! table translating between its local values and stable wire tokens.
//!
//! Two tables exist because the two sides of a registration store different
//! things:
//!
//! - the **client side** (where the registering client lives) records
//!   `{session, original context, owning service}` under a minted token;
//!   the token is what travels in the request and later identifies the
//!   target session of incoming `SERVER_ASYNC_EVENT` messages;
//! - the **server side** (where the real server lives) records the
//!   client side's wire token plus, once the registration completes, the
//!   real server's handler value, under its own minted token; that token
//!   is what the client side stores as the remote handler reference and
//!   echoes in a remove-handler call.
//!
//! A record is released on the earliest of: client remove-handler, client
//! session close, owning service disconnect, or peer link loss.

use crate::fabric::SessionHandle;
use crate::tables::RefTable;

/// Client-side record of one async-handler registration.
#[derive(Debug)]
pub struct ClientContext {
    pub system: String,
    pub service_id: u32,
    /// The registering local client's session.
    pub session: SessionHandle,
    /// The client's original context cookie, restored on every event.
    pub original_context: u64,
    /// The server side's handler token, filled when the paired response
    /// arrives.
    pub handler: Option<u64>,
}

/// Server-side record of one async-handler registration.
#[derive(Debug)]
pub struct ServerContext {
    pub system: String,
    pub service_id: u32,
    /// The client side's wire token, echoed in every forwarded event.
    pub wire_context: u64,
    /// The real server's handler value, filled from its registration
    /// response; resolved again on remove-handler.
    pub local_handler: Option<u64>,
}

/// Both context tables, bounded by the async-handler capacity.
pub struct EventContexts {
    clients: RefTable<ClientContext>,
    servers: RefTable<ServerContext>,
}

impl EventContexts {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: RefTable::new("client event contexts", capacity),
            servers: RefTable::new("server event contexts", capacity),
        }
    }

    /// Mint a client-side token for a context cookie seen in an outgoing
    /// add-handler request.
    pub fn mint_client(
        &mut self,
        rec: ClientContext,
    ) -> Result<u32, crate::error::ProxyError> {
        self.clients.insert(rec)
    }

    /// Mint a server-side token for a wire context seen in an incoming
    /// add-handler request.
    pub fn mint_server(
        &mut self,
        rec: ServerContext,
    ) -> Result<u32, crate::error::ProxyError> {
        self.servers.insert(rec)
    }

    pub fn client(&self, token: u32) -> Option<&ClientContext> {
        self.clients.get(token)
    }

    pub fn client_mut(&mut self, token: u32) -> Option<&mut ClientContext> {
        self.clients.get_mut(token)
    }

    pub fn server(&self, token: u32) -> Option<&ServerContext> {
        self.servers.get(token)
    }

    pub fn server_mut(&mut self, token: u32) -> Option<&mut ServerContext> {
        self.servers.get_mut(token)
    }

    pub fn release_client(&mut self, token: u32) -> Option<ClientContext> {
        self.clients.remove(token)
    }

    pub fn release_server(&mut self, token: u32) -> Option<ServerContext> {
        self.servers.remove(token)
    }

    /// Release every record scoped to a client session (session close).
    pub fn release_session(&mut self, session: SessionHandle) -> usize {
        self.clients
            .drain_matching(|rec| rec.session == session)
            .len()
    }

    /// Release every record scoped to a service (disconnect).
    pub fn release_service(&mut self, system: &str, service_id: u32) -> usize {
        self.clients
            .drain_matching(|rec| rec.system == system && rec.service_id == service_id)
            .len()
            + self
                .servers
                .drain_matching(|rec| rec.system == system && rec.service_id == service_id)
                .len()
    }

    /// Release every record scoped to a peer system (link down).
    pub fn release_system(&mut self, system: &str) -> usize {
        self.clients.drain_matching(|rec| rec.system == system).len()
            + self.servers.drain_matching(|rec| rec.system == system).len()
    }
}
