//! # Request/Response Tracker
//!
//! Correlates outgoing client requests with incoming server responses and
//! the mirror image: incoming requests delivered into local servers with
//! the completions that answer them. Every record is keyed by the proxy
//! message id minted when the request first crossed the proxy.
//!
//! ## Outbound (host side)
//!
//! A local client's request forwarded to the peer leaves behind an
//! [`OutboundRequest`]: the client's message token (completed when the
//! response arrives), the session to close if the expiry timer fires
//! first, and the ordered list of optimized output parameters whose
//! buffers receive copy-back from the response.
//!
//! ## Inbound (consumer side)
//!
//! A peer's request delivered into the real local server leaves behind an
//! [`InboundRequest`]: the delivery token the local completion will carry,
//! and the scratch buffers the receiver allocated while reconstructing
//! optimized parameters, popped in order by the response sender and released
//! with the record.
//!
//! Exactly one of three things happens to every record: its response
//! completes it, its timer expires, or a session/service/link teardown
//! sweeps it. No completion callback ever fires twice: removal from the
//! table *is* the single-shot guarantee.

use crate::error::ProxyError;
use crate::fabric::{BufferToken, LocalMsgToken, SessionHandle};
use std::collections::{HashMap, VecDeque};

/// One optimized output parameter recorded while forwarding a request.
#[derive(Debug, Clone)]
pub struct OutParamRec {
    /// The client-provided buffer that receives the response copy-back.
    pub token: BufferToken,
    /// Declared capacity; the response payload may be shorter.
    pub capacity: u64,
    /// Text vs. byte-string, preserved for the local re-emit.
    pub text: bool,
}

/// A client request forwarded to the peer, awaiting a SERVER_RESPONSE.
#[derive(Debug)]
pub struct OutboundRequest {
    pub system: String,
    pub service_id: u32,
    /// The requesting local client's session.
    pub session: SessionHandle,
    /// The local message completed when the response arrives.
    pub local_msg: LocalMsgToken,
    /// The id at the head of the client's payload, echoed into
    /// engine-generated error completions.
    pub local_ipc_id: u32,
    /// Ordered optimized-output records; consumed front-to-back by the
    /// response.
    pub out_params: VecDeque<OutParamRec>,
    /// Client event-context token minted while repacking this request, if
    /// it was an add-handler registration.
    pub context: Option<u32>,
}

/// A peer request delivered into the real local server, awaiting its
/// completion.
#[derive(Debug)]
pub struct InboundRequest {
    pub system: String,
    pub service_id: u32,
    /// The consumer session the request was delivered on.
    pub session: SessionHandle,
    /// The delivery token the local completion will reference.
    pub local_msg: LocalMsgToken,
    /// Receiver-allocated scratch buffers for optimized parameters, popped
    /// in order by the response sender.
    pub recv_buffers: VecDeque<BufferToken>,
    /// Server event-context token minted while reconstructing this
    /// request, if it was an add-handler registration.
    pub server_ctx: Option<u32>,
}

/// Both pending tables, bounded by a shared in-flight capacity.
pub struct RequestTracker {
    outbound: HashMap<u32, OutboundRequest>,
    inbound: HashMap<u32, InboundRequest>,
    /// Completion lookup: local delivery token → proxy message id.
    by_local: HashMap<LocalMsgToken, u32>,
    capacity: usize,
}

impl RequestTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            by_local: HashMap::new(),
            capacity,
        }
    }

    fn full(&self) -> bool {
        self.outbound.len() + self.inbound.len() >= self.capacity
    }

    /// Room for one more record in either direction.
    pub fn has_capacity(&self) -> bool {
        !self.full()
    }

    /// True while `id` names a live record in either direction. Feeds the
    /// id allocator's non-reuse guarantee.
    pub fn is_tracked(&self, id: u32) -> bool {
        self.outbound.contains_key(&id) || self.inbound.contains_key(&id)
    }

    pub fn insert_outbound(&mut self, id: u32, req: OutboundRequest) -> Result<(), ProxyError> {
        if self.full() {
            return Err(ProxyError::ResourceExhausted("in-flight proxy messages"));
        }
        self.outbound.insert(id, req);
        Ok(())
    }

    pub fn insert_inbound(&mut self, id: u32, req: InboundRequest) -> Result<(), ProxyError> {
        if self.full() {
            return Err(ProxyError::ResourceExhausted("in-flight proxy messages"));
        }
        self.by_local.insert(req.local_msg, id);
        self.inbound.insert(id, req);
        Ok(())
    }

    pub fn outbound(&self, id: u32) -> Option<&OutboundRequest> {
        self.outbound.get(&id)
    }

    pub fn outbound_mut(&mut self, id: u32) -> Option<&mut OutboundRequest> {
        self.outbound.get_mut(&id)
    }

    /// Remove an outbound record: response arrived, timer fired, or a
    /// teardown sweep claimed it.
    pub fn take_outbound(&mut self, id: u32) -> Option<OutboundRequest> {
        self.outbound.remove(&id)
    }

    pub fn inbound_mut(&mut self, id: u32) -> Option<&mut InboundRequest> {
        self.inbound.get_mut(&id)
    }

    /// Resolve a local completion back to its proxy message id and record.
    pub fn take_inbound_by_local(
        &mut self,
        token: LocalMsgToken,
    ) -> Option<(u32, InboundRequest)> {
        let id = self.by_local.remove(&token)?;
        self.inbound.remove(&id).map(|req| (id, req))
    }

    /// Remove every record scoped to one service; used by disconnect and
    /// returned so the caller can complete each with an error and release
    /// buffers.
    pub fn release_service(
        &mut self,
        system: &str,
        service_id: u32,
    ) -> (Vec<(u32, OutboundRequest)>, Vec<(u32, InboundRequest)>) {
        let out_ids: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, r)| r.system == system && r.service_id == service_id)
            .map(|(&id, _)| id)
            .collect();
        let in_ids: Vec<u32> = self
            .inbound
            .iter()
            .filter(|(_, r)| r.system == system && r.service_id == service_id)
            .map(|(&id, _)| id)
            .collect();
        self.remove_sets(out_ids, in_ids)
    }

    /// Remove every record scoped to one local session; used when a client
    /// terminates mid-request so no dangling completion can fire.
    pub fn release_session(
        &mut self,
        session: SessionHandle,
    ) -> (Vec<(u32, OutboundRequest)>, Vec<(u32, InboundRequest)>) {
        let out_ids: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, r)| r.session == session)
            .map(|(&id, _)| id)
            .collect();
        let in_ids: Vec<u32> = self
            .inbound
            .iter()
            .filter(|(_, r)| r.session == session)
            .map(|(&id, _)| id)
            .collect();
        self.remove_sets(out_ids, in_ids)
    }

    /// Remove every record scoped to one peer system; used on link down.
    pub fn release_system(
        &mut self,
        system: &str,
    ) -> (Vec<(u32, OutboundRequest)>, Vec<(u32, InboundRequest)>) {
        let out_ids: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, r)| r.system == system)
            .map(|(&id, _)| id)
            .collect();
        let in_ids: Vec<u32> = self
            .inbound
            .iter()
            .filter(|(_, r)| r.system == system)
            .map(|(&id, _)| id)
            .collect();
        self.remove_sets(out_ids, in_ids)
    }

    fn remove_sets(
        &mut self,
        out_ids: Vec<u32>,
        in_ids: Vec<u32>,
    ) -> (Vec<(u32, OutboundRequest)>, Vec<(u32, InboundRequest)>) {
        let outs = out_ids
            .into_iter()
            .filter_map(|id| self.outbound.remove(&id).map(|r| (id, r)))
            .collect();
        let ins = in_ids
            .into_iter()
            .filter_map(|id| {
                self.inbound.remove(&id).map(|r| {
                    self.by_local.remove(&r.local_msg);
                    (id, r)
                })
            })
            .collect();
        (outs, ins)
    }

    pub fn len(&self) -> usize {
        self.outbound.len() + self.inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }
}
