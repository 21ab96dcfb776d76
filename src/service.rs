//! # Service Endpoint Table
//!
//! One entry per configured (system, service, protocol) triple, carrying
//! the lifecycle state machine's current position and the wire token that
//! names the binding while it lasts.
//!
//! ## Roles
//!
//! - **Host**: this proxy advertises the service to local clients and
//!   forwards their requests to the peer that runs the real server. Host
//!   endpoints *mint* their service id when they issue a
//!   CONNECT_SERVICE_REQUEST.
//! - **Consumer**: this proxy opens a session to the real local server on
//!   behalf of remote clients. Consumer endpoints *adopt* the service id
//!   the peer announced.
//!
//! ## Lifecycle
//!
//! ```text
//! IDLE ── advertise ─► CONNECT_PENDING ── response ok ──► BOUND
//!            ▲              │ retry timer                   │ disconnect
//!            └──────────────┘                               ▼
//!                                                    DISCONNECTING ─► IDLE
//! ```
//!
//! The id ↔ endpoint mapping is a bijection for the lifetime of a binding:
//! minted ids come from a generation-tagged slot table so a stale id can
//! never alias a later binding, and adopted ids are rejected on collision.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::fabric::{ServiceHandle, SessionHandle};
use crate::tables::RefTable;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Host,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    ConnectPending,
    Bound,
    Disconnecting,
}

/// One configured service endpoint.
#[derive(Debug)]
pub struct ServiceEndpoint {
    pub system: String,
    pub local_name: String,
    pub remote_name: String,
    pub protocol_id: String,
    pub max_msg_size: usize,
    pub role: ServiceRole,
    pub state: ServiceState,
    /// The wire token, while bound (or while a bind is pending).
    pub service_id: Option<u32>,
    /// Host side: the advertised fabric service, while bound.
    pub fabric_service: Option<ServiceHandle>,
    /// Consumer side: the session to the real local server, while bound.
    pub session: Option<SessionHandle>,
}

/// The bounded endpoint table plus both id indexes.
pub struct ServiceTable {
    endpoints: Vec<ServiceEndpoint>,
    /// Minted (host-side) tokens; slot-reusing and generation-tagged.
    minted: RefTable<usize>,
    /// Every live wire id, minted or adopted, to its endpoint.
    by_id: HashMap<u32, usize>,
}

impl ServiceTable {
    /// Build the endpoint set from configuration. Bindings without a
    /// matching server or client entry are skipped; they name services
    /// this proxy plays no role in.
    pub fn new(cfg: &ProxyConfig, capacity: usize) -> Self {
        let mut endpoints = Vec::new();
        for binding in &cfg.bindings {
            if let Some(server) = cfg.server_for(&binding.service_name) {
                endpoints.push(ServiceEndpoint {
                    system: binding.system_name.clone(),
                    local_name: binding.service_name.clone(),
                    remote_name: binding.remote_service_name.clone(),
                    protocol_id: server.protocol_id.clone(),
                    max_msg_size: server.max_msg_size,
                    role: ServiceRole::Host,
                    state: ServiceState::Idle,
                    service_id: None,
                    fabric_service: None,
                    session: None,
                });
            } else if let Some(client) = cfg.client_for(&binding.service_name) {
                endpoints.push(ServiceEndpoint {
                    system: binding.system_name.clone(),
                    local_name: binding.service_name.clone(),
                    remote_name: binding.remote_service_name.clone(),
                    protocol_id: client.protocol_id.clone(),
                    max_msg_size: client.max_msg_size,
                    role: ServiceRole::Consumer,
                    state: ServiceState::Idle,
                    service_id: None,
                    fabric_service: None,
                    session: None,
                });
            } else {
                debug!(
                    service = %binding.service_name,
                    "binding without a server or client entry; skipped"
                );
            }
        }
        Self {
            endpoints,
            minted: RefTable::new("service bindings", capacity),
            by_id: HashMap::new(),
        }
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn max_msg_size_for_id(&self, id: u32) -> Option<usize> {
        self.by_id
            .get(&id)
            .map(|&index| self.endpoints[index].max_msg_size)
    }

    pub fn endpoint(&self, system: &str, local_name: &str) -> Option<&ServiceEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.system == system && e.local_name == local_name)
    }

    pub fn endpoint_mut(&mut self, system: &str, local_name: &str) -> Option<&mut ServiceEndpoint> {
        self.endpoints
            .iter_mut()
            .find(|e| e.system == system && e.local_name == local_name)
    }

    pub fn endpoint_by_id(&self, id: u32) -> Option<&ServiceEndpoint> {
        self.by_id.get(&id).map(|&index| &self.endpoints[index])
    }

    pub fn endpoint_by_id_mut(&mut self, id: u32) -> Option<&mut ServiceEndpoint> {
        self.by_id
            .get(&id)
            .copied()
            .map(move |index| &mut self.endpoints[index])
    }

    /// Find the consumer endpoint a CONNECT_SERVICE_REQUEST targets: the
    /// peer names *our* local service by its remote-facing name.
    pub fn consumer_for_request(
        &mut self,
        system: &str,
        service_name: &str,
    ) -> Option<&mut ServiceEndpoint> {
        self.endpoints.iter_mut().find(|e| {
            e.system == system && e.local_name == service_name && e.role == ServiceRole::Consumer
        })
    }

    /// Local names of every host endpoint on one link, for the supervisor
    /// to kick after link-up.
    pub fn host_names_for_system(&self, system: &str) -> Vec<String> {
        self.endpoints
            .iter()
            .filter(|e| e.system == system && e.role == ServiceRole::Host)
            .map(|e| e.local_name.clone())
            .collect()
    }

    /// Local names of every endpoint on one link with a live id, for
    /// teardown sweeps.
    pub fn bound_names_for_system(&self, system: &str) -> Vec<String> {
        self.endpoints
            .iter()
            .filter(|e| e.system == system && e.service_id.is_some())
            .map(|e| e.local_name.clone())
            .collect()
    }

    /// Mint a fresh wire id for a host endpoint about to issue a connect
    /// request.
    pub fn mint_id(&mut self, system: &str, local_name: &str) -> Result<u32, ProxyError> {
        let index = self
            .endpoints
            .iter()
            .position(|e| e.system == system && e.local_name == local_name)
            .ok_or_else(|| ProxyError::ServiceUnavailable(local_name.to_owned()))?;
        let id = self.minted.insert(index)?;
        // A minted token colliding with an id adopted from another peer is
        // vanishingly unlikely but would break header dispatch; refuse.
        if self.by_id.contains_key(&id) {
            self.minted.remove(id);
            return Err(ProxyError::ResourceExhausted("service id space"));
        }
        self.by_id.insert(id, index);
        self.endpoints[index].service_id = Some(id);
        Ok(id)
    }

    /// Adopt the id a peer announced for one of our consumer endpoints.
    pub fn adopt_id(&mut self, system: &str, local_name: &str, id: u32) -> Result<(), ProxyError> {
        let index = self
            .endpoints
            .iter()
            .position(|e| e.system == system && e.local_name == local_name)
            .ok_or_else(|| ProxyError::ServiceUnavailable(local_name.to_owned()))?;
        if self.by_id.contains_key(&id) {
            return Err(ProxyError::format(format!("service id {id} already bound")));
        }
        self.by_id.insert(id, index);
        self.endpoints[index].service_id = Some(id);
        Ok(())
    }

    /// Release a binding's id, minted or adopted. The endpoint keeps its
    /// configuration and returns to IDLE ownership of the caller.
    pub fn release_id(&mut self, id: u32) {
        if let Some(index) = self.by_id.remove(&id) {
            self.endpoints[index].service_id = None;
        }
        self.minted.remove(id);
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &ServiceEndpoint> {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExportedServer, RequiredClient, ServiceBinding};

    fn cfg() -> ProxyConfig {
        ProxyConfig {
            local_system_name: "A".into(),
            servers: vec![ExportedServer {
                service_name: "svc.foo".into(),
                protocol_id: "P1".into(),
                max_msg_size: 2048,
            }],
            clients: vec![RequiredClient {
                service_name: "svc.bar".into(),
                protocol_id: "P2".into(),
                max_msg_size: 512,
            }],
            bindings: vec![
                ServiceBinding {
                    service_name: "svc.foo".into(),
                    system_name: "B".into(),
                    remote_service_name: "svc.foo.remote".into(),
                },
                ServiceBinding {
                    service_name: "svc.bar".into(),
                    system_name: "B".into(),
                    remote_service_name: "svc.bar".into(),
                },
                ServiceBinding {
                    service_name: "svc.unconfigured".into(),
                    system_name: "B".into(),
                    remote_service_name: "x".into(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn builds_endpoints_by_role_and_skips_unconfigured() {
        let table = ServiceTable::new(&cfg(), 8);
        assert_eq!(table.endpoints().count(), 2);
        assert_eq!(table.endpoint("B", "svc.foo").unwrap().role, ServiceRole::Host);
        assert_eq!(
            table.endpoint("B", "svc.bar").unwrap().role,
            ServiceRole::Consumer
        );
        assert!(table.endpoint("B", "svc.unconfigured").is_none());
    }

    #[test]
    fn minted_id_is_a_bijection_while_bound() {
        let mut table = ServiceTable::new(&cfg(), 8);
        let id = table.mint_id("B", "svc.foo").unwrap();
        assert!(table.contains_id(id));
        assert_eq!(table.endpoint_by_id(id).unwrap().local_name, "svc.foo");
        assert_eq!(table.max_msg_size_for_id(id), Some(2048));

        table.release_id(id);
        assert!(!table.contains_id(id));
        assert_eq!(table.endpoint("B", "svc.foo").unwrap().service_id, None);

        // A new binding gets a different token even in the same slot.
        let id2 = table.mint_id("B", "svc.foo").unwrap();
        assert_ne!(id, id2);
    }

    #[test]
    fn adopted_id_collision_is_rejected() {
        let mut table = ServiceTable::new(&cfg(), 8);
        table.adopt_id("B", "svc.bar", 7).unwrap();
        assert!(table.adopt_id("B", "svc.bar", 7).is_err());
        assert_eq!(table.endpoint_by_id(7).unwrap().local_name, "svc.bar");
    }

    #[test]
    fn request_lookup_matches_consumers_only() {
        let mut table = ServiceTable::new(&cfg(), 8);
        assert!(table.consumer_for_request("B", "svc.bar").is_some());
        assert!(table.consumer_for_request("B", "svc.foo").is_none());
        assert!(table.consumer_for_request("C", "svc.bar").is_none());
    }

    #[test]
    fn system_sweep_helpers() {
        let mut table = ServiceTable::new(&cfg(), 8);
        assert_eq!(table.host_names_for_system("B"), vec!["svc.foo".to_string()]);
        assert!(table.bound_names_for_system("B").is_empty());
        table.mint_id("B", "svc.foo").unwrap();
        assert_eq!(table.bound_names_for_system("B").len(), 1);
    }
}
