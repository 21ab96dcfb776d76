//! # Configuration Surface Module
//!
//! The proxy's configuration is two compile-time tables handed in by the
//! embedding application: the *system links* (one per peer, naming the
//! transport to load) and the *service tables* (exported servers we host
//! for remote clients, required clients we consume from local servers),
//! plus the binding map that ties a local service name to a peer and a
//! remote-facing name. There is deliberately no runtime command-line or
//! environment surface for any of this; all state converges from IDLE on
//! restart.
//!
//! Timer intervals are collected in [`ProxyTunables`] so embedders can
//! override the seconds-scale defaults.

use std::path::PathBuf;
use std::time::Duration;

/// The transport to instantiate for one peer link.
///
/// Each variant maps to one implementation in the `transport` module; the
/// factory consumes this value. Listen variants accept exactly one peer:
/// a link is point-to-point.
#[derive(Debug, Clone)]
pub enum LinkTransport {
    /// Dial a TCP peer.
    TcpConnect { addr: String },
    /// Accept one TCP peer on the given bind address.
    TcpListen { addr: String },
    /// Dial a Unix-domain socket peer.
    UnixConnect { path: PathBuf },
    /// Accept one Unix-domain peer on the given socket path.
    UnixListen { path: PathBuf },
    /// Placeholder for an in-memory pair installed on the runtime before
    /// it runs (tests and single-process deployments).
    InProcess,
}

/// One configured peer system and the transport that reaches it.
#[derive(Debug, Clone)]
pub struct SystemLink {
    /// Short unique identifier for the peer; keys every per-peer table.
    pub system_name: String,
    /// Transport selection and arguments.
    pub transport: LinkTransport,
}

/// A service endpoint this proxy hosts: local clients connect to it and
/// their requests are forwarded to the peer that runs the real server.
#[derive(Debug, Clone)]
pub struct ExportedServer {
    pub service_name: String,
    /// Opaque protocol identifier; must match the peer's binding exactly.
    pub protocol_id: String,
    /// Upper bound on a single IPC message payload.
    pub max_msg_size: usize,
}

/// A service endpoint this proxy consumes: requests arriving from the peer
/// are replayed into a session opened against the real local server.
#[derive(Debug, Clone)]
pub struct RequiredClient {
    pub service_name: String,
    pub protocol_id: String,
    pub max_msg_size: usize,
}

/// Maps a local service name onto (peer system, remote-facing name).
/// The remote name may differ from the local one.
#[derive(Debug, Clone)]
pub struct ServiceBinding {
    pub service_name: String,
    pub system_name: String,
    pub remote_service_name: String,
}

/// Timer intervals, all seconds-scale. Defaults follow the original
/// daemon's shipped configuration; embedders override per deployment.
#[derive(Debug, Clone)]
pub struct ProxyTunables {
    /// How long a forwarded client request may stay unanswered before the
    /// requesting session is closed.
    pub client_request_timeout: Duration,
    /// Re-issue interval for unanswered CONNECT_SERVICE_REQUESTs.
    pub connect_retry_interval: Duration,
    /// Keep-alive probe cadence per link.
    pub keepalive_interval: Duration,
    /// How long to wait for a KEEPALIVE_RESPONSE before declaring the link
    /// down.
    pub keepalive_timeout: Duration,
    /// Delay before re-dialing a downed link.
    pub reconnect_interval: Duration,
}

impl Default for ProxyTunables {
    fn default() -> Self {
        Self {
            client_request_timeout: Duration::from_secs(15),
            connect_retry_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(15),
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

/// The complete configuration handed to [`crate::proxy::Proxy::new`].
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// The local system's own name, announced in keep-alive probes.
    pub local_system_name: String,
    pub links: Vec<SystemLink>,
    pub servers: Vec<ExportedServer>,
    pub clients: Vec<RequiredClient>,
    pub bindings: Vec<ServiceBinding>,
    pub tunables: ProxyTunables,
}

impl ProxyConfig {
    /// Find the binding entry for a local service name.
    pub fn binding_for(&self, service_name: &str) -> Option<&ServiceBinding> {
        self.bindings
            .iter()
            .find(|b| b.service_name == service_name)
    }

    /// Find the exported-server entry for a local service name.
    pub fn server_for(&self, service_name: &str) -> Option<&ExportedServer> {
        self.servers.iter().find(|s| s.service_name == service_name)
    }

    /// Find the required-client entry for a local service name.
    pub fn client_for(&self, service_name: &str) -> Option<&RequiredClient> {
        self.clients.iter().find(|c| c.service_name == service_name)
    }
}
