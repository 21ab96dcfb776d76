//! # Proxy Engine Module
//!
//! The single `Proxy` value owns every table and every per-peer record;
//! there is no module-level mutable state anywhere in the crate. The
//! engine is *synchronous*: events go in ([`LoopEvent`]), table mutations
//! happen, and I/O intents come out ([`Action`]). The async shell in
//! [`crate::runtime`] performs the intents and feeds back what it
//! observes.
//!
//! This shape keeps the concurrency model exactly what the design
//! demands: one cooperative task owns all state, the only suspension
//! points are transport readiness, fabric readiness, and timers, and no
//! lock exists anywhere. It also makes every protocol scenario testable
//! without a runtime: the integration suites drive two engines by
//! shuttling `SendFrame` actions into `LinkBytes` events.
//!
//! ## Event → Action Flow
//!
//! ```text
//!   transport bytes ─► LinkBytes ─► receiver ─► dispatch ─┬─► SendFrame
//!   fabric activity ─► FabricEvent ─► sender ─────────────┤   StartTimer
//!   timer firings  ──► TimerExpired ─► lifecycle/tracker ─┤   WatchStream
//!   stream i/o ─────► StreamChunk/Writable/Hup ─► streams ┴─► DropLink …
//! ```

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::EventContexts;
use crate::fabric::{FabricEvent, IpcFabric, LocalMessage, SessionHandle};
use crate::filestream::FileStreamTable;
use crate::limits::{
    EVENT_HANDLERS_MAX, FILE_STREAMS_MAX, IN_FLIGHT_MSGS_MAX, SERVICE_BINDINGS_MAX,
};
use crate::network::{LinkState, Network};
use crate::receiver::{IpcDelivery, RecvCtx, RecvOutput};
use crate::sender::{self, SendCtx, SendPurpose};
use crate::service::{ServiceRole, ServiceState, ServiceTable};
use crate::tables::ProxyMsgIdAllocator;
use crate::tracker::{InboundRequest, OutboundRequest, RequestTracker};
use crate::wire::{service_code, CommonHeader, ConnectBody, MessageType};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Direction of a file stream from this proxy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Data flows toward us; we write it into the local descriptor.
    Incoming,
    /// Data flows away from us; we read the local descriptor.
    Outgoing,
}

/// Unique name of one file-stream instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub system: String,
    pub stream_id: u16,
    /// True when this side created the stream.
    pub owner: bool,
}

/// Identity of one armed timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Client-request expiry, by proxy message id.
    ClientRequest(u32),
    /// Connect-service retry, per endpoint.
    ConnectRetry { system: String, service: String },
    /// Keep-alive probe cadence, per link.
    KeepaliveInterval(String),
    /// Keep-alive answer deadline, per link.
    KeepaliveTimeout(String),
    /// Reconnect delay, per link.
    Reconnect(String),
}

/// I/O intents emitted by the engine, performed by the shell.
#[derive(Debug)]
pub enum Action {
    /// Establish (or re-establish) the transport for a peer.
    ConnectLink { system: String },
    /// Write one frame to a peer link.
    SendFrame { system: String, frame: Vec<u8> },
    /// Close a peer link's transport.
    DropLink { system: String },
    /// Arm (or re-arm) a timer.
    StartTimer { id: TimerId, after: Duration },
    /// Cancel a timer if it is still armed.
    CancelTimer { id: TimerId },
    /// Take ownership of a stream's proxy-side descriptor and watch it.
    WatchStream {
        key: StreamKey,
        fd: OwnedFd,
        direction: StreamDirection,
    },
    /// Stop watching and close a stream's descriptor.
    UnwatchStream { key: StreamKey },
    /// Read up to `max` bytes from an outgoing stream's descriptor.
    ArmStreamRead { key: StreamKey, max: usize },
    /// Write bytes into an incoming stream's descriptor.
    WriteStream { key: StreamKey, data: Vec<u8> },
}

/// Everything the shell can observe and feed back.
#[derive(Debug)]
pub enum LoopEvent {
    /// A peer link's transport is established.
    LinkUp { system: String },
    /// A peer link's transport failed or closed.
    LinkDown { system: String },
    /// Bytes arrived on a peer link.
    LinkBytes { system: String, bytes: Vec<u8> },
    /// An armed timer fired.
    TimerExpired(TimerId),
    /// Local fabric activity.
    Fabric(FabricEvent),
    /// Bytes read from an outgoing stream's descriptor (eof on n == 0).
    StreamChunk {
        key: StreamKey,
        data: Vec<u8>,
        eof: bool,
    },
    /// An incoming stream's descriptor can absorb `room` more bytes.
    StreamWritable { key: StreamKey, room: usize },
    /// The far side of a stream descriptor hung up.
    StreamHup { key: StreamKey },
    /// Local stream descriptor I/O failed.
    StreamIoError { key: StreamKey },
}

/// The engine.
pub struct Proxy {
    cfg: ProxyConfig,
    fabric: Box<dyn IpcFabric>,
    networks: HashMap<String, Network>,
    services: ServiceTable,
    tracker: RequestTracker,
    contexts: EventContexts,
    streams: FileStreamTable,
    msg_ids: ProxyMsgIdAllocator,
    actions: Vec<Action>,
}

impl Proxy {
    pub fn new(cfg: ProxyConfig, fabric: Box<dyn IpcFabric>) -> Self {
        let services = ServiceTable::new(&cfg, SERVICE_BINDINGS_MAX);
        let networks = cfg
            .links
            .iter()
            .map(|link| {
                (
                    link.system_name.clone(),
                    Network::new(link.system_name.clone()),
                )
            })
            .collect();
        Self {
            cfg,
            fabric,
            networks,
            services,
            tracker: RequestTracker::new(IN_FLIGHT_MSGS_MAX),
            contexts: EventContexts::new(EVENT_HANDLERS_MAX),
            streams: FileStreamTable::new(FILE_STREAMS_MAX),
            msg_ids: ProxyMsgIdAllocator::default(),
            actions: Vec::new(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.cfg
    }

    /// Kick off every configured link. Called once at startup.
    pub fn start(&mut self) -> Vec<Action> {
        for (system, net) in self.networks.iter_mut() {
            net.state = LinkState::Connecting;
            self.actions.push(Action::ConnectLink {
                system: system.clone(),
            });
        }
        std::mem::take(&mut self.actions)
    }

    /// Drive one event through the engine.
    pub fn handle(&mut self, event: LoopEvent) -> Vec<Action> {
        match event {
            LoopEvent::LinkUp { system } => self.on_link_up(&system),
            LoopEvent::LinkDown { system } => self.on_link_down(&system),
            LoopEvent::LinkBytes { system, bytes } => self.on_link_bytes(&system, &bytes),
            LoopEvent::TimerExpired(id) => self.on_timer(id),
            LoopEvent::Fabric(ev) => self.on_fabric(ev),
            LoopEvent::StreamChunk { key, data, eof } => {
                self.streams
                    .on_chunk(&key, data, eof, &mut self.msg_ids, &mut self.actions);
            }
            LoopEvent::StreamWritable { key, room } => {
                self.streams
                    .on_writable(&key, room, &mut self.msg_ids, &mut self.actions);
            }
            LoopEvent::StreamHup { key } => {
                self.streams
                    .on_hup(&key, &mut self.msg_ids, &mut self.actions);
            }
            LoopEvent::StreamIoError { key } => {
                self.streams
                    .on_io_error(&key, &mut self.msg_ids, &mut self.actions);
            }
        }
        std::mem::take(&mut self.actions)
    }

    /// Drain fabric activity into the engine. The shell calls this after
    /// the fabric signals readiness.
    pub fn poll_fabric(&mut self) -> Vec<Action> {
        let events = self.fabric.poll_events();
        for ev in events {
            self.on_fabric(ev);
        }
        std::mem::take(&mut self.actions)
    }

    /// Locally initiated service disconnect (embedder surface).
    pub fn disconnect_service(&mut self, system: &str, service: &str) -> Vec<Action> {
        self.teardown_service_binding(system, service, true);
        self.rekick_host(system, service);
        std::mem::take(&mut self.actions)
    }

    // ----------------------------------------------------------------- //
    // Link supervision
    // ----------------------------------------------------------------- //

    fn on_link_up(&mut self, system: &str) {
        let Some(net) = self.networks.get_mut(system) else {
            warn!(system, "link-up for unconfigured system");
            return;
        };
        info!(system, "peer link established");
        net.on_established();
        self.actions.push(Action::StartTimer {
            id: TimerId::KeepaliveInterval(system.to_owned()),
            after: self.cfg.tunables.keepalive_interval,
        });
        for name in self.services.host_names_for_system(system) {
            let state = self
                .services
                .endpoint(system, &name)
                .map(|e| e.state)
                .unwrap_or(ServiceState::Idle);
            if state == ServiceState::Idle {
                self.send_connect_request(system, &name);
            }
        }
    }

    fn on_link_down(&mut self, system: &str) {
        let Some(net) = self.networks.get_mut(system) else {
            return;
        };
        if net.state == LinkState::Down {
            return;
        }
        net.state = LinkState::Down;
        net.keepalive_outstanding = false;
        warn!(system, "peer link down; releasing dependents");

        self.actions.push(Action::CancelTimer {
            id: TimerId::KeepaliveInterval(system.to_owned()),
        });
        self.actions.push(Action::CancelTimer {
            id: TimerId::KeepaliveTimeout(system.to_owned()),
        });

        // The peer is gone: streams go silently, then every bound service
        // is torn down with local error completions.
        self.streams.teardown_system(system, &mut self.actions);
        for name in self.services.bound_names_for_system(system) {
            self.teardown_service_binding(system, &name, false);
        }
        // Pending connect attempts stop retrying until the next link-up.
        for name in self.services.host_names_for_system(system) {
            let pending_id = match self.services.endpoint_mut(system, &name) {
                Some(ep) if ep.state == ServiceState::ConnectPending => {
                    ep.state = ServiceState::Idle;
                    ep.service_id
                }
                _ => continue,
            };
            self.actions.push(Action::CancelTimer {
                id: TimerId::ConnectRetry {
                    system: system.to_owned(),
                    service: name.clone(),
                },
            });
            if let Some(id) = pending_id {
                self.services.release_id(id);
            }
        }

        // Sweep anything the per-service teardown did not cover.
        let (outs, ins) = self.tracker.release_system(system);
        for (pid, rec) in outs {
            self.actions.push(Action::CancelTimer {
                id: TimerId::ClientRequest(pid),
            });
            self.complete_with_error(&rec, service_code::UNAVAILABLE);
        }
        for (_, rec) in ins {
            for token in rec.recv_buffers {
                self.fabric.free_buffer(token);
            }
        }
        self.contexts.release_system(system);

        self.actions.push(Action::StartTimer {
            id: TimerId::Reconnect(system.to_owned()),
            after: self.cfg.tunables.reconnect_interval,
        });
    }

    fn on_link_bytes(&mut self, system: &str, bytes: &[u8]) {
        let Proxy {
            networks,
            services,
            tracker,
            contexts,
            fabric,
            ..
        } = self;
        let Some(net) = networks.get_mut(system) else {
            return;
        };
        if net.state != LinkState::Up {
            debug!(system, "bytes on a link that is not up; ignoring");
            return;
        }
        let mut ctx = RecvCtx {
            system,
            fabric: fabric.as_mut(),
            services,
            tracker,
            contexts,
        };
        match net.receiver.feed(bytes, &mut ctx) {
            Ok(outputs) => {
                for output in outputs {
                    self.dispatch_output(system, output);
                }
            }
            Err(e) => {
                error!(system, "protocol error on receive path: {e}; dropping link");
                self.actions.push(Action::DropLink {
                    system: system.to_owned(),
                });
                self.on_link_down(system);
            }
        }
    }

    fn dispatch_output(&mut self, system: &str, output: RecvOutput) {
        match output {
            RecvOutput::Fixed { header, body } => self.on_fixed(system, header, body),
            RecvOutput::Ipc(delivery) => self.on_ipc_delivery(system, delivery),
            RecvOutput::Filestream(msg) => {
                if let Err(e) =
                    self.streams
                        .handle_message(system, msg, &mut self.msg_ids, &mut self.actions)
                {
                    error!(system, "filestream protocol error: {e}; dropping link");
                    self.actions.push(Action::DropLink {
                        system: system.to_owned(),
                    });
                    self.on_link_down(system);
                }
            }
        }
    }

    // ----------------------------------------------------------------- //
    // Fixed-layout messages: connect, disconnect, keep-alive
    // ----------------------------------------------------------------- //

    fn on_fixed(&mut self, system: &str, header: CommonHeader, body: ConnectBody) {
        match header.msg_type {
            MessageType::ConnectServiceRequest => self.on_connect_request(system, header, body),
            MessageType::ConnectServiceResponse => self.on_connect_response(system, header, body),
            MessageType::DisconnectService => self.on_remote_disconnect(system, header),
            MessageType::KeepaliveRequest => {
                if body.system_name != self.cfg.local_system_name {
                    warn!(
                        system,
                        probe_for = %body.system_name,
                        "keep-alive probe for a different system; ignoring"
                    );
                    return;
                }
                let reply = ConnectBody {
                    system_name: system.to_owned(),
                    ..Default::default()
                };
                self.send_fixed(
                    system,
                    CommonHeader {
                        id: header.id,
                        service_id: header.service_id,
                        msg_type: MessageType::KeepaliveResponse,
                    },
                    &reply,
                );
            }
            MessageType::KeepaliveResponse => {
                if let Some(net) = self.networks.get_mut(system) {
                    net.keepalive_outstanding = false;
                }
                self.actions.push(Action::CancelTimer {
                    id: TimerId::KeepaliveTimeout(system.to_owned()),
                });
            }
            _ => unreachable!("receiver only emits fixed outputs for fixed types"),
        }
    }

    fn on_connect_request(&mut self, system: &str, header: CommonHeader, body: ConnectBody) {
        let reply = |code: i32| ConnectBody {
            system_name: system.to_owned(),
            service_name: body.service_name.clone(),
            protocol_id: body.protocol_id.clone(),
            service_code: code,
        };
        let response_header = CommonHeader {
            id: header.id,
            service_id: header.service_id,
            msg_type: MessageType::ConnectServiceResponse,
        };

        let Some((local_name, protocol, state, bound_id)) = self
            .services
            .consumer_for_request(system, &body.service_name)
            .map(|e| {
                (
                    e.local_name.clone(),
                    e.protocol_id.clone(),
                    e.state,
                    e.service_id,
                )
            })
        else {
            info!(
                system,
                service = %body.service_name,
                "connect request for a service we do not require"
            );
            self.send_fixed(system, response_header, &reply(service_code::UNAVAILABLE));
            return;
        };

        if protocol != body.protocol_id {
            warn!(
                system,
                service = %body.service_name,
                offered = %body.protocol_id,
                required = %protocol,
                "protocol mismatch on connect"
            );
            self.send_fixed(system, response_header, &reply(service_code::FORMAT_ERROR));
            return;
        }

        // A re-received request for an already-bound service re-sends the
        // current result instead of rebinding.
        if state == ServiceState::Bound && bound_id == Some(header.service_id) {
            self.send_fixed(system, response_header, &reply(service_code::OK));
            return;
        }

        // A request under a *different* id means the peer restarted and is
        // re-announcing. The stale binding (old id mapping, old session,
        // its pendings and streams) must go before the new one is adopted.
        if bound_id.is_some() {
            info!(
                system,
                service = %local_name,
                "peer re-announced a bound service; releasing the old binding"
            );
            self.teardown_service_binding(system, &local_name, false);
        }

        let session = match self.fabric.open_session(&local_name, &protocol) {
            Ok(session) => session,
            Err(e) => {
                let code = match e {
                    ProxyError::ProtocolMismatch { .. } => service_code::FORMAT_ERROR,
                    _ => service_code::UNAVAILABLE,
                };
                info!(system, service = %local_name, "local session open failed: {e}");
                self.send_fixed(system, response_header, &reply(code));
                return;
            }
        };

        if let Err(e) = self.services.adopt_id(system, &local_name, header.service_id) {
            warn!(system, service = %local_name, "cannot adopt service id: {e}");
            self.fabric.close_session(session);
            self.send_fixed(system, response_header, &reply(service_code::FORMAT_ERROR));
            return;
        }
        if let Some(ep) = self.services.endpoint_mut(system, &local_name) {
            ep.state = ServiceState::Bound;
            ep.session = Some(session);
        }
        info!(
            system,
            service = %local_name,
            service_id = header.service_id,
            "service bound as consumer"
        );
        self.send_fixed(system, response_header, &reply(service_code::OK));
    }

    fn on_connect_response(&mut self, system: &str, header: CommonHeader, body: ConnectBody) {
        let Some((local_name, state)) = self
            .services
            .endpoint_by_id(header.service_id)
            .filter(|e| e.system == system && e.role == ServiceRole::Host)
            .map(|e| (e.local_name.clone(), e.state))
        else {
            warn!(
                system,
                service_id = header.service_id,
                "connect response for unknown binding"
            );
            return;
        };
        if state != ServiceState::ConnectPending {
            debug!(system, service = %local_name, "duplicate connect response");
            return;
        }

        if body.service_code != service_code::OK {
            // Protocol mismatch or peer-side failure. Stay in
            // CONNECT_PENDING; the retry timer re-issues the request until
            // a matching peer appears.
            warn!(
                system,
                service = %local_name,
                code = body.service_code,
                "peer rejected connect; will retry"
            );
            return;
        }

        self.actions.push(Action::CancelTimer {
            id: TimerId::ConnectRetry {
                system: system.to_owned(),
                service: local_name.clone(),
            },
        });

        let (protocol, max_size) = {
            let ep = self
                .services
                .endpoint(system, &local_name)
                .expect("endpoint existed a moment ago");
            (ep.protocol_id.clone(), ep.max_msg_size)
        };
        match self.fabric.advertise(&local_name, &protocol, max_size) {
            Ok(handle) => {
                if let Some(ep) = self.services.endpoint_mut(system, &local_name) {
                    ep.state = ServiceState::Bound;
                    ep.fabric_service = Some(handle);
                }
                info!(
                    system,
                    service = %local_name,
                    service_id = header.service_id,
                    "service bound and advertised locally"
                );
            }
            Err(e) => {
                error!(system, service = %local_name, "advertise failed: {e}");
                self.teardown_service_binding(system, &local_name, true);
                self.rekick_host(system, &local_name);
            }
        }
    }

    fn on_remote_disconnect(&mut self, system: &str, header: CommonHeader) {
        let Some(local_name) = self
            .services
            .endpoint_by_id(header.service_id)
            .filter(|e| e.system == system)
            .map(|e| e.local_name.clone())
        else {
            debug!(
                system,
                service_id = header.service_id,
                "disconnect for unknown binding"
            );
            return;
        };
        info!(system, service = %local_name, "peer disconnected service");
        self.teardown_service_binding(system, &local_name, false);
        // Transient peer restarts heal automatically.
        self.rekick_host(system, &local_name);
    }

    // ----------------------------------------------------------------- //
    // Service lifecycle helpers
    // ----------------------------------------------------------------- //

    fn send_connect_request(&mut self, system: &str, local_name: &str) {
        let service_id = {
            let ep = self.services.endpoint(system, local_name);
            match ep.and_then(|e| e.service_id) {
                Some(id) => id,
                None => match self.services.mint_id(system, local_name) {
                    Ok(id) => id,
                    Err(e) => {
                        error!(system, service = %local_name, "cannot mint service id: {e}");
                        return;
                    }
                },
            }
        };
        let (remote_name, protocol) = {
            let ep = self
                .services
                .endpoint(system, local_name)
                .expect("mint_id resolved this endpoint");
            (ep.remote_name.clone(), ep.protocol_id.clone())
        };
        if let Some(ep) = self.services.endpoint_mut(system, local_name) {
            ep.state = ServiceState::ConnectPending;
        }
        let header = CommonHeader {
            id: self.msg_ids.next(|_| false),
            service_id,
            msg_type: MessageType::ConnectServiceRequest,
        };
        let body = ConnectBody {
            system_name: system.to_owned(),
            service_name: remote_name,
            protocol_id: protocol,
            service_code: 0,
        };
        debug!(system, service = %local_name, service_id, "sending connect request");
        self.send_fixed(system, header, &body);
        self.actions.push(Action::StartTimer {
            id: TimerId::ConnectRetry {
                system: system.to_owned(),
                service: local_name.to_owned(),
            },
            after: self.cfg.tunables.connect_retry_interval,
        });
    }

    /// Hosted services re-enter CONNECT_PENDING after a disconnect while
    /// the link is up.
    fn rekick_host(&mut self, system: &str, local_name: &str) {
        let link_up = self
            .networks
            .get(system)
            .map(|n| n.state == LinkState::Up)
            .unwrap_or(false);
        let is_idle_host = self
            .services
            .endpoint(system, local_name)
            .map(|e| e.role == ServiceRole::Host && e.state == ServiceState::Idle)
            .unwrap_or(false);
        if link_up && is_idle_host {
            self.send_connect_request(system, local_name);
        }
    }

    /// Release everything scoped to one service binding. Ordering matters:
    /// the advertisement is withdrawn before any pending request is
    /// completed with an error.
    fn teardown_service_binding(&mut self, system: &str, local_name: &str, notify_peer: bool) {
        let Some((role, service_id, session, fabric_service)) = self
            .services
            .endpoint(system, local_name)
            .map(|e| (e.role, e.service_id, e.session, e.fabric_service))
        else {
            return;
        };
        let Some(service_id) = service_id else {
            return; // Nothing bound.
        };

        if let Some(ep) = self.services.endpoint_mut(system, local_name) {
            ep.state = ServiceState::Disconnecting;
        }

        let link_up = self
            .networks
            .get(system)
            .map(|n| n.state == LinkState::Up)
            .unwrap_or(false);
        if notify_peer && link_up {
            let (remote_name, protocol) = self
                .services
                .endpoint(system, local_name)
                .map(|e| (e.remote_name.clone(), e.protocol_id.clone()))
                .unwrap_or_default();
            let header = CommonHeader {
                id: self.msg_ids.next(|_| false),
                service_id,
                msg_type: MessageType::DisconnectService,
            };
            let body = ConnectBody {
                system_name: system.to_owned(),
                service_name: remote_name,
                protocol_id: protocol,
                service_code: 0,
            };
            self.send_fixed(system, header, &body);
        }

        // 1. Withdraw the advertisement.
        if let Some(handle) = fabric_service {
            self.fabric.withdraw(handle);
        }

        // 2. Complete every pending request with a disconnect error.
        let (outs, ins) = self.tracker.release_service(system, service_id);
        for (pid, rec) in outs {
            self.actions.push(Action::CancelTimer {
                id: TimerId::ClientRequest(pid),
            });
            self.complete_with_error(&rec, service_code::UNAVAILABLE);
        }
        for (_, rec) in ins {
            for token in rec.recv_buffers {
                self.fabric.free_buffer(token);
            }
        }

        // 3. Release event contexts and file streams owned by the service.
        self.contexts.release_service(system, service_id);
        if link_up {
            self.streams
                .teardown_service(system, service_id, &mut self.msg_ids, &mut self.actions);
        }

        // 4. Close the consumer session and release the wire token.
        if role == ServiceRole::Consumer {
            if let Some(session) = session {
                self.fabric.close_session(session);
            }
        }
        self.services.release_id(service_id);
        if let Some(ep) = self.services.endpoint_mut(system, local_name) {
            ep.state = ServiceState::Idle;
            ep.session = None;
            ep.fabric_service = None;
        }
        info!(system, service = %local_name, service_id, "service binding released");
    }

    // ----------------------------------------------------------------- //
    // Timers
    // ----------------------------------------------------------------- //

    fn on_timer(&mut self, id: TimerId) {
        match id {
            TimerId::ClientRequest(pid) => {
                let Some(rec) = self.tracker.take_outbound(pid) else {
                    return; // Answered just before the timer fired.
                };
                warn!(
                    id = pid,
                    system = %rec.system,
                    "client request timed out; closing the requesting session"
                );
                self.contexts.release_session(rec.session);
                let (more, _) = self.tracker.release_session(rec.session);
                for (other_pid, _) in more {
                    self.actions.push(Action::CancelTimer {
                        id: TimerId::ClientRequest(other_pid),
                    });
                }
                self.fabric.close_session(rec.session);
            }
            TimerId::ConnectRetry { system, service } => {
                let pending = self
                    .services
                    .endpoint(&system, &service)
                    .map(|e| e.state == ServiceState::ConnectPending)
                    .unwrap_or(false);
                let link_up = self
                    .networks
                    .get(&system)
                    .map(|n| n.state == LinkState::Up)
                    .unwrap_or(false);
                if pending && link_up {
                    self.send_connect_request(&system, &service);
                }
            }
            TimerId::KeepaliveInterval(system) => {
                let Some(net) = self.networks.get_mut(&system) else {
                    return;
                };
                if net.state != LinkState::Up {
                    return;
                }
                net.keepalive_outstanding = true;
                let header = CommonHeader {
                    id: self.msg_ids.next(|_| false),
                    service_id: 0,
                    msg_type: MessageType::KeepaliveRequest,
                };
                let body = ConnectBody {
                    system_name: system.clone(),
                    ..Default::default()
                };
                self.send_fixed(&system, header, &body);
                self.actions.push(Action::StartTimer {
                    id: TimerId::KeepaliveTimeout(system.clone()),
                    after: self.cfg.tunables.keepalive_timeout,
                });
                self.actions.push(Action::StartTimer {
                    id: TimerId::KeepaliveInterval(system),
                    after: self.cfg.tunables.keepalive_interval,
                });
            }
            TimerId::KeepaliveTimeout(system) => {
                let outstanding = self
                    .networks
                    .get(&system)
                    .map(|n| n.keepalive_outstanding)
                    .unwrap_or(false);
                if outstanding {
                    warn!(%system, "keep-alive timed out");
                    self.actions.push(Action::DropLink {
                        system: system.clone(),
                    });
                    self.on_link_down(&system);
                }
            }
            TimerId::Reconnect(system) => {
                if let Some(net) = self.networks.get_mut(&system) {
                    if net.state == LinkState::Down {
                        net.state = LinkState::Connecting;
                        self.actions.push(Action::ConnectLink { system });
                    }
                }
            }
        }
    }

    // ----------------------------------------------------------------- //
    // IPC-bearing deliveries
    // ----------------------------------------------------------------- //

    fn on_ipc_delivery(&mut self, system: &str, delivery: IpcDelivery) {
        if let Some(code) = delivery.error_code {
            // A bounded table filled mid-parse: answer, never drop.
            let local_id = delivery
                .payload
                .get(..4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0);
            for token in delivery.recv_buffers {
                self.fabric.free_buffer(token);
            }
            if delivery.header.msg_type == MessageType::ClientRequest {
                let header = CommonHeader {
                    id: delivery.header.id,
                    service_id: delivery.header.service_id,
                    msg_type: MessageType::ServerResponse,
                };
                let mut frame = header.to_wire().to_vec();
                frame.extend_from_slice(&sender::error_response_body(local_id, code));
                self.actions.push(Action::SendFrame {
                    system: system.to_owned(),
                    frame,
                });
            }
            return;
        }
        if delivery.discard {
            for token in delivery.recv_buffers {
                self.fabric.free_buffer(token);
            }
            return;
        }

        match delivery.header.msg_type {
            MessageType::ClientRequest => self.deliver_client_request(system, delivery),
            MessageType::ServerResponse => self.deliver_server_response(system, delivery),
            MessageType::ServerAsyncEvent => self.deliver_async_event(system, delivery),
            _ => unreachable!("receiver only emits ipc outputs for ipc types"),
        }
    }

    /// Consumer side: replay a peer's client request into the real server.
    fn deliver_client_request(&mut self, system: &str, delivery: IpcDelivery) {
        let header = delivery.header;
        let local_id = u32::from_be_bytes([
            delivery.payload[0],
            delivery.payload[1],
            delivery.payload[2],
            delivery.payload[3],
        ]);
        let answer_error = |this: &mut Self, code: i32| {
            let response = CommonHeader {
                id: header.id,
                service_id: header.service_id,
                msg_type: MessageType::ServerResponse,
            };
            let mut frame = response.to_wire().to_vec();
            frame.extend_from_slice(&sender::error_response_body(local_id, code));
            this.actions.push(Action::SendFrame {
                system: system.to_owned(),
                frame,
            });
            for token in &delivery.recv_buffers {
                this.fabric.free_buffer(*token);
            }
        };

        let Some(session) = self
            .services
            .endpoint_by_id(header.service_id)
            .filter(|e| e.system == system && e.role == ServiceRole::Consumer)
            .and_then(|e| e.session)
        else {
            warn!(
                system,
                service_id = header.service_id,
                "request for a service without a bound session"
            );
            return answer_error(self, service_code::UNAVAILABLE);
        };

        if !self.tracker.has_capacity() {
            warn!(system, "pending-request table full; answering no-memory");
            return answer_error(self, service_code::NO_MEMORY);
        }

        // Materialize the stream dual before delivery so the server sees
        // an ordinary descriptor in the message.
        let mut fd = None;
        if let Some(stream_id) = delivery.meta_stream_id {
            match self.streams.create_dual(
                system,
                header.service_id,
                stream_id,
                delivery.meta_flags,
                &mut self.actions,
            ) {
                Ok(local_fd) => fd = Some(local_fd),
                Err(ProxyError::ResourceExhausted(table)) => {
                    warn!(system, table, "stream table full; answering no-memory");
                    return answer_error(self, service_code::NO_MEMORY);
                }
                Err(e) => {
                    error!(system, "stream initialization failed: {e}; dropping link");
                    self.actions.push(Action::DropLink {
                        system: system.to_owned(),
                    });
                    self.on_link_down(system);
                    return;
                }
            }
        }

        let message = LocalMessage {
            payload: delivery.payload,
            fd,
        };
        match self.fabric.deliver_request(session, message, true) {
            Ok(local_msg) => {
                self.tracker
                    .insert_inbound(
                        header.id,
                        InboundRequest {
                            system: system.to_owned(),
                            service_id: header.service_id,
                            session,
                            local_msg,
                            recv_buffers: delivery.recv_buffers.into(),
                            server_ctx: delivery.server_ctx,
                        },
                    )
                    .expect("capacity checked above");
            }
            Err(e) => {
                warn!(system, "delivery into local server failed: {e}");
                for token in &delivery.recv_buffers {
                    self.fabric.free_buffer(*token);
                }
                let response = CommonHeader {
                    id: header.id,
                    service_id: header.service_id,
                    msg_type: MessageType::ServerResponse,
                };
                let mut frame = response.to_wire().to_vec();
                frame.extend_from_slice(&sender::error_response_body(
                    local_id,
                    service_code::UNAVAILABLE,
                ));
                self.actions.push(Action::SendFrame {
                    system: system.to_owned(),
                    frame,
                });
            }
        }
    }

    /// Host side: complete the waiting local client.
    fn deliver_server_response(&mut self, system: &str, delivery: IpcDelivery) {
        let header = delivery.header;
        let Some(rec) = self.tracker.take_outbound(header.id) else {
            // The receiver marks untracked responses as discard; reaching
            // here means it raced a release between parse and dispatch.
            debug!(id = header.id, "response lost its request; dropping");
            return;
        };
        self.actions.push(Action::CancelTimer {
            id: TimerId::ClientRequest(header.id),
        });

        let mut fd = None;
        if let Some(stream_id) = delivery.meta_stream_id {
            match self.streams.create_dual(
                system,
                header.service_id,
                stream_id,
                delivery.meta_flags,
                &mut self.actions,
            ) {
                Ok(local_fd) => fd = Some(local_fd),
                Err(e) => {
                    warn!(system, "response stream initialization failed: {e}");
                }
            }
        }

        debug!(id = header.id, "completing client request");
        self.fabric.complete_request(
            rec.local_msg,
            LocalMessage {
                payload: delivery.payload,
                fd,
            },
        );
    }

    /// Host side: route an async event to the registered client session.
    fn deliver_async_event(&mut self, _system: &str, delivery: IpcDelivery) {
        let Some(session) = delivery.session else {
            warn!("async event without a routable context; dropping");
            return;
        };
        self.fabric.send_event(
            session,
            LocalMessage {
                payload: delivery.payload,
                fd: None,
            },
        );
    }

    // ----------------------------------------------------------------- //
    // Fabric events
    // ----------------------------------------------------------------- //

    fn on_fabric(&mut self, event: FabricEvent) {
        match event {
            FabricEvent::ClientRequest {
                service,
                session,
                token,
                message,
                needs_response,
            } => self.forward_client_request(service, session, token, message, needs_response),
            FabricEvent::SessionClosed { service: _, session } => {
                debug!(session = session.0, "local client session closed");
                let (outs, _) = self.tracker.release_session(session);
                for (pid, _) in outs {
                    self.actions.push(Action::CancelTimer {
                        id: TimerId::ClientRequest(pid),
                    });
                }
                self.contexts.release_session(session);
            }
            FabricEvent::Completion { token, message } => self.forward_completion(token, message),
            FabricEvent::AsyncEvent { session, message } => {
                self.forward_async_event(session, message)
            }
        }
    }

    /// Host side: repack and forward a local client's request.
    fn forward_client_request(
        &mut self,
        service: crate::fabric::ServiceHandle,
        session: SessionHandle,
        token: crate::fabric::LocalMsgToken,
        message: LocalMessage,
        needs_response: bool,
    ) {
        let Some((system, service_id, state)) = self
            .services
            .endpoints()
            .find(|e| e.fabric_service == Some(service))
            .map(|e| (e.system.clone(), e.service_id, e.state))
        else {
            warn!("request on an unknown advertised service; dropping");
            return;
        };
        let link_up = self
            .networks
            .get(&system)
            .map(|n| n.state == LinkState::Up)
            .unwrap_or(false);
        let (Some(service_id), ServiceState::Bound, true) = (service_id, state, link_up) else {
            // Unbound or link down: drop at the sender and let the local
            // message run into its own timeout.
            info!(%system, "client request while service unbound; dropped");
            return;
        };

        // Embedded descriptor becomes a stream before the payload is
        // repacked, so the metadata can ride the same message.
        let mut metadata = None;
        let LocalMessage { payload, fd } = message;
        if let Some(fd) = fd {
            match self
                .streams
                .prepare_outgoing(&system, service_id, fd, &mut self.actions)
            {
                Ok((stream_id, flags)) => metadata = Some((stream_id, flags)),
                Err(e) => {
                    warn!(%system, "cannot stream embedded descriptor: {e}");
                    let local_id = payload
                        .get(..4)
                        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                        .unwrap_or(0);
                    self.fabric.complete_request(
                        token,
                        LocalMessage::new(sender::local_error_payload(
                            local_id,
                            service_code::UNAVAILABLE,
                        )),
                    );
                    return;
                }
            }
        }

        let pid = {
            let tracker = &self.tracker;
            self.msg_ids.next(|id| tracker.is_tracked(id))
        };
        let mut ctx = SendCtx::new(
            SendPurpose::ClientRequest,
            &system,
            service_id,
            self.fabric.as_mut(),
            &mut self.contexts,
        );
        ctx.session = Some(session);
        ctx.metadata = metadata;
        let encoded = sender::encode_ipc_body(&payload, &mut ctx);
        let out_params = std::mem::take(&mut ctx.out_params);
        let minted_context = ctx.minted_context;
        let local_ipc_id = ctx.ipc_msg_id;
        drop(ctx);

        let body = match encoded {
            Ok(body) => body,
            Err(e) => {
                warn!(%system, "cannot repack client request: {e}");
                if let Some(minted) = minted_context {
                    self.contexts.release_client(minted);
                }
                self.fabric.complete_request(
                    token,
                    LocalMessage::new(sender::local_error_payload(
                        local_ipc_id,
                        service_code::FORMAT_ERROR,
                    )),
                );
                return;
            }
        };

        if needs_response {
            let rec = OutboundRequest {
                system: system.clone(),
                service_id,
                session,
                local_msg: token,
                local_ipc_id,
                out_params: out_params.into(),
                context: minted_context,
            };
            if let Err(e) = self.tracker.insert_outbound(pid, rec) {
                warn!(%system, "{e}; answering no-memory locally");
                if let Some(minted) = minted_context {
                    self.contexts.release_client(minted);
                }
                self.fabric.complete_request(
                    token,
                    LocalMessage::new(sender::local_error_payload(
                        local_ipc_id,
                        service_code::NO_MEMORY,
                    )),
                );
                return;
            }
            self.actions.push(Action::StartTimer {
                id: TimerId::ClientRequest(pid),
                after: self.cfg.tunables.client_request_timeout,
            });
        }

        let header = CommonHeader {
            id: pid,
            service_id,
            msg_type: MessageType::ClientRequest,
        };
        let mut frame = header.to_wire().to_vec();
        frame.extend_from_slice(&body);
        debug!(%system, id = pid, service_id, "forwarding client request");
        self.actions.push(Action::SendFrame { system, frame });
    }

    /// Consumer side: repack and forward the real server's completion.
    fn forward_completion(&mut self, token: crate::fabric::LocalMsgToken, message: LocalMessage) {
        let Some((pid, mut rec)) = self.tracker.take_inbound_by_local(token) else {
            debug!("completion for a released request; dropping");
            return;
        };
        let all_buffers: Vec<_> = rec.recv_buffers.iter().copied().collect();

        let mut metadata = None;
        let LocalMessage { payload, fd } = message;
        if let Some(fd) = fd {
            match self
                .streams
                .prepare_outgoing(&rec.system, rec.service_id, fd, &mut self.actions)
            {
                Ok((stream_id, flags)) => metadata = Some((stream_id, flags)),
                Err(e) => warn!(system = %rec.system, "cannot stream response descriptor: {e}"),
            }
        }

        let mut ctx = SendCtx::new(
            SendPurpose::ServerResponse,
            &rec.system,
            rec.service_id,
            self.fabric.as_mut(),
            &mut self.contexts,
        );
        ctx.response_buffers = Some(&mut rec.recv_buffers);
        ctx.server_ctx = rec.server_ctx;
        ctx.metadata = metadata;

        let header = CommonHeader {
            id: pid,
            service_id: rec.service_id,
            msg_type: MessageType::ServerResponse,
        };
        let encoded = sender::encode_ipc_body(&payload, &mut ctx);
        let local_ipc_id = ctx.ipc_msg_id;
        drop(ctx);

        let mut frame = header.to_wire().to_vec();
        match encoded {
            Ok(body) => frame.extend_from_slice(&body),
            Err(e) => {
                warn!(system = %rec.system, "cannot repack server response: {e}");
                frame.extend_from_slice(&sender::error_response_body(
                    local_ipc_id,
                    service_code::FORMAT_ERROR,
                ));
            }
        }
        for buffer in all_buffers {
            self.fabric.free_buffer(buffer);
        }
        debug!(system = %rec.system, id = pid, "forwarding server response");
        self.actions.push(Action::SendFrame {
            system: rec.system.clone(),
            frame,
        });
    }

    /// Consumer side: forward the real server's async event.
    fn forward_async_event(&mut self, session: SessionHandle, message: LocalMessage) {
        let Some((system, service_id)) = self
            .services
            .endpoints()
            .find(|e| e.session == Some(session) && e.role == ServiceRole::Consumer)
            .and_then(|e| e.service_id.map(|id| (e.system.clone(), id)))
        else {
            debug!("async event on an unbound session; dropping");
            return;
        };
        let mut ctx = SendCtx::new(
            SendPurpose::AsyncEvent,
            &system,
            service_id,
            self.fabric.as_mut(),
            &mut self.contexts,
        );
        let body = match sender::encode_ipc_body(&message.payload, &mut ctx) {
            Ok(body) => body,
            Err(e) => {
                warn!(%system, "cannot repack async event: {e}; dropping");
                return;
            }
        };
        let header = CommonHeader {
            id: self.msg_ids.next(|_| false),
            service_id,
            msg_type: MessageType::ServerAsyncEvent,
        };
        let mut frame = header.to_wire().to_vec();
        frame.extend_from_slice(&body);
        self.actions.push(Action::SendFrame { system, frame });
    }

    // ----------------------------------------------------------------- //
    // Small helpers
    // ----------------------------------------------------------------- //

    fn send_fixed(&mut self, system: &str, header: CommonHeader, body: &ConnectBody) {
        self.actions.push(Action::SendFrame {
            system: system.to_owned(),
            frame: sender::fixed_frame(&header, body),
        });
    }

    fn complete_with_error(&mut self, rec: &OutboundRequest, code: i32) {
        self.fabric.complete_request(
            rec.local_msg,
            LocalMessage::new(sender::local_error_payload(rec.local_ipc_id, code)),
        );
    }
}
