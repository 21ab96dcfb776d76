//! Shared harness for the integration suites.
//!
//! Two proxy engines are joined by shuttling `SendFrame` actions from one
//! into `LinkBytes` events of the other, so the protocol runs end to end
//! with no runtime, no sockets, and no clocks. Timers never fire on their
//! own; a test fires them explicitly, which makes timeout scenarios
//! deterministic.

#![allow(dead_code)]

use rpc_proxy::config::{
    ExportedServer, LinkTransport, ProxyConfig, RequiredClient, ServiceBinding, SystemLink,
};
use rpc_proxy::fabric::loopback::{LoopbackFabric, LoopbackHandle};
use rpc_proxy::proxy::{Action, LoopEvent, Proxy, StreamDirection, StreamKey, TimerId};
use rpc_proxy::wire::cbor::{self, Item, ItemKind};
use rpc_proxy::wire::MessageType;
use std::collections::{HashSet, VecDeque};
use std::os::fd::OwnedFd;

/// One engine plus everything the harness observed about it.
pub struct Node {
    pub name: &'static str,
    pub peer: &'static str,
    pub engine: Proxy,
    pub handle: LoopbackHandle,
    /// Currently armed timers.
    pub timers: HashSet<TimerId>,
    /// Streams the engine asked the shell to watch (fds kept alive).
    pub watched: Vec<(StreamKey, StreamDirection)>,
    pub fds: Vec<OwnedFd>,
    pub unwatched: Vec<StreamKey>,
    pub stream_reads: Vec<(StreamKey, usize)>,
    pub stream_writes: Vec<(StreamKey, Vec<u8>)>,
    pub dropped_link: bool,
}

impl Node {
    pub fn new(name: &'static str, peer: &'static str, cfg: ProxyConfig) -> Self {
        let (fabric, handle) = LoopbackFabric::new();
        Self {
            name,
            peer,
            engine: Proxy::new(cfg, Box::new(fabric)),
            handle,
            timers: HashSet::new(),
            watched: Vec::new(),
            fds: Vec::new(),
            unwatched: Vec::new(),
            stream_reads: Vec::new(),
            stream_writes: Vec::new(),
            dropped_link: false,
        }
    }

    /// Record the engine's actions, returning the frames it wants sent.
    fn absorb(&mut self, actions: Vec<Action>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for action in actions {
            match action {
                Action::SendFrame { frame, .. } => frames.push(frame),
                Action::ConnectLink { .. } => {} // links are managed by the test
                Action::DropLink { .. } => self.dropped_link = true,
                Action::StartTimer { id, .. } => {
                    self.timers.insert(id);
                }
                Action::CancelTimer { id } => {
                    self.timers.remove(&id);
                }
                Action::WatchStream { key, fd, direction } => {
                    self.watched.push((key, direction));
                    self.fds.push(fd);
                }
                Action::UnwatchStream { key } => {
                    self.watched.retain(|(k, _)| *k != key);
                    self.unwatched.push(key);
                }
                Action::ArmStreamRead { key, max } => self.stream_reads.push((key, max)),
                Action::WriteStream { key, data } => self.stream_writes.push((key, data)),
            }
        }
        frames
    }

    /// The armed client-request expiry timer, if any.
    pub fn client_request_timer(&self) -> Option<TimerId> {
        self.timers
            .iter()
            .find(|t| matches!(t, TimerId::ClientRequest(_)))
            .cloned()
    }

    pub fn has_timer(&self, pred: impl Fn(&TimerId) -> bool) -> bool {
        self.timers.iter().any(pred)
    }
}

/// Two linked nodes and the frame queues between them.
pub struct Pair {
    pub a: Node,
    pub b: Node,
    frames_ab: VecDeque<Vec<u8>>,
    frames_ba: VecDeque<Vec<u8>>,
    /// When set, queued frames are silently dropped (a dead wire).
    pub cut: bool,
    /// (sender name, message type) per frame that entered the wire.
    pub frame_log: Vec<(&'static str, MessageType)>,
}

impl Pair {
    pub fn new(a: Node, b: Node) -> Self {
        Self {
            a,
            b,
            frames_ab: VecDeque::new(),
            frames_ba: VecDeque::new(),
            cut: false,
            frame_log: Vec::new(),
        }
    }

    /// Bring both links up and settle the initial connect handshake.
    pub fn bring_up(&mut self) {
        let peer = self.a.peer.to_string();
        let actions = self.a.engine.handle(LoopEvent::LinkUp { system: peer });
        let frames = self.a.absorb(actions);
        self.queue_from_a(frames);

        let peer = self.b.peer.to_string();
        let actions = self.b.engine.handle(LoopEvent::LinkUp { system: peer });
        let frames = self.b.absorb(actions);
        self.queue_from_b(frames);

        self.pump();
    }

    fn queue_from_a(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames {
            if let Ok(t) = MessageType::from_wire(frame[8]) {
                self.frame_log.push((self.a.name, t));
            }
            self.frames_ab.push_back(frame);
        }
    }

    fn queue_from_b(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames {
            if let Ok(t) = MessageType::from_wire(frame[8]) {
                self.frame_log.push((self.b.name, t));
            }
            self.frames_ba.push_back(frame);
        }
    }

    /// Run fabric drains and frame deliveries until nothing moves.
    pub fn pump(&mut self) {
        loop {
            let mut progress = false;

            let actions = self.a.engine.poll_fabric();
            if !actions.is_empty() {
                progress = true;
            }
            let frames = self.a.absorb(actions);
            self.queue_from_a(frames);

            let actions = self.b.engine.poll_fabric();
            if !actions.is_empty() {
                progress = true;
            }
            let frames = self.b.absorb(actions);
            self.queue_from_b(frames);

            while let Some(frame) = self.frames_ab.pop_front() {
                progress = true;
                if self.cut {
                    continue;
                }
                let system = self.b.peer.to_string();
                let actions = self.b.engine.handle(LoopEvent::LinkBytes {
                    system,
                    bytes: frame,
                });
                let frames = self.b.absorb(actions);
                self.queue_from_b(frames);
            }
            while let Some(frame) = self.frames_ba.pop_front() {
                progress = true;
                if self.cut {
                    continue;
                }
                let system = self.a.peer.to_string();
                let actions = self.a.engine.handle(LoopEvent::LinkBytes {
                    system,
                    bytes: frame,
                });
                let frames = self.a.absorb(actions);
                self.queue_from_a(frames);
            }

            if !progress {
                break;
            }
        }
    }

    /// Fire one of A's timers by hand.
    pub fn fire_a(&mut self, id: TimerId) {
        self.a.timers.remove(&id);
        let actions = self.a.engine.handle(LoopEvent::TimerExpired(id));
        let frames = self.a.absorb(actions);
        self.queue_from_a(frames);
        self.pump();
    }

    /// Fire one of B's timers by hand.
    pub fn fire_b(&mut self, id: TimerId) {
        self.b.timers.remove(&id);
        let actions = self.b.engine.handle(LoopEvent::TimerExpired(id));
        let frames = self.b.absorb(actions);
        self.queue_from_b(frames);
        self.pump();
    }

    /// Drive one of A's loop events (stream I/O simulation).
    pub fn event_a(&mut self, event: LoopEvent) {
        let actions = self.a.engine.handle(event);
        let frames = self.a.absorb(actions);
        self.queue_from_a(frames);
        self.pump();
    }

    pub fn event_b(&mut self, event: LoopEvent) {
        let actions = self.b.engine.handle(event);
        let frames = self.b.absorb(actions);
        self.queue_from_b(frames);
        self.pump();
    }

    /// Locally initiated disconnect on A's side, routed like any other
    /// engine output.
    pub fn disconnect_a(&mut self, system: &str, service: &str) {
        let actions = self.a.engine.disconnect_service(system, service);
        let frames = self.a.absorb(actions);
        self.queue_from_a(frames);
        self.pump();
    }

    /// How many frames of one type a side has sent so far.
    pub fn sent_count(&self, from: &str, msg_type: MessageType) -> usize {
        self.frame_log
            .iter()
            .filter(|(name, t)| *name == from && *t == msg_type)
            .count()
    }
}

/// Standard two-node setup: `A` hosts `svc.foo` toward `B`, which consumes
/// it from a registered local server speaking `server_protocol`.
pub fn standard_pair(server_protocol: &str) -> Pair {
    let a_cfg = ProxyConfig {
        local_system_name: "A".into(),
        links: vec![SystemLink {
            system_name: "B".into(),
            transport: LinkTransport::InProcess,
        }],
        servers: vec![ExportedServer {
            service_name: "svc.foo".into(),
            protocol_id: "P1".into(),
            max_msg_size: 4096,
        }],
        bindings: vec![ServiceBinding {
            service_name: "svc.foo".into(),
            system_name: "B".into(),
            remote_service_name: "svc.foo".into(),
        }],
        ..Default::default()
    };
    let b_cfg = ProxyConfig {
        local_system_name: "B".into(),
        links: vec![SystemLink {
            system_name: "A".into(),
            transport: LinkTransport::InProcess,
        }],
        clients: vec![RequiredClient {
            service_name: "svc.foo".into(),
            protocol_id: "P1".into(),
            max_msg_size: 4096,
        }],
        bindings: vec![ServiceBinding {
            service_name: "svc.foo".into(),
            system_name: "A".into(),
            remote_service_name: "svc.foo".into(),
        }],
        ..Default::default()
    };
    let a = Node::new("A", "B", a_cfg);
    let b = Node::new("B", "A", b_cfg);
    b.handle.register_server("svc.foo", server_protocol);
    Pair::new(a, b)
}

/// Build a local request payload: `[id][items…][break]`.
pub fn request_payload(id: u32, items: &[u8]) -> Vec<u8> {
    let mut payload = id.to_be_bytes().to_vec();
    payload.extend_from_slice(items);
    payload.push(cbor::BREAK);
    payload
}

/// A decoded payload item, for assertions.
pub struct ParsedItem {
    pub tag: Option<u64>,
    pub item: Item,
    pub data: Vec<u8>,
}

/// Walk a local payload's items (skipping the 4-byte id), pairing each
/// with the tag that preceded it.
pub fn parse_items(payload: &[u8]) -> Vec<ParsedItem> {
    let mut items = Vec::new();
    let mut pos = 4;
    let mut pending_tag: Option<u64> = None;
    while pos < payload.len() {
        let extra = cbor::extra_bytes(payload[pos]).expect("valid payload");
        let item = cbor::decode_item(&payload[pos..pos + 1 + extra]).expect("valid payload");
        pos += 1 + extra;
        if item.kind == ItemKind::Tag {
            pending_tag = Some(item.value);
            continue;
        }
        let len = item.payload_len();
        // Header-only local strings carry no payload bytes; the walker
        // treats a shortfall as header-only.
        let data = if len > 0 && pos + len <= payload.len() {
            let data = payload[pos..pos + len].to_vec();
            pos += len;
            data
        } else {
            Vec::new()
        };
        items.push(ParsedItem {
            tag: pending_tag.take(),
            item,
            data,
        });
    }
    items
}

/// The integer value following the first occurrence of a tag.
pub fn value_after_tag(payload: &[u8], tag: u64) -> Option<u64> {
    parse_items(payload)
        .into_iter()
        .find(|p| p.tag == Some(tag))
        .map(|p| p.item.value)
}
