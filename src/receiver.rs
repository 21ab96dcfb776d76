//! # Stream Receiver Module
//!
//! The byte-driven state machine that turns link bytes back into proxy
//! messages. It is fed arbitrary fragments (a frame may arrive one byte
//! at a time, or many frames may share one read) and it suspends between
//! any two bytes by simply returning; all progress lives in the machine.
//!
//! ## Two Layers
//!
//! The outer machine walks `Idle → PartialHeader → Stream → Done → Idle`:
//! it assembles the 9-byte common header, byte-swaps and validates it, and
//! parameterizes the inner machine by message type.
//!
//! The inner machine owns the body. Its states are `ConstantBody` (fixed
//! layouts), `IpcMsgId`/`AsyncEventInit` (the raw 4-byte local id),
//! `CborHeader` (the first byte of an item), `CborIntegerItem` (the rest
//! of a multi-byte item header), and `CborItemBody` (string payload
//! routing). Every state carries an expected byte count, a destination
//! selector, and a received counter.
//!
//! ## Dispatch
//!
//! Completed CBOR items fold through a dispatch keyed by *(last seen tag
//! class, item type)*: direct copy, array header, string header, semantic
//! tag, reference translation, output-size policy, file-stream metadata,
//! or break. Any cell not in that table is a peer-fatal format error, as
//! is any tag outside the agreed registry.
//!
//! ## Reassembly
//!
//! IPC-bearing bodies are rebuilt into the local payload form
//! `[id][items…][break]` with references translated through the context
//! tables, optimized output sizes turned back into local buffer tokens,
//! and file-stream metadata captured for the dispatcher. Async events
//! resolve their destination session from the event-context token carried
//! in the body, not the header, so the session is pinned the moment the
//! first reference item is parsed.

use crate::error::ProxyError;
use crate::events::{EventContexts, ServerContext};
use crate::fabric::{BufferToken, IpcFabric, SessionHandle};
use crate::limits::{OUT_PARAM_SLOTS_MAX, SMALL_OUT_PARAMETER_MAX};
use crate::service::ServiceTable;
use crate::tracker::RequestTracker;
use crate::wire::cbor::{self, Item, ItemKind};
use crate::wire::{
    CommonHeader, ConnectBody, MessageType, SemanticTag, StreamFlags, TagClass,
    COMMON_HEADER_SIZE, FIXED_BODY_SIZE, IPC_MSG_ID_SIZE,
};
use tracing::{debug, trace, warn};

/// Default cap on a reconstructed payload when no endpoint bound tighter.
const DEFAULT_PAYLOAD_LIMIT: usize = 64 * 1024;

/// Borrowed engine state the parse needs: reference translation happens
/// *during* the fold, not after it.
pub struct RecvCtx<'a> {
    pub system: &'a str,
    pub fabric: &'a mut dyn IpcFabric,
    pub services: &'a mut ServiceTable,
    pub tracker: &'a mut RequestTracker,
    pub contexts: &'a mut EventContexts,
}

/// A completed message handed up to the dispatcher.
#[derive(Debug)]
pub enum RecvOutput {
    /// A fixed-layout record (connect/disconnect/keep-alive).
    Fixed {
        header: CommonHeader,
        body: ConnectBody,
    },
    /// A reconstructed local IPC message.
    Ipc(IpcDelivery),
    /// An in-band file-stream message.
    Filestream(FsMessage),
}

/// A reconstructed IPC message plus everything resolved during the parse.
#[derive(Debug)]
pub struct IpcDelivery {
    pub header: CommonHeader,
    /// Local payload form: `[id][items…][break]`.
    pub payload: Vec<u8>,
    /// File-stream metadata from the tail, if the message carries one.
    pub meta_stream_id: Option<u16>,
    pub meta_flags: StreamFlags,
    /// Scratch buffers allocated while reconstructing optimized
    /// parameters; ownership passes to the pending-request record.
    pub recv_buffers: Vec<BufferToken>,
    /// Target session resolved from the event-context token (async events
    /// only).
    pub session: Option<SessionHandle>,
    /// Server event-context token minted for an inbound add-handler
    /// registration.
    pub server_ctx: Option<u32>,
    /// The parse consumed the bytes but the message has no live consumer
    /// (late response); the dispatcher drops it.
    pub discard: bool,
    /// Set when a bounded table filled mid-parse: the dispatcher answers
    /// the originator with this code instead of delivering.
    pub error_code: Option<i32>,
}

/// A parsed FILESTREAM_MESSAGE body.
#[derive(Debug)]
pub struct FsMessage {
    pub stream_id: u16,
    pub flags: StreamFlags,
    pub requested: Option<u64>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OuterState {
    Idle,
    PartialHeader,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InnerState {
    ConstantBody,
    IpcMsgId,
    AsyncEventInit,
    CborHeader,
    CborIntegerItem,
    CborItemBody,
    StreamDone,
}

/// Where the bytes of the current state land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dest {
    Work,
    Fixed,
    Payload,
    StrBuf,
    Discard,
}

/// What happens to a string body once complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrRoute {
    /// Bytes already went to the payload verbatim.
    Payload,
    /// Copy back into a recorded out-parameter buffer, then re-emit the
    /// local response form.
    OutResponse { token: BufferToken, text: bool },
    /// Byte-string payload of a file-stream message.
    FsPayload,
    /// Late-response bytes with no consumer.
    Discard,
}

/// The per-peer receive state machine.
pub struct Receiver {
    outer: OuterState,
    inner: InnerState,
    header_buf: [u8; COMMON_HEADER_SIZE],
    header_got: usize,
    header: Option<CommonHeader>,

    expected: usize,
    received: usize,
    dest: Dest,
    work: [u8; cbor::MAX_HEADER_SIZE],

    fixed: Vec<u8>,
    payload: Vec<u8>,
    payload_limit: usize,
    strbuf: Vec<u8>,
    route: StrRoute,

    last_tag: Option<SemanticTag>,
    depth: u32,

    meta_stream_id: Option<u16>,
    meta_flags: StreamFlags,
    fs_requested: Option<u64>,
    fs_payload: Option<Vec<u8>>,

    resolved_session: Option<SessionHandle>,
    resolved_server_ctx: Option<u32>,
    recv_buffers: Vec<BufferToken>,
    out_params_seen: usize,
    discard: bool,
    error_code: Option<i32>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            outer: OuterState::Idle,
            inner: InnerState::StreamDone,
            header_buf: [0; COMMON_HEADER_SIZE],
            header_got: 0,
            header: None,
            expected: 0,
            received: 0,
            dest: Dest::Work,
            work: [0; cbor::MAX_HEADER_SIZE],
            fixed: Vec::new(),
            payload: Vec::new(),
            payload_limit: DEFAULT_PAYLOAD_LIMIT,
            strbuf: Vec::new(),
            route: StrRoute::Payload,
            last_tag: None,
            depth: 0,
            meta_stream_id: None,
            meta_flags: StreamFlags::empty(),
            fs_requested: None,
            fs_payload: None,
            resolved_session: None,
            resolved_server_ctx: None,
            recv_buffers: Vec::new(),
            out_params_seen: 0,
            discard: false,
            error_code: None,
        }
    }

    /// Reset per-message state; outer returns to Idle.
    fn reset(&mut self) {
        self.outer = OuterState::Idle;
        self.inner = InnerState::StreamDone;
        self.header_got = 0;
        self.header = None;
        self.expected = 0;
        self.received = 0;
        self.dest = Dest::Work;
        self.fixed.clear();
        self.payload = Vec::new();
        self.payload_limit = DEFAULT_PAYLOAD_LIMIT;
        self.strbuf = Vec::new();
        self.route = StrRoute::Payload;
        self.last_tag = None;
        self.depth = 0;
        self.meta_stream_id = None;
        self.meta_flags = StreamFlags::empty();
        self.fs_requested = None;
        self.fs_payload = None;
        self.resolved_session = None;
        self.resolved_server_ctx = None;
        self.recv_buffers = Vec::new();
        self.out_params_seen = 0;
        self.discard = false;
        self.error_code = None;
    }

    /// Feed a fragment of link bytes through the machine.
    ///
    /// Returns every message completed within the fragment. A format error
    /// is fatal for the peer: the caller tears the link down, and this
    /// machine must not be fed again (the supervisor replaces it on
    /// reconnect).
    pub fn feed(
        &mut self,
        mut input: &[u8],
        ctx: &mut RecvCtx<'_>,
    ) -> Result<Vec<RecvOutput>, ProxyError> {
        let mut outputs = Vec::new();
        while !input.is_empty() {
            match self.outer {
                OuterState::Idle | OuterState::PartialHeader => {
                    let want = COMMON_HEADER_SIZE - self.header_got;
                    let take = want.min(input.len());
                    self.header_buf[self.header_got..self.header_got + take]
                        .copy_from_slice(&input[..take]);
                    self.header_got += take;
                    input = &input[take..];
                    self.outer = OuterState::PartialHeader;
                    if self.header_got == COMMON_HEADER_SIZE {
                        let header = CommonHeader::from_wire(&self.header_buf)?;
                        trace!(id = header.id, msg_type = ?header.msg_type, "received message header");
                        self.begin_stream(header, ctx)?;
                        self.drain_zero_states(ctx, &mut outputs)?;
                    }
                }
                OuterState::Stream => {
                    let want = self.expected - self.received;
                    let take = want.min(input.len());
                    self.absorb(&input[..take]);
                    self.received += take;
                    input = &input[take..];
                    if self.received == self.expected {
                        self.advance(ctx, &mut outputs)?;
                        self.drain_zero_states(ctx, &mut outputs)?;
                    }
                }
            }
        }
        Ok(outputs)
    }

    /// Process states whose expected byte count is already satisfied
    /// (zero-length strings, immediate transitions).
    fn drain_zero_states(
        &mut self,
        ctx: &mut RecvCtx<'_>,
        outputs: &mut Vec<RecvOutput>,
    ) -> Result<(), ProxyError> {
        while self.outer == OuterState::Stream && self.received == self.expected {
            self.advance(ctx, outputs)?;
        }
        Ok(())
    }

    fn absorb(&mut self, bytes: &[u8]) {
        match self.dest {
            Dest::Work => {
                self.work[self.received..self.received + bytes.len()].copy_from_slice(bytes);
            }
            Dest::Fixed => self.fixed.extend_from_slice(bytes),
            Dest::Payload => self.payload.extend_from_slice(bytes),
            Dest::StrBuf => self.strbuf.extend_from_slice(bytes),
            Dest::Discard => {}
        }
    }

    fn expect(&mut self, inner: InnerState, expected: usize, dest: Dest) {
        self.inner = inner;
        self.expected = expected;
        self.received = 0;
        self.dest = dest;
    }

    /// Initialize the inner machine from a validated header.
    fn begin_stream(
        &mut self,
        header: CommonHeader,
        ctx: &mut RecvCtx<'_>,
    ) -> Result<(), ProxyError> {
        self.outer = OuterState::Stream;
        match header.msg_type {
            MessageType::ConnectServiceRequest
            | MessageType::ConnectServiceResponse
            | MessageType::DisconnectService
            | MessageType::KeepaliveRequest
            | MessageType::KeepaliveResponse => {
                self.expect(InnerState::ConstantBody, FIXED_BODY_SIZE, Dest::Fixed);
            }
            MessageType::ClientRequest => {
                if !ctx.services.contains_id(header.service_id) {
                    return Err(ProxyError::format(format!(
                        "client request for unknown service id {}",
                        header.service_id
                    )));
                }
                self.payload_limit = ctx
                    .services
                    .max_msg_size_for_id(header.service_id)
                    .unwrap_or(DEFAULT_PAYLOAD_LIMIT);
                self.expect(InnerState::IpcMsgId, IPC_MSG_ID_SIZE, Dest::Work);
            }
            MessageType::ServerResponse => {
                // A response racing a timeout or teardown is normal: the
                // bytes must still be consumed, the result is dropped.
                if ctx.tracker.outbound(header.id).is_none() {
                    debug!(id = header.id, "response for untracked request; discarding");
                    self.discard = true;
                }
                self.expect(InnerState::IpcMsgId, IPC_MSG_ID_SIZE, Dest::Work);
            }
            MessageType::ServerAsyncEvent => {
                self.expect(InnerState::AsyncEventInit, IPC_MSG_ID_SIZE, Dest::Work);
            }
            MessageType::FilestreamMessage => {
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }
        }
        self.header = Some(header);
        Ok(())
    }

    fn header(&self) -> CommonHeader {
        self.header.expect("advance() requires an active header")
    }

    fn is_filestream(&self) -> bool {
        self.header().msg_type == MessageType::FilestreamMessage
    }

    /// One completed state's worth of processing.
    fn advance(
        &mut self,
        ctx: &mut RecvCtx<'_>,
        outputs: &mut Vec<RecvOutput>,
    ) -> Result<(), ProxyError> {
        if self.payload.len() > self.payload_limit {
            return Err(ProxyError::format("reconstructed payload exceeds limit"));
        }
        match self.inner {
            InnerState::ConstantBody => {
                let body = ConnectBody::from_wire(&self.fixed)?;
                let header = self.header();
                outputs.push(RecvOutput::Fixed { header, body });
                self.reset();
            }
            InnerState::IpcMsgId | InnerState::AsyncEventInit => {
                let id = &self.work[..IPC_MSG_ID_SIZE];
                if !self.discard {
                    self.payload.extend_from_slice(id);
                }
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }
            InnerState::CborHeader => {
                let extra = cbor::extra_bytes(self.work[0])?;
                if extra > 0 {
                    // Keep the initial byte; collect the argument bytes.
                    self.inner = InnerState::CborIntegerItem;
                    self.expected = 1 + extra;
                    self.dest = Dest::Work;
                    // received stays at 1: work[0] is already in place.
                    self.received = 1;
                } else {
                    let item = cbor::decode_item(&self.work[..1])?;
                    self.dispatch(item, ctx, outputs)?;
                }
            }
            InnerState::CborIntegerItem => {
                let len = self.received;
                let item = cbor::decode_item(&self.work[..len])?;
                self.dispatch(item, ctx, outputs)?;
            }
            InnerState::CborItemBody => {
                self.finish_string(ctx)?;
            }
            InnerState::StreamDone => {
                // Reached only via drain_zero_states after reset; nothing
                // to do; Idle takes over on the next byte.
                return Ok(());
            }
        }
        Ok(())
    }

    /// The `(tag class, item type)` fold.
    fn dispatch(
        &mut self,
        item: Item,
        ctx: &mut RecvCtx<'_>,
        outputs: &mut Vec<RecvOutput>,
    ) -> Result<(), ProxyError> {
        if self.is_filestream() {
            return self.dispatch_filestream(item, outputs);
        }
        let class = self.last_tag.map(SemanticTag::class).unwrap_or(TagClass::None);
        match (class, item.kind) {
            (TagClass::None, ItemKind::PosInt)
            | (TagClass::None, ItemKind::NegInt)
            | (TagClass::None, ItemKind::Boolean)
            | (TagClass::None, ItemKind::Double) => {
                if self.last_tag.is_some() {
                    return Err(ProxyError::format("response tag not followed by a string"));
                }
                if !self.discard {
                    self.payload.extend_from_slice(item.header_bytes());
                }
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }

            (TagClass::None, ItemKind::ByteString) | (TagClass::None, ItemKind::TextString) => {
                self.begin_string(item, ctx)?;
            }

            (TagClass::None, ItemKind::Array) => {
                if self.last_tag.is_some() {
                    return Err(ProxyError::format("array after a pending tag"));
                }
                if item.indefinite {
                    self.depth += 1;
                    // The outermost array is implicit in the local form.
                    if self.depth > 1 && !self.discard {
                        self.payload.extend_from_slice(item.header_bytes());
                    }
                } else if !self.discard {
                    self.payload.extend_from_slice(item.header_bytes());
                }
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }

            (TagClass::None, ItemKind::Tag) => {
                if self.last_tag.is_some() {
                    return Err(ProxyError::format("tag directly after a pending tag"));
                }
                let tag = SemanticTag::from_wire(item.value)?;
                self.last_tag = Some(tag);
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }

            (TagClass::None, ItemKind::Break) => {
                if self.last_tag.is_some() {
                    return Err(ProxyError::format("break after a pending tag"));
                }
                if self.depth == 0 {
                    return Err(ProxyError::format("break outside any collection"));
                }
                self.depth -= 1;
                if !self.discard {
                    self.payload.push(cbor::BREAK);
                }
                if self.depth == 0 {
                    self.finish_ipc(outputs);
                } else {
                    self.expect(InnerState::CborHeader, 1, Dest::Work);
                }
            }

            (TagClass::OutputSize, ItemKind::PosInt) => {
                self.handle_output_size(item.value, ctx)?;
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }

            (TagClass::Filestream, ItemKind::PosInt) => {
                let tag = self.last_tag.take().expect("class implies a tag");
                match tag {
                    SemanticTag::FilestreamId => {
                        self.meta_stream_id = Some(
                            u16::try_from(item.value)
                                .map_err(|_| ProxyError::format("stream id exceeds 16 bits"))?,
                        );
                    }
                    SemanticTag::FilestreamFlag => {
                        let bits = u16::try_from(item.value)
                            .map_err(|_| ProxyError::format("stream flags exceed 16 bits"))?;
                        self.meta_flags = StreamFlags::from_bits(bits)
                            .ok_or_else(|| ProxyError::format("unknown stream flag bits"))?;
                    }
                    SemanticTag::FilestreamRequestSize => {
                        return Err(ProxyError::format(
                            "request-size tag outside a filestream message",
                        ));
                    }
                    _ => unreachable!("class implies a filestream tag"),
                }
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }

            (TagClass::Reference, ItemKind::PosInt) => {
                let tag = self.last_tag.take().expect("class implies a tag");
                self.handle_reference(tag, item.value, ctx)?;
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }

            // Every unlisted cell of the dispatch table.
            (class, kind) => {
                return Err(ProxyError::format(format!(
                    "unexpected item {kind:?} under tag class {class:?}"
                )));
            }
        }
        Ok(())
    }

    fn dispatch_filestream(
        &mut self,
        item: Item,
        outputs: &mut Vec<RecvOutput>,
    ) -> Result<(), ProxyError> {
        let class = self.last_tag.map(SemanticTag::class).unwrap_or(TagClass::None);
        match (class, item.kind) {
            (TagClass::None, ItemKind::Array) if item.indefinite && self.depth == 0 => {
                self.depth = 1;
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }
            (TagClass::None, ItemKind::Tag) => {
                let tag = SemanticTag::from_wire(item.value)?;
                if tag.class() != TagClass::Filestream {
                    return Err(ProxyError::format(format!(
                        "tag {} is not valid in a filestream message",
                        item.value
                    )));
                }
                self.last_tag = Some(tag);
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }
            (TagClass::Filestream, ItemKind::PosInt) => {
                let tag = self.last_tag.take().expect("class implies a tag");
                match tag {
                    SemanticTag::FilestreamId => {
                        self.meta_stream_id = Some(
                            u16::try_from(item.value)
                                .map_err(|_| ProxyError::format("stream id exceeds 16 bits"))?,
                        );
                    }
                    SemanticTag::FilestreamFlag => {
                        let bits = u16::try_from(item.value)
                            .map_err(|_| ProxyError::format("stream flags exceed 16 bits"))?;
                        self.meta_flags = StreamFlags::from_bits(bits)
                            .ok_or_else(|| ProxyError::format("unknown stream flag bits"))?;
                    }
                    SemanticTag::FilestreamRequestSize => {
                        self.fs_requested = Some(item.value);
                    }
                    _ => unreachable!("class implies a filestream tag"),
                }
                self.expect(InnerState::CborHeader, 1, Dest::Work);
            }
            (TagClass::None, ItemKind::ByteString) => {
                let len = item.payload_len();
                if len > crate::limits::FILESTREAM_PAYLOAD_MAX {
                    return Err(ProxyError::format("filestream chunk exceeds the cap"));
                }
                self.strbuf = Vec::with_capacity(len);
                self.route = StrRoute::FsPayload;
                self.expect(InnerState::CborItemBody, len, Dest::StrBuf);
            }
            (TagClass::None, ItemKind::Break) if self.depth == 1 => {
                self.depth = 0;
                let stream_id = self
                    .meta_stream_id
                    .ok_or_else(|| ProxyError::format("filestream message without an id"))?;
                let flags = self.meta_flags;
                if flags.is_empty() {
                    return Err(ProxyError::format("filestream message without flags"));
                }
                outputs.push(RecvOutput::Filestream(FsMessage {
                    stream_id,
                    flags,
                    requested: self.fs_requested,
                    payload: self.fs_payload.take(),
                }));
                self.reset();
            }
            (class, kind) => {
                return Err(ProxyError::format(format!(
                    "unexpected filestream item {kind:?} under tag class {class:?}"
                )));
            }
        }
        Ok(())
    }

    /// String-header handler: decide where the payload goes.
    fn begin_string(&mut self, item: Item, ctx: &mut RecvCtx<'_>) -> Result<(), ProxyError> {
        let len = item.payload_len();
        let text = item.kind == ItemKind::TextString;
        match self.last_tag.take() {
            Some(tag @ (SemanticTag::OutStringResponse | SemanticTag::OutByteStrResponse)) => {
                let want_text = tag == SemanticTag::OutStringResponse;
                if want_text != text {
                    return Err(ProxyError::format("response string kind mismatch"));
                }
                if self.discard {
                    self.route = StrRoute::Discard;
                    self.expect(InnerState::CborItemBody, len, Dest::Discard);
                    return Ok(());
                }
                let header = self.header();
                let rec = ctx
                    .tracker
                    .outbound_mut(header.id)
                    .ok_or_else(|| ProxyError::format("response item without a request"))?;
                let param = rec.out_params.pop_front().ok_or_else(|| {
                    ProxyError::format("more response strings than recorded buffers")
                })?;
                if param.text != text {
                    return Err(ProxyError::format("response string kind mismatch"));
                }
                self.strbuf = Vec::with_capacity(len);
                self.route = StrRoute::OutResponse {
                    token: param.token,
                    text,
                };
                self.expect(InnerState::CborItemBody, len, Dest::StrBuf);
            }
            Some(_) => Err(ProxyError::format("string after a pending tag"))?,
            None => {
                if self.discard {
                    self.route = StrRoute::Discard;
                    self.expect(InnerState::CborItemBody, len, Dest::Discard);
                } else {
                    self.payload.extend_from_slice(item.header_bytes());
                    self.route = StrRoute::Payload;
                    self.expect(InnerState::CborItemBody, len, Dest::Payload);
                }
            }
        }
        Ok(())
    }

    /// A string body just completed.
    fn finish_string(&mut self, ctx: &mut RecvCtx<'_>) -> Result<(), ProxyError> {
        match self.route {
            StrRoute::Payload | StrRoute::Discard => {}
            StrRoute::OutResponse { token, text } => {
                let data = std::mem::take(&mut self.strbuf);
                ctx.fabric.write_buffer(token, &data)?;
                // The local response form carries the tag and the actual
                // length; the client reads the bytes from its own buffer.
                cbor::emit_tag(
                    &mut self.payload,
                    if text {
                        SemanticTag::OutStringResponse
                    } else {
                        SemanticTag::OutByteStrResponse
                    },
                );
                cbor::emit_uint(&mut self.payload, data.len() as u64);
            }
            StrRoute::FsPayload => {
                self.fs_payload = Some(std::mem::take(&mut self.strbuf));
            }
        }
        self.route = StrRoute::Payload;
        self.expect(InnerState::CborHeader, 1, Dest::Work);
        Ok(())
    }

    /// `OUT_*_SIZE` handler: apply the optimization policy.
    fn handle_output_size(&mut self, size: u64, ctx: &mut RecvCtx<'_>) -> Result<(), ProxyError> {
        let tag = self.last_tag.take().expect("class implies a tag");
        let text = tag == SemanticTag::OutStringSize;
        if self.discard {
            return Ok(());
        }
        if size as usize > SMALL_OUT_PARAMETER_MAX {
            if self.out_params_seen >= OUT_PARAM_SLOTS_MAX {
                // Bounded-table policy: the message is answered with a
                // no-memory response, the link stays up.
                warn!("out-parameter slots exhausted; answering no-memory");
                self.discard = true;
                self.error_code = Some(crate::wire::service_code::NO_MEMORY);
                return Ok(());
            }
            self.out_params_seen += 1;
            let token = match ctx.fabric.alloc_buffer(vec![0u8; size as usize]) {
                Ok(token) => token,
                Err(ProxyError::ResourceExhausted(_)) => {
                    self.discard = true;
                    self.error_code = Some(crate::wire::service_code::NO_MEMORY);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.recv_buffers.push(token);
            // Local form: pointer tag, header-only string, size, token.
            cbor::emit_tag(
                &mut self.payload,
                if text {
                    SemanticTag::OutStringPointer
                } else {
                    SemanticTag::OutByteStrPointer
                },
            );
            self.payload.push(if text { 0x60 } else { 0x40 });
            cbor::emit_uint(&mut self.payload, size);
            cbor::emit_uint(&mut self.payload, u64::from(token.0));
        } else {
            cbor::emit_tag(&mut self.payload, tag);
            cbor::emit_uint(&mut self.payload, size);
        }
        Ok(())
    }

    /// Reference-value handler: wire token → local value, per message type.
    fn handle_reference(
        &mut self,
        tag: SemanticTag,
        value: u64,
        ctx: &mut RecvCtx<'_>,
    ) -> Result<(), ProxyError> {
        if self.discard {
            return Ok(());
        }
        let header = self.header();
        let translated = match (header.msg_type, tag) {
            (_, SemanticTag::Reference) => value,

            // Inbound add-handler registration (consumer side): remember
            // the peer's context token, hand the local server ours.
            (MessageType::ClientRequest, SemanticTag::ContextPtrReference) => {
                match ctx.contexts.mint_server(ServerContext {
                    system: ctx.system.to_owned(),
                    service_id: header.service_id,
                    wire_context: value,
                    local_handler: None,
                }) {
                    Ok(token) => {
                        self.resolved_server_ctx = Some(token);
                        u64::from(token)
                    }
                    Err(ProxyError::ResourceExhausted(_)) => {
                        self.discard = true;
                        self.error_code = Some(crate::wire::service_code::NO_MEMORY);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }

            // Inbound remove-handler (consumer side): resolve to the real
            // server's handler value and release the record.
            (MessageType::ClientRequest, SemanticTag::AsyncHandlerReference) => {
                let rec = ctx
                    .contexts
                    .release_server(value as u32)
                    .ok_or_else(|| ProxyError::format("unresolved handler token"))?;
                rec.local_handler
                    .ok_or_else(|| ProxyError::format("remove-handler before registration"))?
            }

            // Registration response (host side): complete the client
            // record; the local client's handler ref is our own token.
            (MessageType::ServerResponse, SemanticTag::AsyncHandlerReference) => {
                let header_id = header.id;
                let context = ctx
                    .tracker
                    .outbound(header_id)
                    .and_then(|rec| rec.context)
                    .ok_or_else(|| {
                        ProxyError::format("handler reference in a non-registration response")
                    })?;
                let rec = ctx
                    .contexts
                    .client_mut(context)
                    .ok_or_else(|| ProxyError::format("unresolved context token"))?;
                rec.handler = Some(value);
                u64::from(context)
            }

            // Async event (host side): the token *is* the routing key; the
            // session comes from the record, the client gets its original
            // cookie back.
            (MessageType::ServerAsyncEvent, SemanticTag::ContextPtrReference)
            | (MessageType::ServerAsyncEvent, SemanticTag::AsyncHandlerReference) => {
                let rec = ctx
                    .contexts
                    .client(value as u32)
                    .ok_or_else(|| ProxyError::format("event for unresolved context token"))?;
                self.resolved_session = Some(rec.session);
                rec.original_context
            }

            (msg_type, tag) => {
                return Err(ProxyError::format(format!(
                    "tag {tag:?} is not valid in a {msg_type:?} body"
                )));
            }
        };
        cbor::emit_tag(&mut self.payload, tag);
        cbor::emit_uint(&mut self.payload, translated);
        Ok(())
    }

    /// The outer break of an IPC body closed: hand the delivery up.
    fn finish_ipc(&mut self, outputs: &mut Vec<RecvOutput>) {
        let header = self.header();
        outputs.push(RecvOutput::Ipc(IpcDelivery {
            header,
            payload: std::mem::take(&mut self.payload),
            meta_stream_id: self.meta_stream_id.take(),
            meta_flags: self.meta_flags,
            recv_buffers: std::mem::take(&mut self.recv_buffers),
            session: self.resolved_session.take(),
            server_ctx: self.resolved_server_ctx.take(),
            discard: self.discard,
            error_code: self.error_code.take(),
        }));
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, RequiredClient, ServiceBinding};
    use crate::fabric::loopback::LoopbackFabric;
    use crate::limits::{EVENT_HANDLERS_MAX, IN_FLIGHT_MSGS_MAX, SERVICE_BINDINGS_MAX};
    use crate::wire::service_code;

    struct Harness {
        fabric: Box<dyn IpcFabric>,
        services: ServiceTable,
        tracker: RequestTracker,
        contexts: EventContexts,
    }

    impl Harness {
        fn new() -> Self {
            let cfg = ProxyConfig {
                local_system_name: "B".into(),
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
            let mut services = ServiceTable::new(&cfg, SERVICE_BINDINGS_MAX);
            // The peer announced service id 7; adopt it for svc.foo.
            services.adopt_id("A", "svc.foo", 7).unwrap();
            let (fabric, _handle) = LoopbackFabric::new();
            Self {
                fabric: Box::new(fabric),
                services,
                tracker: RequestTracker::new(IN_FLIGHT_MSGS_MAX),
                contexts: EventContexts::new(EVENT_HANDLERS_MAX),
            }
        }

        fn ctx(&mut self) -> RecvCtx<'_> {
            RecvCtx {
                system: "A",
                fabric: self.fabric.as_mut(),
                services: &mut self.services,
                tracker: &mut self.tracker,
                contexts: &mut self.contexts,
            }
        }
    }

    fn client_request_frame(service_id: u32, proxy_id: u32, body_items: &[u8]) -> Vec<u8> {
        let header = CommonHeader {
            id: proxy_id,
            service_id,
            msg_type: MessageType::ClientRequest,
        };
        let mut frame = header.to_wire().to_vec();
        frame.extend_from_slice(&0xA2u32.to_be_bytes());
        frame.push(cbor::INDEF_ARRAY_HEADER);
        frame.extend_from_slice(body_items);
        frame.push(cbor::BREAK);
        frame
    }

    fn feed_all(receiver: &mut Receiver, harness: &mut Harness, bytes: &[u8]) -> Vec<RecvOutput> {
        let mut ctx = harness.ctx();
        receiver.feed(bytes, &mut ctx).unwrap()
    }

    fn feed_fragmented(
        receiver: &mut Receiver,
        harness: &mut Harness,
        bytes: &[u8],
    ) -> Vec<RecvOutput> {
        let mut outputs = Vec::new();
        for b in bytes {
            let mut ctx = harness.ctx();
            outputs.extend(receiver.feed(std::slice::from_ref(b), &mut ctx).unwrap());
        }
        outputs
    }

    #[test]
    fn fixed_body_round_trips() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let header = CommonHeader {
            id: 1,
            service_id: 7,
            msg_type: MessageType::ConnectServiceRequest,
        };
        let body = ConnectBody {
            system_name: "B".into(),
            service_name: "svc.foo".into(),
            protocol_id: "P1".into(),
            service_code: service_code::OK,
        };
        let frame = crate::sender::fixed_frame(&header, &body);
        let outputs = feed_all(&mut receiver, &mut harness, &frame);
        match &outputs[..] {
            [RecvOutput::Fixed { header: h, body: b }] => {
                assert_eq!(*h, header);
                assert_eq!(*b, body);
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn primitive_round_trip_matches_literal_bytes() {
        // A CLIENT_REQUEST id=42 with method id 0xA2 and no arguments
        // delivers a payload of the raw id followed by break.
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let frame = client_request_frame(7, 42, &[]);
        let outputs = feed_all(&mut receiver, &mut harness, &frame);
        match &outputs[..] {
            [RecvOutput::Ipc(delivery)] => {
                assert_eq!(delivery.header.id, 42);
                assert_eq!(delivery.payload, vec![0x00, 0x00, 0x00, 0xA2, 0xFF]);
                assert!(!delivery.discard);
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn byte_at_a_time_equals_single_feed() {
        let mut items = Vec::new();
        cbor::emit_uint(&mut items, 300);
        cbor::emit_text(&mut items, "hello");
        cbor::emit_int(&mut items, -2);
        let frame = client_request_frame(7, 5, &items);

        let mut h1 = Harness::new();
        let mut r1 = Receiver::new();
        let whole = feed_all(&mut r1, &mut h1, &frame);

        let mut h2 = Harness::new();
        let mut r2 = Receiver::new();
        let fragmented = feed_fragmented(&mut r2, &mut h2, &frame);

        match (&whole[..], &fragmented[..]) {
            ([RecvOutput::Ipc(a)], [RecvOutput::Ipc(b)]) => {
                assert_eq!(a.payload, b.payload);
                assert_eq!(&a.payload[..4], &0xA2u32.to_be_bytes());
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn two_frames_in_one_fragment() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let mut bytes = client_request_frame(7, 1, &[]);
        bytes.extend_from_slice(&client_request_frame(7, 2, &[]));
        let outputs = feed_all(&mut receiver, &mut harness, &bytes);
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn unknown_type_and_unknown_tag_are_fatal() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let mut frame = client_request_frame(7, 1, &[]);
        frame[8] = 200; // corrupt the type byte
        let mut ctx = harness.ctx();
        assert!(receiver.feed(&frame, &mut ctx).is_err());

        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let mut items = Vec::new();
        items.push(0xC0 | 21); // tag 21: outside the registry
        items.push(0x01);
        let frame = client_request_frame(7, 1, &items);
        let mut ctx = harness.ctx();
        assert!(receiver.feed(&frame, &mut ctx).is_err());
    }

    #[test]
    fn local_only_tag_on_wire_is_fatal() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let mut items = Vec::new();
        items.push(0xC0 | SemanticTag::InStringPointer as u8);
        items.push(0x01);
        let frame = client_request_frame(7, 1, &items);
        let mut ctx = harness.ctx();
        assert!(receiver.feed(&frame, &mut ctx).is_err());
    }

    #[test]
    fn map_item_is_fatal() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let frame = client_request_frame(7, 1, &[0xA0]); // empty map
        let mut ctx = harness.ctx();
        assert!(receiver.feed(&frame, &mut ctx).is_err());
    }

    #[test]
    fn nested_arrays_preserve_depth_and_bytes() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        // [ 1, [_ 2 ] ] as items: definite outer copied verbatim.
        let items = vec![0x82, 0x01, 0x9F, 0x02, 0xFF];
        let frame = client_request_frame(7, 3, &items);
        let outputs = feed_all(&mut receiver, &mut harness, &frame);
        match &outputs[..] {
            [RecvOutput::Ipc(delivery)] => {
                let mut expected = 0xA2u32.to_be_bytes().to_vec();
                expected.extend_from_slice(&items);
                expected.push(0xFF);
                assert_eq!(delivery.payload, expected);
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn large_output_size_allocates_local_buffer() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let mut items = Vec::new();
        cbor::emit_tag(&mut items, SemanticTag::OutByteStrSize);
        cbor::emit_uint(&mut items, 1024);
        let frame = client_request_frame(7, 4, &items);
        let outputs = feed_all(&mut receiver, &mut harness, &frame);
        match &outputs[..] {
            [RecvOutput::Ipc(delivery)] => {
                assert_eq!(delivery.recv_buffers.len(), 1);
                // Local form: OUT_BYTE_STR_POINTER tag present.
                let tag_byte = 0xC0 | SemanticTag::OutByteStrPointer as u8;
                assert!(delivery.payload.contains(&tag_byte));
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn small_output_size_copies_verbatim() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let mut items = Vec::new();
        cbor::emit_tag(&mut items, SemanticTag::OutStringSize);
        cbor::emit_uint(&mut items, 16);
        let frame = client_request_frame(7, 4, &items);
        let outputs = feed_all(&mut receiver, &mut harness, &frame);
        match &outputs[..] {
            [RecvOutput::Ipc(delivery)] => {
                assert!(delivery.recv_buffers.is_empty());
                let tag_byte = 0xC0 | SemanticTag::OutStringSize as u8;
                assert!(delivery.payload.contains(&tag_byte));
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn context_registration_mints_server_token() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let mut items = Vec::new();
        cbor::emit_tag(&mut items, SemanticTag::ContextPtrReference);
        cbor::emit_uint(&mut items, 0x1234); // the peer's wire token
        let frame = client_request_frame(7, 6, &items);
        let outputs = feed_all(&mut receiver, &mut harness, &frame);
        match &outputs[..] {
            [RecvOutput::Ipc(delivery)] => {
                let token = delivery.server_ctx.expect("server context minted");
                let rec = harness.contexts.server(token).unwrap();
                assert_eq!(rec.wire_context, 0x1234);
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn filestream_message_parses_flags_and_payload() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let header = CommonHeader {
            id: 9,
            service_id: 7,
            msg_type: MessageType::FilestreamMessage,
        };
        let frame = crate::sender::filestream_frame(
            &header,
            3,
            StreamFlags::OWNER | StreamFlags::DATA_PACKET,
            None,
            Some(&[1, 2, 3, 4]),
        );
        let outputs = feed_fragmented(&mut receiver, &mut harness, &frame);
        match &outputs[..] {
            [RecvOutput::Filestream(msg)] => {
                assert_eq!(msg.stream_id, 3);
                assert!(msg.flags.contains(StreamFlags::DATA_PACKET));
                assert_eq!(msg.payload.as_deref(), Some(&[1u8, 2, 3, 4][..]));
                assert_eq!(msg.requested, None);
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn late_response_is_consumed_and_discarded() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let header = CommonHeader {
            id: 99, // nothing tracked under this id
            service_id: 7,
            msg_type: MessageType::ServerResponse,
        };
        let mut frame = header.to_wire().to_vec();
        frame.extend_from_slice(&0xA2u32.to_be_bytes());
        frame.push(cbor::INDEF_ARRAY_HEADER);
        cbor::emit_text(&mut frame, "ignored");
        frame.push(cbor::BREAK);

        let outputs = feed_all(&mut receiver, &mut harness, &frame);
        match &outputs[..] {
            [RecvOutput::Ipc(delivery)] => {
                assert!(delivery.discard);
                assert!(delivery.payload.is_empty());
            }
            other => panic!("unexpected outputs {other:?}"),
        }
        // The machine is clean for the next frame.
        let outputs = feed_all(&mut receiver, &mut harness, &client_request_frame(7, 1, &[]));
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn request_for_unknown_service_is_fatal() {
        let mut harness = Harness::new();
        let mut receiver = Receiver::new();
        let frame = client_request_frame(1234, 1, &[]);
        let mut ctx = harness.ctx();
        assert!(receiver.feed(&frame, &mut ctx).is_err());
    }
}
