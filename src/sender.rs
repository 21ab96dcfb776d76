//! # Stream Sender Module
//!
//! The inverse of the receiver: reads a locally produced IPC payload
//! item-by-item and emits the framed wire form. Fixed-layout messages are
//! a straight byte-swap; IPC-bearing payloads run through a small state
//! machine that recognizes the *local-only* compaction tags and rewrites
//! them for the wire:
//!
//! - `IN_*_POINTER {size, token}` expands to a plain CBOR string with the
//!   contents resolved from the buffer table; the token never leaves the
//!   process;
//! - `OUT_*_POINTER {size, token}` is *recorded* against the proxy message
//!   id (for copy-back when the paired response arrives) and travels as
//!   its `OUT_*_SIZE` form;
//! - `OUT_*_RESPONSE {size}` in a response pops the next recorded buffer
//!   and emits the actual payload bytes;
//! - reference tags pass through the event-context tables so only stable
//!   wire tokens are emitted.
//!
//! Everything else is copied verbatim. When the outer break is reached,
//! accumulated file-stream metadata is written between the last item and
//! the break so the receiver can associate the stream with the message.
//!
//! The sender never suspends: the local payload is complete in memory, and
//! the produced frame is handed to the link whole. A failed link send is
//! handled by the supervisor, not here.

use crate::error::ProxyError;
use crate::events::{ClientContext, EventContexts};
use crate::fabric::{BufferToken, IpcFabric, SessionHandle};
use crate::tracker::OutParamRec;
use crate::wire::cbor::{self, ItemKind};
use crate::wire::{CommonHeader, ConnectBody, SemanticTag, StreamFlags, IPC_MSG_ID_SIZE};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Why this payload is being sent; selects the reference-translation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPurpose {
    /// Host side forwarding a local client's request.
    ClientRequest,
    /// Consumer side forwarding the real server's completion.
    ServerResponse,
    /// Consumer side forwarding the real server's async event.
    AsyncEvent,
}

/// Everything the repacker needs besides the payload bytes.
pub struct SendCtx<'a> {
    pub purpose: SendPurpose,
    pub system: &'a str,
    pub service_id: u32,
    /// The requesting client's session (request purpose only); owns any
    /// event context minted here.
    pub session: Option<SessionHandle>,
    pub fabric: &'a mut dyn IpcFabric,
    pub contexts: &'a mut EventContexts,
    /// Receiver-side scratch buffers of the paired request, popped by
    /// `OUT_*_RESPONSE` items (response purpose only).
    pub response_buffers: Option<&'a mut VecDeque<BufferToken>>,
    /// Server event-context token of the paired request (response purpose
    /// only); completed by an `ASYNC_HANDLER_REFERENCE` item.
    pub server_ctx: Option<u32>,
    /// File-stream metadata to append before the closing break.
    pub metadata: Option<(u16, StreamFlags)>,

    /// Out: optimized output parameters recorded while encoding.
    pub out_params: Vec<OutParamRec>,
    /// Out: client event-context token minted while encoding.
    pub minted_context: Option<u32>,
    /// Out: the local message id read from the payload head.
    pub ipc_msg_id: u32,
}

impl<'a> SendCtx<'a> {
    pub fn new(
        purpose: SendPurpose,
        system: &'a str,
        service_id: u32,
        fabric: &'a mut dyn IpcFabric,
        contexts: &'a mut EventContexts,
    ) -> Self {
        Self {
            purpose,
            system,
            service_id,
            session: None,
            fabric,
            contexts,
            response_buffers: None,
            server_ctx: None,
            metadata: None,
            out_params: Vec::new(),
            minted_context: None,
            ipc_msg_id: 0,
        }
    }
}

/// Send-side repacker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Normal,
    ExpectReference(SemanticTag),
    ExpectOptStrHeader(SemanticTag),
    ExpectOptStrSize(SemanticTag),
    ExpectOptStrPointer(SemanticTag),
    ExpectOptBstrResponseSize(SemanticTag),
}

/// Compose a complete fixed-layout frame.
pub fn fixed_frame(header: &CommonHeader, body: &ConnectBody) -> Vec<u8> {
    let mut frame = Vec::with_capacity(crate::wire::COMMON_HEADER_SIZE + crate::wire::FIXED_BODY_SIZE);
    frame.extend_from_slice(&header.to_wire());
    frame.extend_from_slice(&body.to_wire());
    frame
}

/// Compose a complete FILESTREAM_MESSAGE frame.
pub fn filestream_frame(
    header: &CommonHeader,
    stream_id: u16,
    flags: StreamFlags,
    requested: Option<u64>,
    payload: Option<&[u8]>,
) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&header.to_wire());
    cbor::emit_array_begin(&mut frame);
    cbor::emit_tag(&mut frame, SemanticTag::FilestreamId);
    cbor::emit_uint(&mut frame, u64::from(stream_id));
    cbor::emit_tag(&mut frame, SemanticTag::FilestreamFlag);
    cbor::emit_uint(&mut frame, u64::from(flags.bits()));
    if let Some(n) = requested {
        cbor::emit_tag(&mut frame, SemanticTag::FilestreamRequestSize);
        cbor::emit_uint(&mut frame, n);
    }
    if let Some(data) = payload {
        cbor::emit_bytes(&mut frame, data);
    }
    cbor::emit_break(&mut frame);
    frame
}

/// Engine-generated SERVER_RESPONSE body carrying an error code (wire
/// form). Used for no-memory answers and disconnect errors on the wire.
pub fn error_response_body(local_msg_id: u32, code: i32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&local_msg_id.to_be_bytes());
    cbor::emit_array_begin(&mut body);
    cbor::emit_int(&mut body, i64::from(code));
    cbor::emit_break(&mut body);
    body
}

/// Engine-generated local completion payload carrying an error code (the
/// form a delivered response takes after reconstruction).
pub fn local_error_payload(local_msg_id: u32, code: i32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&local_msg_id.to_be_bytes());
    cbor::emit_int(&mut payload, i64::from(code));
    payload.push(cbor::BREAK);
    payload
}

/// Repack a local IPC payload into a wire body.
///
/// The local payload is `[id][items…][break]`; the wire body mirrors it
/// with the outer indefinite array made explicit:
/// `[id][0x9F][items…][metadata][break]`.
pub fn encode_ipc_body(payload: &[u8], ctx: &mut SendCtx<'_>) -> Result<Vec<u8>, ProxyError> {
    if payload.len() < IPC_MSG_ID_SIZE {
        return Err(ProxyError::format("ipc payload shorter than its id"));
    }
    ctx.ipc_msg_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

    let mut out = Vec::with_capacity(payload.len() + 16);
    out.extend_from_slice(&payload[..IPC_MSG_ID_SIZE]);
    cbor::emit_array_begin(&mut out);

    let mut pos = IPC_MSG_ID_SIZE;
    let mut depth: u32 = 1;
    let mut state = SendState::Normal;
    // Declared length of the optimized string being walked.
    let mut opt_len: u64 = 0;
    // Declared capacity of the optimized buffer being walked.
    let mut opt_size: u64 = 0;

    while pos < payload.len() {
        let first = payload[pos];
        let extra = cbor::extra_bytes(first)?;
        if pos + 1 + extra > payload.len() {
            return Err(ProxyError::format("truncated item header in ipc payload"));
        }
        let item = cbor::decode_item(&payload[pos..pos + 1 + extra])?;
        pos += 1 + extra;

        match state {
            SendState::Normal => match item.kind {
                ItemKind::PosInt | ItemKind::NegInt | ItemKind::Boolean | ItemKind::Double => {
                    out.extend_from_slice(item.header_bytes());
                }
                ItemKind::ByteString | ItemKind::TextString => {
                    let len = item.payload_len();
                    if pos + len > payload.len() {
                        return Err(ProxyError::format("truncated string in ipc payload"));
                    }
                    out.extend_from_slice(item.header_bytes());
                    out.extend_from_slice(&payload[pos..pos + len]);
                    pos += len;
                }
                ItemKind::Array => {
                    if item.indefinite {
                        depth += 1;
                    }
                    out.extend_from_slice(item.header_bytes());
                }
                ItemKind::Break => {
                    depth -= 1;
                    if depth == 0 {
                        if let Some((stream_id, flags)) = ctx.metadata.take() {
                            trace!(stream_id, "appending file-stream metadata tail");
                            cbor::emit_tag(&mut out, SemanticTag::FilestreamId);
                            cbor::emit_uint(&mut out, u64::from(stream_id));
                            cbor::emit_tag(&mut out, SemanticTag::FilestreamFlag);
                            cbor::emit_uint(&mut out, u64::from(flags.bits()));
                        }
                        cbor::emit_break(&mut out);
                        if pos != payload.len() {
                            return Err(ProxyError::format(
                                "trailing bytes after ipc payload break",
                            ));
                        }
                        return Ok(out);
                    }
                    cbor::emit_break(&mut out);
                }
                ItemKind::Tag => {
                    let tag = SemanticTag::from_value(item.value).ok_or_else(|| {
                        ProxyError::format(format!("unknown tag {} in local payload", item.value))
                    })?;
                    state = match tag {
                        SemanticTag::Reference
                        | SemanticTag::ContextPtrReference
                        | SemanticTag::AsyncHandlerReference => SendState::ExpectReference(tag),
                        SemanticTag::InStringPointer
                        | SemanticTag::InByteStrPointer
                        | SemanticTag::OutStringPointer
                        | SemanticTag::OutByteStrPointer => SendState::ExpectOptStrHeader(tag),
                        SemanticTag::OutStringResponse | SemanticTag::OutByteStrResponse => {
                            SendState::ExpectOptBstrResponseSize(tag)
                        }
                        // Wire-only metadata tags never originate locally.
                        SemanticTag::OutStringSize
                        | SemanticTag::OutByteStrSize
                        | SemanticTag::FilestreamId
                        | SemanticTag::FilestreamFlag
                        | SemanticTag::FilestreamRequestSize => {
                            return Err(ProxyError::format(format!(
                                "wire-only tag {} in local payload",
                                item.value
                            )))
                        }
                    };
                }
                ItemKind::Invalid => {
                    return Err(ProxyError::format("unsupported item in ipc payload"))
                }
            },

            SendState::ExpectReference(tag) => {
                if item.kind != ItemKind::PosInt {
                    return Err(ProxyError::format("reference tag not followed by integer"));
                }
                let translated = repack_outgoing_context(tag, item.value, ctx)?;
                cbor::emit_tag(&mut out, tag);
                cbor::emit_uint(&mut out, translated);
                state = SendState::Normal;
            }

            SendState::ExpectOptStrHeader(tag) => {
                // Header only; the declared bytes are not present locally.
                match item.kind {
                    ItemKind::ByteString | ItemKind::TextString => {
                        opt_len = item.value;
                        state = SendState::ExpectOptStrSize(tag);
                    }
                    _ => {
                        return Err(ProxyError::format(
                            "optimized pointer tag not followed by string header",
                        ))
                    }
                }
            }

            SendState::ExpectOptStrSize(tag) => {
                if item.kind != ItemKind::PosInt {
                    return Err(ProxyError::format("optimized size is not an integer"));
                }
                opt_size = item.value;
                state = SendState::ExpectOptStrPointer(tag);
            }

            SendState::ExpectOptStrPointer(tag) => {
                if item.kind != ItemKind::PosInt {
                    return Err(ProxyError::format("optimized pointer is not an integer"));
                }
                let token = BufferToken(item.value as u32);
                match tag {
                    SemanticTag::InStringPointer | SemanticTag::InByteStrPointer => {
                        let data = ctx.fabric.buffer(token).ok_or_else(|| {
                            ProxyError::Fabric(format!("unresolved buffer token {}", item.value))
                        })?;
                        let take = (opt_len as usize).min(data.len());
                        if tag == SemanticTag::InStringPointer {
                            let text = std::str::from_utf8(&data[..take]).map_err(|_| {
                                ProxyError::format("optimized input string is not utf-8")
                            })?;
                            cbor::emit_text(&mut out, text);
                        } else {
                            cbor::emit_bytes(&mut out, &data[..take]);
                        }
                    }
                    SemanticTag::OutStringPointer | SemanticTag::OutByteStrPointer => {
                        let text = tag == SemanticTag::OutStringPointer;
                        ctx.out_params.push(OutParamRec {
                            token,
                            capacity: opt_size,
                            text,
                        });
                        cbor::emit_tag(
                            &mut out,
                            if text {
                                SemanticTag::OutStringSize
                            } else {
                                SemanticTag::OutByteStrSize
                            },
                        );
                        cbor::emit_uint(&mut out, opt_size);
                    }
                    _ => unreachable!("state only entered for pointer tags"),
                }
                state = SendState::Normal;
            }

            SendState::ExpectOptBstrResponseSize(tag) => {
                if item.kind != ItemKind::PosInt {
                    return Err(ProxyError::format("response size is not an integer"));
                }
                let actual = item.value as usize;
                let buffers = ctx.response_buffers.as_deref_mut().ok_or_else(|| {
                    ProxyError::format("response item outside a response message")
                })?;
                let token = buffers.pop_front().ok_or_else(|| {
                    ProxyError::format("more response items than recorded buffers")
                })?;
                let data = ctx.fabric.buffer(token).ok_or_else(|| {
                    ProxyError::Fabric(format!("unresolved buffer token {}", token.0))
                })?;
                let take = actual.min(data.len());
                cbor::emit_tag(&mut out, tag);
                if tag == SemanticTag::OutStringResponse {
                    let text = std::str::from_utf8(&data[..take])
                        .map_err(|_| ProxyError::format("response string is not utf-8"))?;
                    cbor::emit_text(&mut out, text);
                } else {
                    cbor::emit_bytes(&mut out, &data[..take]);
                }
                state = SendState::Normal;
            }
        }
    }

    Err(ProxyError::format("ipc payload ended before its break"))
}

/// Translate a locally held reference value into its wire token.
///
/// The raw local value never leaves the process; what crosses the wire is
/// either a freshly minted table token or a token learned from the peer.
fn repack_outgoing_context(
    tag: SemanticTag,
    value: u64,
    ctx: &mut SendCtx<'_>,
) -> Result<u64, ProxyError> {
    match (ctx.purpose, tag) {
        // Generic references are endpoint-scoped cookies; both ends agree
        // on their meaning, the proxy only carries them.
        (_, SemanticTag::Reference) => Ok(value),

        // Add-handler registration: mint the client-side record.
        (SendPurpose::ClientRequest, SemanticTag::ContextPtrReference) => {
            let session = ctx
                .session
                .ok_or_else(|| ProxyError::format("context reference outside a session"))?;
            let token = ctx.contexts.mint_client(ClientContext {
                system: ctx.system.to_owned(),
                service_id: ctx.service_id,
                session,
                original_context: value,
                handler: None,
            })?;
            debug!(token, "minted client event context");
            ctx.minted_context = Some(token);
            Ok(u64::from(token))
        }

        // Remove-handler: the local value is our own client token; what
        // the peer needs is the handler token it gave us. The record is
        // released here; remove-handler is one of its release points.
        (SendPurpose::ClientRequest, SemanticTag::AsyncHandlerReference) => {
            let token = value as u32;
            let rec = ctx
                .contexts
                .release_client(token)
                .ok_or_else(|| ProxyError::format("stale async handler reference"))?;
            rec.handler
                .ok_or_else(|| ProxyError::format("handler reference before registration completed"))
        }

        // Registration response from the real server: remember the local
        // handler value and put our server-side token on the wire.
        (SendPurpose::ServerResponse, SemanticTag::AsyncHandlerReference) => {
            let token = ctx
                .server_ctx
                .ok_or_else(|| ProxyError::format("handler reference without a registration"))?;
            let rec = ctx
                .contexts
                .server_mut(token)
                .ok_or_else(|| ProxyError::format("stale server event context"))?;
            rec.local_handler = Some(value);
            Ok(u64::from(token))
        }

        // Async event from the real server: the context it echoes is our
        // server-side token; the peer wants its own wire context back.
        (SendPurpose::AsyncEvent, SemanticTag::ContextPtrReference)
        | (SendPurpose::AsyncEvent, SemanticTag::AsyncHandlerReference) => {
            let rec = ctx
                .contexts
                .server(value as u32)
                .ok_or_else(|| ProxyError::format("event for unknown context"))?;
            Ok(rec.wire_context)
        }

        (purpose, tag) => Err(ProxyError::format(format!(
            "tag {tag:?} is not valid in a {purpose:?} payload"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::LoopbackFabric;
    use crate::limits::EVENT_HANDLERS_MAX;
    use crate::wire::MessageType;

    fn harness() -> (Box<dyn IpcFabric>, EventContexts) {
        let (fabric, _handle) = LoopbackFabric::new();
        (Box::new(fabric), EventContexts::new(EVENT_HANDLERS_MAX))
    }

    /// Local payload builder: `[id][items…][break]`.
    fn local_payload(id: u32, items: &[u8]) -> Vec<u8> {
        let mut payload = id.to_be_bytes().to_vec();
        payload.extend_from_slice(items);
        payload.push(cbor::BREAK);
        payload
    }

    #[test]
    fn plain_body_gains_outer_array_only() {
        let (mut fabric, mut contexts) = harness();
        let mut ctx = SendCtx::new(
            SendPurpose::ClientRequest,
            "B",
            7,
            fabric.as_mut(),
            &mut contexts,
        );
        // Method id 0xA2, no arguments.
        let payload = local_payload(0xA2, &[]);
        let body = encode_ipc_body(&payload, &mut ctx).unwrap();
        assert_eq!(body, vec![0, 0, 0, 0xA2, 0x9F, 0xFF]);
        assert_eq!(ctx.ipc_msg_id, 0xA2);
    }

    #[test]
    fn verbatim_items_round_trip_byte_exact() {
        let (mut fabric, mut contexts) = harness();
        let mut ctx = SendCtx::new(
            SendPurpose::ClientRequest,
            "B",
            7,
            fabric.as_mut(),
            &mut contexts,
        );
        let mut items = Vec::new();
        cbor::emit_uint(&mut items, 300);
        cbor::emit_int(&mut items, -5);
        cbor::emit_text(&mut items, "abc");
        cbor::emit_bytes(&mut items, &[1, 2]);
        let payload = local_payload(1, &items);
        let body = encode_ipc_body(&payload, &mut ctx).unwrap();
        // id, open, verbatim items, close.
        let mut expected = vec![0, 0, 0, 1, 0x9F];
        expected.extend_from_slice(&items);
        expected.push(0xFF);
        assert_eq!(body, expected);
    }

    #[test]
    fn in_pointer_expands_to_wire_string() {
        let (fabric, handle) = LoopbackFabric::new();
        let mut fabric: Box<dyn IpcFabric> = Box::new(fabric);
        let mut contexts = EventContexts::new(EVENT_HANDLERS_MAX);
        let token = handle.alloc_buffer(b"hello".to_vec());

        let mut items = Vec::new();
        cbor::emit_tag(&mut items, SemanticTag::InStringPointer);
        items.push(0x65); // text header declaring 5 bytes; payload absent locally
        cbor::emit_uint(&mut items, 5); // size
        cbor::emit_uint(&mut items, u64::from(token.0)); // pointer token

        let mut ctx = SendCtx::new(
            SendPurpose::ClientRequest,
            "B",
            7,
            fabric.as_mut(),
            &mut contexts,
        );
        let payload = local_payload(2, &items);
        let body = encode_ipc_body(&payload, &mut ctx).unwrap();

        let mut expected_str = Vec::new();
        cbor::emit_text(&mut expected_str, "hello");
        assert!(body
            .windows(expected_str.len())
            .any(|w| w == expected_str.as_slice()));
    }

    #[test]
    fn out_pointer_travels_as_size_and_is_recorded() {
        let (fabric, handle) = LoopbackFabric::new();
        let mut fabric: Box<dyn IpcFabric> = Box::new(fabric);
        let mut contexts = EventContexts::new(EVENT_HANDLERS_MAX);
        let token = handle.alloc_buffer(vec![0; 512]);

        let mut items = Vec::new();
        cbor::emit_tag(&mut items, SemanticTag::OutByteStrPointer);
        items.push(0x40); // zero-length bstr header
        cbor::emit_uint(&mut items, 512); // capacity
        cbor::emit_uint(&mut items, u64::from(token.0));

        let mut ctx = SendCtx::new(
            SendPurpose::ClientRequest,
            "B",
            7,
            fabric.as_mut(),
            &mut contexts,
        );
        let payload = local_payload(3, &items);
        let body = encode_ipc_body(&payload, &mut ctx).unwrap();

        assert_eq!(ctx.out_params.len(), 1);
        assert_eq!(ctx.out_params[0].capacity, 512);
        // The wire carries OUT_BYTE_STR_SIZE, not the token.
        let mut expected = Vec::new();
        cbor::emit_tag(&mut expected, SemanticTag::OutByteStrSize);
        cbor::emit_uint(&mut expected, 512);
        assert!(body.windows(expected.len()).any(|w| w == expected.as_slice()));
    }

    #[test]
    fn context_registration_mints_token() {
        let (mut fabric, mut contexts) = harness();
        let mut ctx = SendCtx::new(
            SendPurpose::ClientRequest,
            "B",
            7,
            fabric.as_mut(),
            &mut contexts,
        );
        ctx.session = Some(SessionHandle(4));

        let mut items = Vec::new();
        cbor::emit_tag(&mut items, SemanticTag::ContextPtrReference);
        cbor::emit_uint(&mut items, 0xCAFE);
        let payload = local_payload(4, &items);
        let body = encode_ipc_body(&payload, &mut ctx).unwrap();

        let token = ctx.minted_context.expect("context minted");
        let rec = contexts.client(token).unwrap();
        assert_eq!(rec.original_context, 0xCAFE);
        assert_eq!(rec.session, SessionHandle(4));
        // The original cookie must not appear on the wire.
        let mut cookie = Vec::new();
        cbor::emit_uint(&mut cookie, 0xCAFE);
        assert!(!body.windows(cookie.len()).any(|w| w == cookie.as_slice()));
    }

    #[test]
    fn metadata_tail_sits_before_the_break() {
        let (mut fabric, mut contexts) = harness();
        let mut ctx = SendCtx::new(
            SendPurpose::ClientRequest,
            "B",
            7,
            fabric.as_mut(),
            &mut contexts,
        );
        ctx.metadata = Some((3, StreamFlags::OWNER | StreamFlags::INIT_OUTGOING));
        let payload = local_payload(5, &[0x01]);
        let body = encode_ipc_body(&payload, &mut ctx).unwrap();
        assert_eq!(*body.last().unwrap(), 0xFF);
        // Tag 18 then the id, tag 19 then the flags, just before the break.
        let tail = &body[body.len() - 5..body.len() - 1];
        assert_eq!(tail[0], 0xC0 | 18);
        assert_eq!(tail[1], 3);
        assert_eq!(tail[2], 0xC0 | 19);
        assert_eq!(
            u16::from(tail[3]),
            (StreamFlags::OWNER | StreamFlags::INIT_OUTGOING).bits()
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let (mut fabric, mut contexts) = harness();
        let mut ctx = SendCtx::new(
            SendPurpose::ClientRequest,
            "B",
            7,
            fabric.as_mut(),
            &mut contexts,
        );
        // Break missing.
        let payload = 9u32.to_be_bytes().to_vec();
        assert!(encode_ipc_body(&payload, &mut ctx).is_err());
    }

    #[test]
    fn filestream_frame_layout() {
        let header = CommonHeader {
            id: 11,
            service_id: 7,
            msg_type: MessageType::FilestreamMessage,
        };
        let frame = filestream_frame(
            &header,
            2,
            StreamFlags::OWNER | StreamFlags::DATA_PACKET,
            None,
            Some(&[0xAA, 0xBB]),
        );
        assert_eq!(frame[8], MessageType::FilestreamMessage as u8);
        assert_eq!(frame[9], 0x9F);
        assert_eq!(*frame.last().unwrap(), 0xFF);
        // Payload bytes are present as a CBOR byte string.
        assert!(frame.windows(3).any(|w| w == [0x42, 0xAA, 0xBB]));
    }

    #[test]
    fn error_bodies_carry_the_code() {
        let body = error_response_body(0xA2, crate::wire::service_code::NO_MEMORY);
        assert_eq!(&body[..4], &[0, 0, 0, 0xA2]);
        assert_eq!(body[4], 0x9F);
        assert_eq!(*body.last().unwrap(), 0xFF);

        let local = local_error_payload(0xA2, crate::wire::service_code::UNAVAILABLE);
        assert_eq!(&local[..4], &[0, 0, 0, 0xA2]);
        assert_eq!(*local.last().unwrap(), 0xFF);
    }
}
