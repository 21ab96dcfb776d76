//! # Wire Format Module
//!
//! This module defines the byte-level wire format spoken between two RPC
//! proxies, independent of any particular transport link. It is the single
//! place where on-the-wire layout decisions live; the receiver and sender
//! state machines consume the definitions here and never hand-roll layout.
//!
//! ## Frame Layout
//!
//! Every proxy message is a fixed *common header* followed by a
//! type-specific *body*:
//!
//! ```text
//!   +---+---+---+---+---+---+---+---+---+
//!   | proxy message id (u32 BE)         |
//!   +---+---+---+---+---+---+---+---+---+
//!   | service id (u32 BE)               |
//!   +---+---+---+---+---+---+---+---+---+
//!   | type (u8) |  body ...             |
//!   +---+---+---+---+---+---+---+---+---+
//! ```
//!
//! Bodies come in two classes:
//!
//! - **Fixed-layout** (connect/disconnect/keep-alive): a packed struct of
//!   NUL-padded name fields plus a big-endian `service_code`. See
//!   [`ConnectBody`].
//! - **Variable-length** (client request, server response, async event,
//!   file-stream message): a raw 4-byte local message id (IPC-bearing types
//!   only) followed by an indefinite-length CBOR array of items, closed by
//!   a break marker. See [`cbor`] for the item-level codec.
//!
//! ## Semantic Tags
//!
//! Items that need cross-node translation (references, optimized
//! parameters, file-stream metadata) are prefixed by single-byte CBOR
//! semantic tags from [`SemanticTag`]. The numeric values are a fixed
//! protocol constant agreed by both peers; tags marked *local-only* never
//! appear on the wire in either direction.

pub mod cbor;

use crate::error::ProxyError;

/// Size in bytes of the common header present on every proxy message.
pub const COMMON_HEADER_SIZE: usize = 9;

/// Maximum length of a system name, including NUL padding.
pub const SYSTEM_NAME_SIZE: usize = 32;

/// Maximum length of a service name, including NUL padding.
pub const SERVICE_NAME_SIZE: usize = 64;

/// Maximum length of a protocol id string, including NUL padding.
pub const PROTOCOL_ID_SIZE: usize = 64;

/// Size in bytes of the fixed-layout body used by connect, disconnect and
/// keep-alive messages.
pub const FIXED_BODY_SIZE: usize = SYSTEM_NAME_SIZE + SERVICE_NAME_SIZE + PROTOCOL_ID_SIZE + 4;

/// Size in bytes of the raw (non-CBOR) local message id that opens every
/// IPC-bearing body.
pub const IPC_MSG_ID_SIZE: usize = 4;

/// Service-code values carried in [`ConnectBody::service_code`] and in
/// engine-generated error responses.
pub mod service_code {
    /// The operation succeeded.
    pub const OK: i32 = 0;
    /// No matching local binding for the requested service.
    pub const UNAVAILABLE: i32 = -2;
    /// The protocol id offered by the peer does not match the local binding.
    pub const FORMAT_ERROR: i32 = -12;
    /// A bounded table was full; the request was answered, not dropped.
    pub const NO_MEMORY: i32 = -23;
}

/// The nine proxy message types.
///
/// The discriminant values are the wire encoding; anything outside `1..=9`
/// received in a header is a format error that tears the link down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Ask the peer to bind a service (carries a fixed-layout body).
    ConnectServiceRequest = 1,
    /// Result of a bind attempt; `service_code` carries the outcome.
    ConnectServiceResponse = 2,
    /// Tear down a bound service on both sides.
    DisconnectService = 3,
    /// A forwarded local client request (IPC-bearing body).
    ClientRequest = 4,
    /// The paired response to a [`MessageType::ClientRequest`].
    ServerResponse = 5,
    /// Link health probe.
    KeepaliveRequest = 6,
    /// Answer to a [`MessageType::KeepaliveRequest`].
    KeepaliveResponse = 7,
    /// An asynchronous server event routed by event-context token.
    ServerAsyncEvent = 8,
    /// In-band file-stream traffic (data, requests, teardown).
    FilestreamMessage = 9,
}

impl MessageType {
    /// Decode a wire type byte, rejecting anything outside the defined set.
    pub fn from_wire(value: u8) -> Result<Self, ProxyError> {
        match value {
            1 => Ok(MessageType::ConnectServiceRequest),
            2 => Ok(MessageType::ConnectServiceResponse),
            3 => Ok(MessageType::DisconnectService),
            4 => Ok(MessageType::ClientRequest),
            5 => Ok(MessageType::ServerResponse),
            6 => Ok(MessageType::KeepaliveRequest),
            7 => Ok(MessageType::KeepaliveResponse),
            8 => Ok(MessageType::ServerAsyncEvent),
            9 => Ok(MessageType::FilestreamMessage),
            other => Err(ProxyError::format(format!(
                "unknown proxy message type {other}"
            ))),
        }
    }

    /// True for message types whose body is CBOR-encoded and variable in
    /// length; false for fixed-layout bodies.
    pub fn is_variable_length(self) -> bool {
        matches!(
            self,
            MessageType::ClientRequest
                | MessageType::ServerResponse
                | MessageType::ServerAsyncEvent
                | MessageType::FilestreamMessage
        )
    }

    /// True for the three types that carry a reconstructed local IPC
    /// message (request, response, async event).
    pub fn is_ipc_bearing(self) -> bool {
        matches!(
            self,
            MessageType::ClientRequest | MessageType::ServerResponse | MessageType::ServerAsyncEvent
        )
    }
}

/// The common header present on every proxy message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    /// Proxy message id; correlates a request with its response.
    pub id: u32,
    /// Wire token naming the bound service this message belongs to.
    pub service_id: u32,
    /// Message type.
    pub msg_type: MessageType,
}

impl CommonHeader {
    /// Serialize the header into its 9-byte big-endian wire form.
    pub fn to_wire(&self) -> [u8; COMMON_HEADER_SIZE] {
        let mut out = [0u8; COMMON_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.id.to_be_bytes());
        out[4..8].copy_from_slice(&self.service_id.to_be_bytes());
        out[8] = self.msg_type as u8;
        out
    }

    /// Parse a header from its wire form, byte-swapping from big-endian
    /// and validating the type byte.
    pub fn from_wire(raw: &[u8; COMMON_HEADER_SIZE]) -> Result<Self, ProxyError> {
        let id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let service_id = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let msg_type = MessageType::from_wire(raw[8])?;
        Ok(CommonHeader {
            id,
            service_id,
            msg_type,
        })
    }
}

/// The fixed-layout body shared by connect-service request/response,
/// disconnect-service, and the two keep-alive types.
///
/// All three string fields are NUL-padded to their maximum size on the
/// wire; `service_code` is big-endian. Keep-alives carry the probing
/// system's name in `system_name` and leave the service fields empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectBody {
    pub system_name: String,
    pub service_name: String,
    pub protocol_id: String,
    pub service_code: i32,
}

/// Copy `s` into a NUL-padded fixed field, truncating to `len - 1` bytes so
/// the field always terminates.
fn pack_name(out: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(out.len() - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    for b in out[n..].iter_mut() {
        *b = 0;
    }
}

/// Read a NUL-padded fixed field back into an owned string. Non-UTF-8
/// content is a format error (names originate from configuration and are
/// always ASCII in practice).
fn unpack_name(raw: &[u8]) -> Result<String, ProxyError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| ProxyError::format("non-utf8 name field in fixed body"))
}

impl ConnectBody {
    /// Serialize into the 164-byte fixed wire layout.
    pub fn to_wire(&self) -> [u8; FIXED_BODY_SIZE] {
        let mut out = [0u8; FIXED_BODY_SIZE];
        let mut off = 0;
        pack_name(&mut out[off..off + SYSTEM_NAME_SIZE], &self.system_name);
        off += SYSTEM_NAME_SIZE;
        pack_name(&mut out[off..off + SERVICE_NAME_SIZE], &self.service_name);
        off += SERVICE_NAME_SIZE;
        pack_name(&mut out[off..off + PROTOCOL_ID_SIZE], &self.protocol_id);
        off += PROTOCOL_ID_SIZE;
        out[off..off + 4].copy_from_slice(&self.service_code.to_be_bytes());
        out
    }

    /// Parse the fixed wire layout produced by [`ConnectBody::to_wire`].
    pub fn from_wire(raw: &[u8]) -> Result<Self, ProxyError> {
        if raw.len() != FIXED_BODY_SIZE {
            return Err(ProxyError::format(format!(
                "fixed body is {} bytes, expected {FIXED_BODY_SIZE}",
                raw.len()
            )));
        }
        let mut off = 0;
        let system_name = unpack_name(&raw[off..off + SYSTEM_NAME_SIZE])?;
        off += SYSTEM_NAME_SIZE;
        let service_name = unpack_name(&raw[off..off + SERVICE_NAME_SIZE])?;
        off += SERVICE_NAME_SIZE;
        let protocol_id = unpack_name(&raw[off..off + PROTOCOL_ID_SIZE])?;
        off += PROTOCOL_ID_SIZE;
        let service_code =
            i32::from_be_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        Ok(ConnectBody {
            system_name,
            service_name,
            protocol_id,
            service_code,
        })
    }
}

/// Semantic tags understood by the repacker.
///
/// Values are protocol constants in the single-byte CBOR tag range and must
/// match on both peers. Tags 10–13 are *local-only*: they mark the
/// `{size, buffer-token}` compaction used within one node and are never
/// valid on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SemanticTag {
    /// Generic opaque reference; followed by an unsigned integer token.
    Reference = 7,
    /// Client-side context cookie for an async-handler registration.
    ContextPtrReference = 8,
    /// Server-side handle for a previously registered async handler.
    AsyncHandlerReference = 9,
    /// Local-only optimized textual input `{size, token}`.
    InStringPointer = 10,
    /// Local-only optimized byte input `{size, token}`.
    InByteStrPointer = 11,
    /// Local-only optimized textual output buffer `{size, token}`.
    OutStringPointer = 12,
    /// Local-only optimized byte output buffer `{size, token}`.
    OutByteStrPointer = 13,
    /// Capacity of an output text buffer, sent instead of the pointer.
    OutStringSize = 14,
    /// Capacity of an output byte buffer, sent instead of the pointer.
    OutByteStrSize = 15,
    /// Marks an actual returned string in a response.
    OutStringResponse = 16,
    /// Marks an actual returned byte string in a response.
    OutByteStrResponse = 17,
    /// 16-bit file-stream identifier (message metadata).
    FilestreamId = 18,
    /// 16-bit file-stream flag bitfield (message metadata).
    FilestreamFlag = 19,
    /// Requested byte count for the next stream chunk.
    FilestreamRequestSize = 20,
}

/// Dispatch class of the last-seen semantic tag. The receiver's dispatch
/// table is keyed by `(TagClass, item type)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// No tag pending, or a tag that needs no value-level action
    /// (`OUT_*_RESPONSE`).
    None,
    /// `OUT_STRING_SIZE` / `OUT_BYTE_STR_SIZE`.
    OutputSize,
    /// `FILESTREAM_ID` / `FILESTREAM_FLAG` / `FILESTREAM_REQUEST_SIZE`.
    Filestream,
    /// `REFERENCE` / `CONTEXT_PTR_REFERENCE` / `ASYNC_HANDLER_REFERENCE`.
    Reference,
}

impl SemanticTag {
    /// Decode a tag value seen on the receive path. Local-only tags and
    /// unknown values are rejected: any of them arriving from a peer is a
    /// peer-fatal format error.
    pub fn from_wire(value: u64) -> Result<Self, ProxyError> {
        let tag = Self::from_value(value)
            .ok_or_else(|| ProxyError::format(format!("unknown semantic tag {value}")))?;
        if tag.is_local_only() {
            return Err(ProxyError::format(format!(
                "local-only tag {value} received on the wire"
            )));
        }
        Ok(tag)
    }

    /// Decode any known tag value, including local-only ones. Used on the
    /// send path, which reads locally produced payloads.
    pub fn from_value(value: u64) -> Option<Self> {
        Some(match value {
            7 => SemanticTag::Reference,
            8 => SemanticTag::ContextPtrReference,
            9 => SemanticTag::AsyncHandlerReference,
            10 => SemanticTag::InStringPointer,
            11 => SemanticTag::InByteStrPointer,
            12 => SemanticTag::OutStringPointer,
            13 => SemanticTag::OutByteStrPointer,
            14 => SemanticTag::OutStringSize,
            15 => SemanticTag::OutByteStrSize,
            16 => SemanticTag::OutStringResponse,
            17 => SemanticTag::OutByteStrResponse,
            18 => SemanticTag::FilestreamId,
            19 => SemanticTag::FilestreamFlag,
            20 => SemanticTag::FilestreamRequestSize,
            _ => return None,
        })
    }

    /// True for the `{size, token}` compaction tags that never travel the
    /// wire.
    pub fn is_local_only(self) -> bool {
        matches!(
            self,
            SemanticTag::InStringPointer
                | SemanticTag::InByteStrPointer
                | SemanticTag::OutStringPointer
                | SemanticTag::OutByteStrPointer
        )
    }

    /// Dispatch class used by the receiver's `(tag, item type)` fold.
    pub fn class(self) -> TagClass {
        match self {
            SemanticTag::OutStringResponse | SemanticTag::OutByteStrResponse => TagClass::None,
            SemanticTag::OutStringSize | SemanticTag::OutByteStrSize => TagClass::OutputSize,
            SemanticTag::FilestreamId
            | SemanticTag::FilestreamFlag
            | SemanticTag::FilestreamRequestSize => TagClass::Filestream,
            SemanticTag::Reference
            | SemanticTag::ContextPtrReference
            | SemanticTag::AsyncHandlerReference => TagClass::Reference,
            // Local-only tags are filtered out by from_wire before
            // classification; on the send path they drive dedicated states.
            SemanticTag::InStringPointer
            | SemanticTag::InByteStrPointer
            | SemanticTag::OutStringPointer
            | SemanticTag::OutByteStrPointer => TagClass::None,
        }
    }
}

bitflags::bitflags! {
    /// File-stream flag bitfield carried under [`SemanticTag::FilestreamFlag`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u16 {
        /// Set in the sender's view: *we* own the stream.
        const OWNER         = 1 << 0;
        /// Initialization: the sender's direction is incoming.
        const INIT_INCOMING = 1 << 1;
        /// Initialization: the sender's direction is outgoing.
        const INIT_OUTGOING = 1 << 2;
        /// The outgoing side reached end-of-file.
        const EOF           = 1 << 3;
        /// Forcibly close: the local user-facing descriptor is gone.
        const FORCE_CLOSE   = 1 << 4;
        /// The message carries a byte-string payload.
        const DATA_PACKET   = 1 << 5;
        /// The message carries a requested-size integer.
        const REQUEST_DATA  = 1 << 6;
        /// The peer's local descriptor is to be non-blocking.
        const NONBLOCK      = 1 << 7;
        /// I/O error at the origin.
        const IOERROR       = 1 << 8;
    }
}

impl StreamFlags {
    /// Validate an inbound flag combination.
    ///
    /// Inconsistent combinations (data and request in the same message,
    /// both init directions at once, unknown bits) are rejected; the
    /// caller drops the stream with a FORCE_CLOSE to the peer.
    pub fn validate(self) -> Result<(), ProxyError> {
        if self.contains(StreamFlags::DATA_PACKET) && self.contains(StreamFlags::REQUEST_DATA) {
            return Err(ProxyError::format(
                "file-stream flags carry both DATA_PACKET and REQUEST_DATA",
            ));
        }
        if self.contains(StreamFlags::INIT_INCOMING) && self.contains(StreamFlags::INIT_OUTGOING) {
            return Err(ProxyError::format(
                "file-stream flags carry both init directions",
            ));
        }
        Ok(())
    }
}
