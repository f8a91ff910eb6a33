//! Wire envelope types: messages, containers, gzip wrapping, RPC results.
//!
//! A decrypted frame body always starts with a 32-bit constructor id.
//! [`Envelope::decode`] dispatches on that id into a closed set of variants;
//! anything unrecognized is handed back as an opaque [`Envelope::Raw`] body
//! for the caller to interpret.

use std::io::{Read, Write};

use crate::deserialize::{Cursor, Error, Result};
use crate::serialize::Serializable;
use crate::{Deserializable, MsgId};

// ─── Envelope constructor ids ────────────────────────────────────────────────

const ID_MSG_CONTAINER: u32 = 0x73f1f8dc;
const ID_GZIP_PACKED: u32 = 0x3072cfa1;
const ID_RPC_RESULT: u32 = 0xf35c6d01;
const ID_RPC_ERROR: u32 = 0x2144ca19;
const ID_INVOKE_AFTER: u32 = 0xcb9f372d;
const ID_PONG: u32 = 0x347773c5;
const ID_BAD_SERVER_SALT: u32 = 0xedab447b;
const ID_BAD_MSG_NOTIFY: u32 = 0xa7eff811;
const ID_NEW_SESSION: u32 = 0x9ec20908;
const ID_MSGS_ACK: u32 = 0x62d6b459;

// ─── Message ─────────────────────────────────────────────────────────────────

/// A framed protocol message: identifier, sequence number, and body bytes.
///
/// On the wire (inside a container or as a frame payload) a message is
/// `msg_id:long seq_no:int len:int body:bytes`.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Unique identifier of this message.
    pub msg_id: MsgId,
    /// Session-scoped sequence number; odd for content-related messages.
    pub seq_no: i32,
    /// The serialized body (constructor id + fields).
    pub body: Vec<u8>,
}

impl Message {
    /// Header bytes preceding the body: msg_id(8) + seq_no(4) + len(4).
    pub const SIZE_OVERHEAD: usize = 16;

    /// Read one `msg_id ‖ seq_no ‖ len ‖ body` entry, repositioning the
    /// cursor past exactly `len` body bytes.
    pub fn deserialize(cur: &mut Cursor) -> Result<Self> {
        let msg_id = MsgId::deserialize(cur)?;
        let seq_no = i32::deserialize(cur)?;
        let len = i32::deserialize(cur)?;
        if len < 0 {
            return Err(Error::UnexpectedEof);
        }
        let body = cur.read_slice(len as usize)?.to_vec();
        Ok(Self { msg_id, seq_no, body })
    }
}

// ─── MessageContainer ────────────────────────────────────────────────────────

/// A batch of messages transmitted as one frame.
///
/// `msg_container#73f1f8dc messages:vector<%Message>` — the vector here is
/// bare (count only, no boxed constructor id).
pub struct MessageContainer;

impl MessageContainer {
    /// Wire constructor id.
    pub const CONSTRUCTOR_ID: u32 = ID_MSG_CONTAINER;
    /// Hard ceiling on the combined encoded size of member messages.
    pub const MAXIMUM_SIZE: usize = 1_044_448;
    /// Hard ceiling on the member count.
    pub const MAXIMUM_LENGTH: usize = 100;

    /// Write the container header (constructor id + count) followed by the
    /// already-encoded member messages.
    pub fn wrap(count: usize, encoded_messages: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + encoded_messages.len());
        Self::CONSTRUCTOR_ID.serialize(&mut buf);
        (count as i32).serialize(&mut buf);
        buf.extend_from_slice(encoded_messages);
        buf
    }

    /// Read the member messages. The leading constructor id must already
    /// have been consumed.
    pub fn deserialize_messages(cur: &mut Cursor) -> Result<Vec<Message>> {
        let count = i32::deserialize(cur)?;
        if count < 0 {
            return Err(Error::UnexpectedEof);
        }
        (0..count).map(|_| Message::deserialize(cur)).collect()
    }
}

// ─── GzipPacked ──────────────────────────────────────────────────────────────

/// A gzip-compressed body wrapper.
///
/// `gzip_packed#3072cfa1 packed_data:bytes` — the payload is a standard
/// length-prefixed byte string holding a gzip stream.
pub struct GzipPacked;

impl GzipPacked {
    /// Wire constructor id.
    pub const CONSTRUCTOR_ID: u32 = ID_GZIP_PACKED;
    /// Bodies at or below this size are never worth compressing.
    pub const COMPRESSION_THRESHOLD: usize = 512;

    /// Wrap `data` as `gzip_packed`: constructor id + deflated byte string.
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        // Writing into a Vec cannot fail.
        let _ = encoder.write_all(data);
        let packed = encoder.finish().unwrap_or_default();

        let mut buf = Vec::with_capacity(4 + packed.len());
        Self::CONSTRUCTOR_ID.serialize(&mut buf);
        packed.serialize(&mut buf);
        buf
    }

    /// Inflate the length-prefixed gzip payload. The leading constructor id
    /// must already have been consumed.
    pub fn decode(cur: &mut Cursor) -> Result<Vec<u8>> {
        let packed = Vec::<u8>::deserialize(cur)?;
        Self::inflate(&packed)
    }

    /// Inflate a raw gzip stream.
    pub fn inflate(packed: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(packed)
            .read_to_end(&mut out)
            .map_err(|_| Error::Decompression)?;
        Ok(out)
    }

    /// Return the `gzip_packed` wrapping of `data` when it is content-related,
    /// larger than the threshold, and actually shrinks; otherwise return
    /// `data` untouched.
    pub fn gzip_if_smaller(content_related: bool, data: Vec<u8>) -> Vec<u8> {
        if content_related && data.len() > Self::COMPRESSION_THRESHOLD {
            let wrapped = Self::encode(&data);
            if wrapped.len() < data.len() {
                return wrapped;
            }
        }
        data
    }
}

// ─── InvokeAfterMsg ──────────────────────────────────────────────────────────

/// Wrapper encoding an ordering dependency on an earlier request.
///
/// `invokeAfterMsg#cb9f372d msg_id:long query:!X` instructs the server to
/// apply the query's side effects only after the referenced message's.
pub struct InvokeAfterMsg;

impl InvokeAfterMsg {
    /// Wire constructor id.
    pub const CONSTRUCTOR_ID: u32 = ID_INVOKE_AFTER;

    /// Wrap `query` so it executes after `after` on the server.
    pub fn wrap(after: MsgId, query: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + query.len());
        Self::CONSTRUCTOR_ID.serialize(&mut buf);
        after.serialize(&mut buf);
        buf.extend_from_slice(query);
        buf
    }
}

// ─── MsgsAck ─────────────────────────────────────────────────────────────────

/// A batch acknowledgement of received message ids.
///
/// `msgs_ack#62d6b459 msg_ids:Vector<long>`
#[derive(Clone, Debug, PartialEq)]
pub struct MsgsAck {
    /// The acknowledged message ids.
    pub msg_ids: Vec<MsgId>,
}

impl MsgsAck {
    /// Wire constructor id.
    pub const CONSTRUCTOR_ID: u32 = ID_MSGS_ACK;

    /// Serialize to a wire body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + 8 * self.msg_ids.len());
        Self::CONSTRUCTOR_ID.serialize(&mut buf);
        self.msg_ids.serialize(&mut buf);
        buf
    }
}

// ─── RpcResult ───────────────────────────────────────────────────────────────

/// A structured error returned in place of an RPC result.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// Status code (HTTP-like).
    pub code: i32,
    /// The error message, e.g. `FLOOD_WAIT_30`.
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// The error name with any numeric suffix stripped, e.g.
    /// `FLOOD_WAIT_30` → `FLOOD_WAIT`.
    pub fn name(&self) -> &str {
        match self.split_suffix() {
            Some((name, _)) => name,
            None => &self.message,
        }
    }

    /// The numeric suffix extracted from the message, if any.
    pub fn value(&self) -> Option<u32> {
        self.split_suffix().map(|(_, value)| value)
    }

    /// Match on the error name, with an optional `'*'` wildcard prefix or
    /// suffix: `is("FLOOD_WAIT")`, `is("PHONE_*")`, `is("*_INVALID")`.
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name().starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name().ends_with(suffix)
        } else {
            self.name() == pattern
        }
    }

    fn split_suffix(&self) -> Option<(&str, u32)> {
        let idx = self.message.rfind('_')?;
        let suffix = &self.message[idx + 1..];
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok().map(|v| (&self.message[..idx], v))
    }
}

/// The server's answer to a specific request.
///
/// `rpc_result#f35c6d01 req_msg_id:long result:Object` — the result is
/// either a structured `rpc_error`, a gzip-wrapped body (unwrapped here),
/// or the raw serialized result object.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResult {
    /// Identifier of the request this result answers.
    pub req_msg_id: MsgId,
    /// The result body, or the error the server replied with.
    pub result: std::result::Result<Vec<u8>, RpcError>,
}

impl RpcResult {
    /// Wire constructor id.
    pub const CONSTRUCTOR_ID: u32 = ID_RPC_RESULT;

    /// Read the result following an already-consumed `rpc_result` id.
    pub fn deserialize(cur: &mut Cursor) -> Result<Self> {
        let req_msg_id = MsgId::deserialize(cur)?;

        let before = cur.pos();
        let inner_id = u32::deserialize(cur)?;
        let result = match inner_id {
            ID_RPC_ERROR => {
                let code = i32::deserialize(cur)?;
                let message = String::deserialize(cur)?;
                Err(RpcError { code, message })
            }
            ID_GZIP_PACKED => Ok(GzipPacked::decode(cur)?),
            _ => {
                // Not a recognized wrapper: rewind so the result keeps its
                // own constructor id.
                cur.set_pos(before);
                Ok(cur.read_to_end().to_vec())
            }
        };

        Ok(Self { req_msg_id, result })
    }
}

// ─── Envelope ────────────────────────────────────────────────────────────────

/// The closed set of wire envelopes a decrypted body can decode into.
///
/// Decoding dispatches on the leading constructor id; unknown ids yield
/// [`Envelope::Raw`] with the body untouched (constructor id included).
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// `msg_container`: a batch of inner messages.
    Container(Vec<Message>),
    /// `gzip_packed`: the inflated inner body, to be decoded again.
    Gzip(Vec<u8>),
    /// `rpc_result`: a response correlated to a request id.
    RpcResult(RpcResult),
    /// `pong`: answers a ping; `msg_id` is the ping's request id.
    Pong {
        /// Request id of the ping being answered.
        msg_id: MsgId,
        /// The ping's random payload echoed back.
        ping_id: i64,
    },
    /// `bad_server_salt`: the request must be re-sent with `new_salt`.
    BadServerSalt {
        /// Id of the rejected message.
        bad_msg_id: MsgId,
        /// Sequence number of the rejected message.
        bad_seq_no: i32,
        /// Reason code (always 48 for salt errors).
        error_code: i32,
        /// The salt to use from now on.
        new_salt: i64,
    },
    /// `bad_msg_notification`: the request was rejected outright.
    BadMsgNotification {
        /// Id of the rejected message.
        bad_msg_id: MsgId,
        /// Sequence number of the rejected message.
        bad_seq_no: i32,
        /// Reason code; 16/17 signal clock skew, 32/33 sequence drift.
        error_code: i32,
    },
    /// `new_session_created`: the server opened a fresh session and
    /// announced its salt.
    NewSessionCreated {
        /// First message id valid in the new session.
        first_msg_id: MsgId,
        /// Server-chosen unique session marker.
        unique_id: i64,
        /// The salt to use from now on.
        server_salt: i64,
    },
    /// `msgs_ack`: the server acknowledged these message ids.
    MsgsAck(Vec<MsgId>),
    /// Anything else: an opaque body for the caller (updates, results of
    /// service queries, application payloads).
    Raw(Vec<u8>),
}

impl Envelope {
    /// Decode a decrypted frame body by its leading constructor id.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::from_slice(body);
        let id = u32::deserialize(&mut cur)?;

        Ok(match id {
            ID_MSG_CONTAINER => Self::Container(MessageContainer::deserialize_messages(&mut cur)?),
            ID_GZIP_PACKED => Self::Gzip(GzipPacked::decode(&mut cur)?),
            ID_RPC_RESULT => Self::RpcResult(RpcResult::deserialize(&mut cur)?),
            ID_PONG => Self::Pong {
                msg_id: MsgId::deserialize(&mut cur)?,
                ping_id: i64::deserialize(&mut cur)?,
            },
            ID_BAD_SERVER_SALT => Self::BadServerSalt {
                bad_msg_id: MsgId::deserialize(&mut cur)?,
                bad_seq_no: i32::deserialize(&mut cur)?,
                error_code: i32::deserialize(&mut cur)?,
                new_salt: i64::deserialize(&mut cur)?,
            },
            ID_BAD_MSG_NOTIFY => Self::BadMsgNotification {
                bad_msg_id: MsgId::deserialize(&mut cur)?,
                bad_seq_no: i32::deserialize(&mut cur)?,
                error_code: i32::deserialize(&mut cur)?,
            },
            ID_NEW_SESSION => Self::NewSessionCreated {
                first_msg_id: MsgId::deserialize(&mut cur)?,
                unique_id: i64::deserialize(&mut cur)?,
                server_salt: i64::deserialize(&mut cur)?,
            },
            ID_MSGS_ACK => Self::MsgsAck(Vec::<MsgId>::deserialize(&mut cur)?),
            _ => Self::Raw(body.to_vec()),
        })
    }
}
