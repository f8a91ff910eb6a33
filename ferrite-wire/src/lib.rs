//! Binary wire codec for the ferrite RPC transport.
//!
//! This crate handles:
//! * Typed little-endian reads and writes over byte buffers
//! * The length-prefixed, 4-byte-aligned byte-string encoding
//! * Wire envelopes: messages, containers, gzip wrapping, RPC results
//!
//! It is purely computational: no I/O, no async, no crypto.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod deserialize;
pub mod envelope;
pub mod serialize;

pub use deserialize::{Cursor, Deserializable};
pub use envelope::{
    Envelope, GzipPacked, InvokeAfterMsg, Message, MessageContainer, MsgsAck, RpcError, RpcResult,
};
pub use serialize::Serializable;

/// A 64-bit message identifier.
///
/// Assigned when a request is serialized for the wire; responses carry the
/// identifier of the request they answer, which is how the two are matched.
/// The high 32 bits encode a coarse timestamp, so identifiers are also
/// per-session monotonic.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MsgId(pub i64);

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bare `vector<T>`: count followed by items, without the boxed
/// vector constructor id.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);
