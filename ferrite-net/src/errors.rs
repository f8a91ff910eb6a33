//! Error types for ferrite-net.

use std::{fmt, io};

use ferrite_wire::RpcError;

/// The error type surfaced by every operation that talks to the server.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request with a structured error.
    Rpc(RpcError),
    /// A decrypted frame failed one of the session security checks.
    Security(ferrite_mtproto::DecryptError),
    /// Network / I/O failure.
    Io(io::Error),
    /// The operation requires a connected link.
    NotConnected,
    /// The connection dropped while the request was in flight or queued.
    Disconnected,
    /// The request's abort signal fired before it was transmitted.
    Aborted,
    /// A single request's encoded size exceeds the container ceiling.
    PayloadTooBig,
    /// The sender shut down before a response arrived.
    Dropped,
    /// The server rejected the message with a `bad_msg_notification` code
    /// this client cannot repair.
    BadMessage {
        /// The notification's error code.
        code: i32,
    },
    /// Response or envelope bytes failed to parse.
    Deserialize(ferrite_wire::deserialize::Error),
    /// The transport signalled an error status instead of a packet.
    Transport {
        /// The (negative) status code from the wire.
        code: i32,
    },
    /// The transport produced a frame this codec cannot make sense of.
    Frame(String),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Security(e) => write!(f, "security error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Aborted => write!(f, "request aborted"),
            Self::PayloadTooBig => write!(f, "request payload is too big"),
            Self::Dropped => write!(f, "request dropped"),
            Self::BadMessage { code } => write!(f, "bad message (code {code})"),
            Self::Deserialize(e) => write!(f, "deserialize error: {e}"),
            Self::Transport { code } => write!(f, "transport error {code}"),
            Self::Frame(s) => write!(f, "framing error: {s}"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ferrite_wire::deserialize::Error> for InvocationError {
    fn from(e: ferrite_wire::deserialize::Error) -> Self {
        Self::Deserialize(e)
    }
}

impl From<ferrite_mtproto::DecryptError> for InvocationError {
    fn from(e: ferrite_mtproto::DecryptError) -> Self {
        Self::Security(e)
    }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports a `'*'`
    /// wildcard prefix or suffix).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _ => false,
        }
    }
}
