//! Async plumbing for the ferrite RPC transport.
//!
//! This crate turns the pure session state of `ferrite-mtproto` into a
//! working client pipeline:
//! * [`MessagePacker`] — batches queued requests into size-bounded containers
//! * [`Connection`] — a duplex byte-stream link with independent send and
//!   receive pumps decoupled by backpressured queues
//! * [`Sender`] — ties packer, session and connection together and
//!   correlates responses back to their requests
//!
//! Reconnection policy is deliberately left to the caller: on disconnect all
//! in-flight requests fail with a `Disconnected` error and the pumps stop.

#![deny(unsafe_code)]

mod addr;
mod codec;
mod connection;
mod errors;
mod obfuscated;
mod packer;
mod queue;
mod request;
mod sender;

pub use addr::ServerAddr;
pub use codec::{Codec, TransportKind};
pub use connection::{Connection, ConnectionState};
pub use errors::InvocationError;
pub use obfuscated::{Obfuscation, derive_keys};
pub use packer::MessagePacker;
pub use queue::{AsyncQueue, QueueClosed};
pub use request::{PendingRequest, RequestKind, ResponseReceiver};
pub use sender::{Sender, SenderEvent};
