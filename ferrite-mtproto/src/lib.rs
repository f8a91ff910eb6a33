//! Session state for the ferrite RPC transport.
//!
//! This crate owns everything that must stay consistent across the lifetime
//! of one encrypted connection:
//! * Message id generation (clock-derived, strictly increasing)
//! * Sequence numbers (odd for content-related messages)
//! * Envelope encryption and the inbound security checks
//! * Clock-offset correction from server-confirmed ids
//!
//! It performs no I/O; the async plumbing lives in `ferrite-net`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod session;

pub use session::{DecryptError, Session};
