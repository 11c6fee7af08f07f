//! Supervisor/worker IPC
//!
//! A worker answers with exactly one fixed-size [`Message`] over its private
//! [`Channel`]. The channel is an untrusted-input boundary: everything read
//! from it is length-checked and clamped before use.

mod channel;
mod message;

pub use channel::Channel;
pub use message::{Message, WireBuffer, MESSAGE_SIZE, PAYLOAD_CAPACITY};
