//! Wire protocol types for Cadence client/worker/broker communication.
//!
//! The protocol is frame-oriented: every message travels in a frame with a
//! 4-byte big-endian length prefix. Inside a frame, fields are separated by
//! a single NUL byte:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │              Length Prefix (4 bytes, BE)                │
//! ├────────────────────────────────────────────────────────┤
//! │  msg_id ␀ command (1 byte) [ ␀ payload ]               │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The very first frame a peer sends carries a single byte identifying the
//! connection role ([`TYPE_CLIENT`] or [`TYPE_WORKER`]). A connection whose
//! first four raw bytes spell an HTTP method instead is handed over to the
//! HTTP façade.
//!
//! Jobs are serialised as JSON ([`Job`]) both on the wire and in dumps.

pub mod codec;
mod command;
mod error;
mod job;

pub use codec::{read_frame, write_frame, Message, MAX_FRAME_SIZE};
pub use command::Command;
pub use error::ProtocolError;
pub use job::{parse_duration_secs, Job, Period, Status};

/// Role byte sent in the first frame of a client connection.
pub const TYPE_CLIENT: u8 = 1;

/// Role byte sent in the first frame of a worker connection.
pub const TYPE_WORKER: u8 = 2;

/// Field separator inside a frame body.
pub const NULL_CHAR: u8 = 0;

/// Raw 4-byte prefixes that divert a connection to the HTTP façade.
pub const HTTP_PREFIXES: [&[u8; 4]; 5] = [b"GET ", b"POST", b"PUT ", b"DEL ", b"DELE"];

/// Returns true if the given sniffed bytes open an HTTP request.
#[must_use]
pub fn is_http_prefix(bytes: &[u8; 4]) -> bool {
    HTTP_PREFIXES.iter().any(|p| *p == bytes)
}
