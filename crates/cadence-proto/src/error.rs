//! Error types for the wire protocol.

use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame exceeds the size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Command byte not in the protocol table.
    #[error("unknown command byte: {0}")]
    UnknownCommand(u8),

    /// Frame body does not follow the `msg_id ␀ command [␀ payload]` shape.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Job period string could not be parsed.
    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    /// Job JSON error.
    #[error("job encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true if the error is an orderly end of stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
