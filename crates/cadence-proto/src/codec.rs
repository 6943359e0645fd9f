//! Frame encoding and decoding utilities.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Command;
use crate::error::ProtocolError;
use crate::NULL_CHAR;

/// Maximum frame size (8 MB).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Reads one length-prefixed frame and returns its body.
///
/// A clean end of stream before the length prefix yields
/// [`ProtocolError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Reads a frame whose length prefix was already consumed by sniffing.
pub async fn read_frame_body<R>(reader: &mut R, len: u32) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = len as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// A decoded frame body: `msg_id ␀ command [␀ payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opaque request identifier echoed back in replies.
    pub msg_id: Vec<u8>,
    /// Command discriminant.
    pub command: Command,
    /// Command payload, empty when absent.
    pub payload: Vec<u8>,
}

impl Message {
    /// Parses a frame body.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let sep = body
            .iter()
            .position(|&b| b == NULL_CHAR)
            .ok_or_else(|| ProtocolError::Malformed("missing msg_id separator".to_owned()))?;

        let msg_id = body[..sep].to_vec();
        let rest = &body[sep + 1..];
        let cmd_byte = *rest
            .first()
            .ok_or_else(|| ProtocolError::Malformed("missing command byte".to_owned()))?;
        let command = Command::from_u8(cmd_byte)?;

        let payload = match rest.get(1) {
            Some(&NULL_CHAR) => rest[2..].to_vec(),
            Some(_) => {
                return Err(ProtocolError::Malformed(
                    "expected separator after command byte".to_owned(),
                ))
            }
            None => Vec::new(),
        };

        Ok(Self {
            msg_id,
            command,
            payload,
        })
    }

    /// Encodes a bare reply: `msg_id ␀ command`.
    #[must_use]
    pub fn encode_reply(msg_id: &[u8], command: Command) -> Vec<u8> {
        let mut body = Vec::with_capacity(msg_id.len() + 2);
        body.extend_from_slice(msg_id);
        body.push(NULL_CHAR);
        body.push(command.as_u8());
        body
    }

    /// Encodes a command frame with a payload.
    #[must_use]
    pub fn encode(msg_id: &[u8], command: Command, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(msg_id.len() + payload.len() + 3);
        body.extend_from_slice(msg_id);
        body.push(NULL_CHAR);
        body.push(command.as_u8());
        body.push(NULL_CHAR);
        body.extend_from_slice(payload);
        body
    }

    /// Encodes a raw reply carrying arbitrary bytes after the msg_id.
    ///
    /// Used for STATUS lines, dump batches and error text.
    #[must_use]
    pub fn encode_raw(msg_id: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(msg_id.len() + payload.len() + 1);
        body.extend_from_slice(msg_id);
        body.push(NULL_CHAR);
        body.extend_from_slice(payload);
        body
    }
}
