//! Wire protocol for ferry worker processes.
//!
//! Uses length-prefixed JSON frames over stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON-encoded frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum accepted frame body size. Inbound frames above this are rejected
/// as corrupt rather than allocated.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// A single unit transferred over a channel.
///
/// The payload is opaque to the transport; the token is caller-assigned and
/// used only for request/response correlation, never interpreted in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque payload.
    pub data: Value,
    /// Correlation token, if this message belongs to an invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<u64>,
}

impl Message {
    /// An uncorrelated message.
    pub fn new(data: Value) -> Self {
        Self { data, token: None }
    }

    /// A message carrying a correlation token.
    pub fn with_token(data: Value, token: u64) -> Self {
        Self {
            data,
            token: Some(token),
        }
    }
}

/// Frame sent across the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Bootstrap frame naming the handler module the worker should load.
    /// Sent exactly once per worker, before any application traffic.
    Init {
        #[serde(default)]
        module_path: Option<String>,
    },

    /// Worker lifecycle acknowledgment, sent once at worker startup.
    Started,

    /// Application payload.
    Message {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<u64>,
    },

    /// Handler dispatch failed for the message carrying `token`.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<u64>,
        message: String,
    },

    /// Graceful shutdown request.
    Shutdown,

    /// Acknowledgement of a shutdown request.
    ShuttingDown,
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::Message {
            data: message.data,
            token: message.token,
        }
    }
}

impl Frame {
    /// Extract the application message from a `Message` frame.
    pub fn into_message(self) -> Option<Message> {
        match self {
            Frame::Message { data, token } => Some(Message { data, token }),
            _ => None,
        }
    }
}

/// Write a frame using length-prefixed JSON encoding.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = serde_json::to_vec(frame)
        .map_err(|e| Error::Serialization(format!("failed to encode frame: {e}")))?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("failed to write frame length: {e}")))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to write frame body: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("failed to flush stream: {e}")))?;

    Ok(())
}

/// Read a frame using length-prefixed JSON encoding.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("failed to read frame length: {e}"))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("frame too large: {len} bytes")));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to read frame body: {e}")))?;

    let frame = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Serialization(format!("failed to decode frame: {e}")))?;

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn init_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::Init {
            module_path: Some("/tmp/handler.so".to_string()),
        };
        write_frame(&mut a, &frame).await.unwrap();

        match read_frame(&mut b).await.unwrap().unwrap() {
            Frame::Init { module_path } => {
                assert_eq!(module_path.as_deref(), Some("/tmp/handler.so"));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_frame_preserves_token() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::from(Message::with_token(json!({"op": "sum", "args": [1, 2]}), 42));
        write_frame(&mut a, &frame).await.unwrap();

        let message = read_frame(&mut b).await.unwrap().unwrap().into_message().unwrap();
        assert_eq!(message.token, Some(42));
        assert_eq!(message.data["op"], "sum");
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let len = (MAX_FRAME_LEN as u32) + 1;
        a.write_all(&len.to_le_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Ipc(_)));
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&8u32.to_le_bytes()).await.unwrap();
        a.write_all(b"tru").await.unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }
}
