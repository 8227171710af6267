//! Wire format for frontend and peer-backend connections.
//!
//! All connections use length-prefixed framing (4-byte LE + payload) with
//! JSON-encoded messages. Three message kinds flow over a data-plane
//! connection: queries from frontends, queries relayed by an overloaded
//! peer, and the replies to relayed queries.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed message frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Terminal status of a served query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    Ok,
    ModelSessionNotLoaded,
    Timeout,
    ModelForwardError,
    InputTypeIncorrect,
    RelayFailed,
}

/// A rectangular window within the query input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectProto {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Inference query as sent by a frontend (or relayed by a peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProto {
    pub query_id: u64,
    pub model_session_id: String,
    /// Opaque encoded input (e.g. an image); the model runner decodes it.
    pub input: Vec<u8>,
    /// Optional sub-windows to run the model on instead of the full input.
    #[serde(default)]
    pub window: Vec<RectProto>,
}

/// One named output tensor of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProto {
    pub name: String,
    pub data: Vec<f32>,
}

/// Result returned for a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultProto {
    pub query_id: u64,
    pub status: QueryStatus,
    #[serde(default)]
    pub outputs: Vec<OutputProto>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub latency_us: u64,
}

impl QueryResultProto {
    pub fn error(query_id: u64, status: QueryStatus, message: impl Into<String>) -> Self {
        Self {
            query_id,
            status,
            outputs: Vec::new(),
            error_message: message.into(),
            latency_us: 0,
        }
    }
}

/// All data-plane message types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendMessage {
    /// Query from a frontend; reply goes back on the same connection.
    #[serde(rename = "request")]
    Request(QueryProto),

    /// Query relayed from an overloaded peer backend.
    #[serde(rename = "relay")]
    Relay(QueryProto),

    /// Reply to a relayed query, carrying the serving peer's occupancy.
    #[serde(rename = "relay_reply")]
    RelayReply {
        result: QueryResultProto,
        occupancy: f64,
    },

    /// Reply to a frontend query.
    #[serde(rename = "reply")]
    Reply(QueryResultProto),
}

/// Encode a message to JSON bytes, enforcing the frame cap.
pub fn encode_message(message: &BackendMessage) -> Result<Vec<u8>, WireError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: bytes.len(), max: MAX_FRAME_SIZE });
    }
    Ok(bytes)
}

/// Decode a message from JSON bytes.
pub fn decode_message(bytes: &[u8]) -> Result<BackendMessage, WireError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: bytes.len(), max: MAX_FRAME_SIZE });
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Read a length-prefixed frame from an async reader.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let frame_len = u32::from_le_bytes(len_buf) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: frame_len, max: MAX_FRAME_SIZE });
    }

    let mut buf = vec![0u8; frame_len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), WireError> {
    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query() -> QueryProto {
        QueryProto {
            query_id: 42,
            model_session_id: "tensorflow:resnet50:1:100".to_string(),
            input: vec![1, 2, 3, 254, 255],
            window: vec![RectProto { left: 0, top: 0, right: 8, bottom: 8 }],
        }
    }

    #[test]
    fn request_roundtrip_preserves_query() {
        let msg = BackendMessage::Request(sample_query());
        let bytes = encode_message(&msg).unwrap();
        match decode_message(&bytes).unwrap() {
            BackendMessage::Request(q) => {
                assert_eq!(q.query_id, 42);
                assert_eq!(q.input, vec![1, 2, 3, 254, 255]);
                assert_eq!(q.window.len(), 1);
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn relay_reply_carries_occupancy() {
        let msg = BackendMessage::RelayReply {
            result: QueryResultProto::error(7, QueryStatus::Timeout, "deadline passed"),
            occupancy: 0.75,
        };
        let bytes = encode_message(&msg).unwrap();
        match decode_message(&bytes).unwrap() {
            BackendMessage::RelayReply { result, occupancy } => {
                assert_eq!(result.query_id, 7);
                assert_eq!(result.status, QueryStatus::Timeout);
                assert!((occupancy - 0.75).abs() < f64::EPSILON);
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_message(b"not json").is_err());
    }

    #[test]
    fn frame_roundtrip() {
        tokio_test::block_on(async {
            let (mut a, mut b) = tokio::io::duplex(1024);
            write_frame(&mut a, b"hello frame").await.unwrap();
            let got = read_frame(&mut b).await.unwrap();
            assert_eq!(got, b"hello frame");
        });
    }

    #[test]
    fn oversized_frame_rejected() {
        tokio_test::block_on(async {
            let (mut a, mut b) = tokio::io::duplex(64);
            let len = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
            tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
            assert!(matches!(
                read_frame(&mut b).await,
                Err(WireError::FrameTooLarge { .. })
            ));
        });
    }
}
