//! Wire protocol: the JSON message envelope, typed payloads, and a
//! streaming frame reader.
//!
//! Messages are JSON objects written back-to-back on the wire with no
//! separators, so the reader parses strictly one value at a time and keeps
//! partial trailing bytes buffered until the rest arrives.

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::chain::{Block, Chainstate};
use crate::error::NodeError;

/// Upper bound on a single buffered frame. A sync reply carrying the
/// maximum block batch stays well under this.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Discriminant carried in the envelope's `Type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    NewBlock = 1,
    NewTx = 2,
    Sync = 3,
    SyncNextBlocks = 4,
    /// Reserved; handled as a no-op.
    Init = 5,
    /// Reserved; handled as a no-op.
    InitBlocks = 6,
    NewRx = 7,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::NewBlock),
            2 => Some(MessageType::NewTx),
            3 => Some(MessageType::Sync),
            4 => Some(MessageType::SyncNextBlocks),
            5 => Some(MessageType::Init),
            6 => Some(MessageType::InitBlocks),
            7 => Some(MessageType::NewRx),
            _ => None,
        }
    }
}

/// The wire envelope. `Content` is the JSON serialization of the inner
/// payload, embedded as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Type")]
    pub kind: u8,
    #[serde(rename = "Content")]
    pub content: String,
}

impl Message {
    pub fn new(kind: MessageType, payload: &impl Serialize) -> Result<Self, NodeError> {
        Ok(Message {
            kind: kind as u8,
            content: serde_json::to_string(payload)?,
        })
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.kind)
    }

    /// Deserializes the inner payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        Ok(serde_json::from_str(&self.content)?)
    }

    /// The envelope bytes as written to the wire.
    pub fn encode(&self) -> Result<String, NodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of [`MessageType::Sync`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(rename = "LastBlockHash")]
    pub last_block_hash: String,
}

/// Payload of [`MessageType::SyncNextBlocks`]: the sender's head id and the
/// missing blocks, most recent first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncNextBlocks {
    #[serde(rename = "Head")]
    pub head: u64,
    #[serde(rename = "Blocks")]
    pub blocks: Vec<Block>,
}

/// Payload of the reserved [`MessageType::Init`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Init {
    #[serde(rename = "SafetyValue")]
    pub safety_value: u8,
}

/// Payload of the reserved [`MessageType::InitBlocks`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitBlocks {
    #[serde(rename = "Chainstate")]
    pub chainstate: Chainstate,
    #[serde(rename = "Blocks")]
    pub blocks: Vec<Block>,
}

/// Streaming reader yielding one [`Message`] per complete JSON object.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// The next complete message, `Ok(None)` on end of stream.
    ///
    /// A syntactically broken frame yields a `Serialization` error after
    /// discarding the buffered bytes; the connection stays usable for
    /// whatever the peer sends next. Only I/O errors are terminal.
    pub async fn next_message(&mut self) -> Result<Option<Message>, NodeError> {
        loop {
            if !self.buffer.is_empty() {
                let mut stream =
                    serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Message>();
                match stream.next() {
                    Some(Ok(message)) => {
                        let consumed = stream.byte_offset();
                        let _ = self.buffer.split_to(consumed);
                        return Ok(Some(message));
                    }
                    Some(Err(e)) if e.is_eof() => {
                        // Partial frame, keep reading.
                    }
                    Some(Err(e)) => {
                        self.buffer.clear();
                        return Err(NodeError::Serialization(format!(
                            "malformed frame: {}",
                            e
                        )));
                    }
                    None => {}
                }
            }

            if self.buffer.len() > MAX_FRAME_SIZE {
                self.buffer.clear();
                return Err(NodeError::Serialization("frame exceeds size limit".into()));
            }

            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if !self.buffer.is_empty() {
                    log::debug!("connection closed mid-frame, {} bytes dropped", self.buffer.len());
                }
                return Ok(None);
            }
        }
    }
}
