//! Wire protocol of the TCP rendezvous
//!
//! Messages are serialized with MessagePack (rmp-serde). Payloads carried by
//! collectives are opaque bytes; typed values inside them are bincode-encoded
//! by the `Communicator` helpers.
//!
//! # Message Flow
//!
//! ```text
//! Rank N (spoke)                  Rank 0 (hub)
//!     |                              |
//!     |-------- HELLO -------------->|
//!     |<------- WELCOME -------------|
//!     |                              |
//!     |-- ARRIVE(epoch, payload) --->|   (once per collective)
//!     |<- RELEASE(epoch, payloads) --|   (after every rank arrived)
//! ```
//!
//! # Message Framing
//!
//! Each message is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack message]
//! ```

use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Hub and spokes must agree on it during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted from a peer
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Spoke introduces itself to the hub
    Hello(HelloMessage),

    /// Hub accepts a spoke
    Welcome(WelcomeMessage),

    /// A rank entered a collective
    Arrive(ArriveMessage),

    /// Every rank entered the collective; carries the gathered payloads
    Release(ReleaseMessage),

    /// Fatal error reported by a peer
    Error(ErrorMessage),
}

/// Handshake from a spoke
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub rank: usize,
    /// World size as the spoke understands it
    pub size: usize,
    pub hostname: String,
}

/// Handshake answer from the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub protocol_version: u32,
    pub size: usize,
}

/// Arrival at collective number `epoch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArriveMessage {
    pub rank: usize,
    pub epoch: u64,
    pub payload: Vec<u8>,
}

/// Release of collective number `epoch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseMessage {
    pub epoch: u64,
    /// One payload per rank, in rank order
    pub payloads: Vec<Vec<u8>>,
}

/// Error message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub rank: usize,
    pub error: String,
}

/// Serialize a message to a length-prefixed frame
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg).context("Failed to serialize message")?;

    let msg_len = u32::try_from(msg_bytes.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| anyhow::anyhow!("Message too large: {} bytes", msg_bytes.len()))?;

    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a message from a buffer holding at least one frame
///
/// Returns (message, bytes_consumed) where bytes_consumed includes the length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if buf.len() < 4 + msg_len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + msg_len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len])
        .context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read one complete message from a stream
pub async fn read_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")
}

/// Write one message to a stream and flush it
pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = serialize_message(msg)?;

    stream
        .write_all(&framed)
        .await
        .context("Failed to write message")?;
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_deserialize_hello() {
        let msg = Message::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            rank: 3,
            size: 4,
            hostname: "node07".to_string(),
        });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, consumed) = deserialize_message(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());
        match deserialized {
            Message::Hello(hello) => {
                assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
                assert_eq!(hello.rank, 3);
                assert_eq!(hello.size, 4);
                assert_eq!(hello.hostname, "node07");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_serialize_deserialize_release() {
        let msg = Message::Release(ReleaseMessage {
            epoch: 7,
            payloads: vec![vec![1, 2, 3], vec![], vec![255]],
        });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, _) = deserialize_message(&bytes).unwrap();

        match deserialized {
            Message::Release(release) => {
                assert_eq!(release.epoch, 7);
                assert_eq!(release.payloads, vec![vec![1, 2, 3], vec![], vec![255]]);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_incomplete_frame() {
        let msg = Message::Error(ErrorMessage {
            rank: 1,
            error: "boom".to_string(),
        });
        let bytes = serialize_message(&msg).unwrap();

        assert!(deserialize_message(&bytes[..2]).is_err());
        assert!(deserialize_message(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_message_framing() {
        let msg = Message::Welcome(WelcomeMessage {
            protocol_version: PROTOCOL_VERSION,
            size: 2,
        });
        let bytes = serialize_message(&msg).unwrap();

        assert!(bytes.len() >= 4);
        let msg_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + msg_len);
    }

    #[test]
    fn test_stream_round_trip() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let (mut a, mut b) = tokio::io::duplex(1024);
            let msg = Message::Arrive(ArriveMessage {
                rank: 1,
                epoch: 2,
                payload: vec![9; 16],
            });
            write_message(&mut a, &msg).await.unwrap();

            match read_message(&mut b).await.unwrap() {
                Message::Arrive(arrive) => {
                    assert_eq!(arrive.rank, 1);
                    assert_eq!(arrive.epoch, 2);
                    assert_eq!(arrive.payload.len(), 16);
                }
                _ => panic!("Wrong message type"),
            }
        });
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let (mut a, mut b) = tokio::io::duplex(64);
            let len = (MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes();
            a.write_all(&len).await.unwrap();
            assert!(read_message(&mut b).await.is_err());
        });
    }
}
