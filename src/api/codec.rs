//! # Frame Codec
//!
//! Wire format: a 4-byte big-endian length followed by exactly that
//! many bytes of JSON-serialized [`Message`].
//!
//! ```text
//! +----------------+------------------------+
//! | length (u32 BE)| payload (length bytes) |
//! +----------------+------------------------+
//! ```
//!
//! Decoding is pull-based: feed bytes into the buffer, call
//! [`FrameDecoder::decode`] until it returns `None`, repeat. Arrival
//! order is preserved. A length field above the configured maximum is
//! rejected before any payload is buffered, so a hostile peer cannot
//! force a large allocation.

use crate::api::model::Message;
use crate::constants::{FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Encodes one message into the buffer as a single frame.
pub fn encode(message: &Message, buffer: &mut BytesMut) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    buffer.reserve(FRAME_HEADER_LEN + payload.len());
    buffer.put_u32(payload.len() as u32);
    buffer.put_slice(&payload);
    Ok(())
}

/// Pull-based frame decoder.
///
/// Stateless between frames; the caller owns the byte buffer.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            max_frame: MAX_FRAME_SIZE,
        }
    }
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Extracts the next complete message from `buffer`.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a full
    /// frame. Consumed bytes are removed from the buffer.
    ///
    /// # Errors
    ///
    /// [`Error::FrameTooLarge`] if the length field exceeds the
    /// maximum, [`Error::MalformedFrame`] if the payload is not a
    /// valid message.
    pub fn decode(&self, buffer: &mut BytesMut) -> Result<Option<Message>> {
        if buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if length > self.max_frame {
            return Err(Error::FrameTooLarge {
                size: length,
                max: self.max_frame,
            });
        }
        if buffer.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }
        buffer.advance(FRAME_HEADER_LEN);
        let payload = buffer.split_to(length);
        let message = serde_json::from_slice(&payload)
            .map_err(|e| Error::MalformedFrame(e.to_string()))?;
        Ok(Some(message))
    }
}

// =============================================================================
// Async Stream Helpers
// =============================================================================

/// Reads one message from an async stream.
///
/// Returns [`Error::ConnectionClosed`] on clean EOF between frames and
/// [`Error::MalformedFrame`] on EOF inside a frame.
pub async fn read_message<R>(reader: &mut R, decoder: &FrameDecoder, buffer: &mut BytesMut) -> Result<Message>
where
    R: AsyncReadExt + Unpin,
{
    loop {
        if let Some(message) = decoder.decode(buffer)? {
            return Ok(message);
        }
        let n = reader
            .read_buf(buffer)
            .await
            .map_err(|e| Error::io("read frame", e))?;
        if n == 0 {
            return if buffer.is_empty() {
                Err(Error::ConnectionClosed)
            } else {
                Err(Error::MalformedFrame("eof inside frame".to_string()))
            };
        }
    }
}

/// Writes one message to an async stream as a single frame.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut buffer = BytesMut::new();
    encode(message, &mut buffer)?;
    writer
        .write_all(&buffer)
        .await
        .map_err(|e| Error::io("write frame", e))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::io("flush frame", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::model::{Request, Response};

    #[test]
    fn test_encode_decode_roundtrip() {
        let message = Message::Request(Request::Containers);
        let mut buffer = BytesMut::new();
        encode(&message, &mut buffer).unwrap();

        let decoder = FrameDecoder::default();
        let decoded = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame_yields_none() {
        let message = Message::Response(Response::Ok);
        let mut full = BytesMut::new();
        encode(&message, &mut full).unwrap();

        let decoder = FrameDecoder::default();
        let mut buffer = BytesMut::new();
        // Feed byte by byte; only the final byte completes the frame.
        for (i, byte) in full.iter().enumerate() {
            buffer.put_u8(*byte);
            let result = decoder.decode(&mut buffer).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(message.clone()));
            }
        }
    }

    #[test]
    fn test_multiple_frames_in_order() {
        let first = Message::Request(Request::Containers);
        let second = Message::Response(Response::Ok);
        let mut buffer = BytesMut::new();
        encode(&first, &mut buffer).unwrap();
        encode(&second, &mut buffer).unwrap();

        let decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(&mut buffer).unwrap(), Some(first));
        assert_eq!(decoder.decode(&mut buffer).unwrap(), Some(second));
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_rejected_early() {
        let decoder = FrameDecoder::new(1024);
        let mut buffer = BytesMut::new();
        buffer.put_u32(u32::MAX);
        assert!(matches!(
            decoder.decode(&mut buffer),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let decoder = FrameDecoder::default();
        let mut buffer = BytesMut::new();
        buffer.put_u32(4);
        buffer.put_slice(b"????");
        assert!(matches!(
            decoder.decode(&mut buffer),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let message = Message::Request(Request::Containers);
        write_message(&mut client, &message).await.unwrap();

        let decoder = FrameDecoder::default();
        let mut buffer = BytesMut::new();
        let received = read_message(&mut server, &decoder, &mut buffer)
            .await
            .unwrap();
        assert_eq!(received, message);

        drop(client);
        assert!(matches!(
            read_message(&mut server, &decoder, &mut buffer).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
