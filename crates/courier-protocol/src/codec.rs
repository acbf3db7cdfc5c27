//! Codec for encoding and decoding Courier frames.
//!
//! Frames are JSON documents. On a stream, frames are separated by a single
//! `\n`; a WebSocket text message may carry one frame or several lines.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame delimiter on streams.
pub const DELIMITER: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is not valid UTF-8 text.
    #[error("Frame is not valid UTF-8")]
    NotUtf8,
}

/// Encode a frame to bytes (no trailing delimiter).
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Encode a frame into an existing buffer, followed by the delimiter.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(payload.len() + 1);
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&[DELIMITER]);

    Ok(())
}

/// Decode a single frame from bytes.
///
/// Surrounding whitespace, including a trailing delimiter, is ignored.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid frame.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
    Ok(serde_json::from_str(text.trim())?)
}

/// Try to decode the next line-delimited frame, advancing the buffer past it.
///
/// Blank lines are skipped. Returns `Ok(None)` if no complete line is
/// buffered. A malformed line is consumed before its error is returned, so
/// the caller can drop it and keep decoding.
///
/// # Errors
///
/// Returns an error if the next complete line is too large or malformed.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    loop {
        let Some(pos) = buf.iter().position(|b| *b == DELIMITER) else {
            if buf.len() > MAX_FRAME_SIZE {
                let len = buf.len();
                buf.clear();
                return Err(ProtocolError::FrameTooLarge(len));
            }
            return Ok(None);
        };

        let line = buf.split_to(pos + 1);
        let line = &line[..pos];

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return decode(line).map(Some);
    }
}

/// Codec wrapper carrying an inbound buffer, for stream-oriented readers.
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: BytesMut,
}

impl LineCodec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one transport message. A message without a trailing delimiter
    /// is treated as a complete line.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if data.last() != Some(&DELIMITER) {
            self.buffer.extend_from_slice(&[DELIMITER]);
        }
    }

    /// Decode the next buffered frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the next line is malformed; the line is dropped.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        decode_from(&mut self.buffer)
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ChatEvent, ClientMessage};
    use crate::status::MessageStatus;

    #[test]
    fn test_encode_has_no_delimiter() {
        let frame = ChatEvent::ChatDeleted {
            chat_id: "R1".into(),
        };
        let encoded = encode(&frame).unwrap();
        assert_ne!(encoded.last(), Some(&DELIMITER));

        let decoded: ChatEvent = decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_malformed() {
        match decode::<ClientMessage>(b"{not json") {
            Err(ProtocolError::Json(_)) => {}
            other => panic!("Expected Json error, got {:?}", other),
        }
        match decode::<ClientMessage>(&[0xff, 0xfe]) {
            Err(ProtocolError::NotUtf8) => {}
            other => panic!("Expected NotUtf8 error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let huge = ClientMessage::text("x".repeat(MAX_FRAME_SIZE + 1));
        match encode(&huge) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = ChatEvent::MessageId {
            id: 1,
            status: MessageStatus::Sent,
        };
        let frame2 = ChatEvent::ChatDeleted {
            chat_id: "R2".into(),
        };

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        let decoded1: ChatEvent = decode_from(&mut buf).unwrap().unwrap();
        let decoded2: ChatEvent = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(frame1, decoded1);
        assert_eq!(frame2, decoded2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut codec = LineCodec::new();
        codec.push(b"{\"message\":\"one\"}\n\ngarbage\n{\"message\":\"two\"}");

        let first: Option<ClientMessage> = codec.next_frame().unwrap();
        assert_eq!(first.unwrap().message, "one");

        assert!(codec.next_frame::<ClientMessage>().is_err());

        let second: Option<ClientMessage> = codec.next_frame().unwrap();
        assert_eq!(second.unwrap().message, "two");

        assert!(codec.next_frame::<ClientMessage>().unwrap().is_none());
        assert_eq!(codec.buffered(), 0);
    }
}
