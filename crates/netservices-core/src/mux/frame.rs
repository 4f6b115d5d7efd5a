//! Byte-mode framing.
//!
//! ```text
//! [u48 BE: total frame length, header included][UTF-8 JSON message array]
//! ```

use crate::config::MuxConfig;
use crate::error::{QueueKind, Result, ServiceError};
use crate::message::Message;
use bytes::{Buf, BytesMut};

/// Serialize a message into a complete frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let mut frame = vec![0u8; MuxConfig::FRAME_HEADER_LEN];
    serde_json::to_writer(&mut frame, message)?;

    let len = frame.len() as u64;
    if len > MuxConfig::MAX_FRAME_LEN {
        return Err(ServiceError::protocol(format!(
            "frame length {} exceeds the maximum of {}",
            len,
            MuxConfig::MAX_FRAME_LEN
        )));
    }

    frame[..MuxConfig::FRAME_HEADER_LEN].copy_from_slice(&len.to_be_bytes()[2..]);
    Ok(frame)
}

fn read_frame_len(header: &[u8]) -> u64 {
    let mut be = [0u8; 8];
    be[2..].copy_from_slice(&header[..MuxConfig::FRAME_HEADER_LEN]);
    u64::from_be_bytes(be)
}

/// Accumulates raw ingress bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    limit: Option<usize>,
}

impl FrameDecoder {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            buffer: BytesMut::new(),
            limit,
        }
    }

    /// Append newly arrived bytes.
    ///
    /// Fails once the buffered bytes exceed the ingress limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.buffer.extend_from_slice(chunk);

        if let Some(limit) = self.limit {
            if self.buffer.len() > limit {
                return Err(ServiceError::QueueSizeLimit {
                    queue: QueueKind::Ingress,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Extract the next complete message, if one is fully buffered.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buffer.len() < MuxConfig::FRAME_HEADER_LEN {
            return Ok(None);
        }

        let frame_len = read_frame_len(&self.buffer);
        if frame_len < MuxConfig::FRAME_HEADER_LEN as u64 {
            return Err(ServiceError::protocol(format!(
                "frame length {} is shorter than its header",
                frame_len
            )));
        }
        let frame_len = usize::try_from(frame_len).map_err(|_| {
            ServiceError::protocol(format!("frame length {} is not addressable", frame_len))
        })?;

        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(frame_len);
        frame.advance(MuxConfig::FRAME_HEADER_LEN);
        let message = serde_json::from_slice(&frame)?;
        Ok(Some(message))
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CallMessage, ResultMessage};
    use serde_json::json;

    fn call(id: &str) -> Message {
        Message::Call(CallMessage::new(id, vec!["echoString".into()], vec![json!("x")]))
    }

    #[test]
    fn test_header_counts_whole_frame() {
        let frame = encode_frame(&call("1")).unwrap();
        assert_eq!(read_frame_len(&frame) as usize, frame.len());
        assert_eq!(&frame[6..], br#"[0,"1",["echoString"],["x"]]"#);
    }

    #[test]
    fn test_decoder_waits_for_partial_frames() {
        let frame = encode_frame(&call("1")).unwrap();
        let mut decoder = FrameDecoder::new(None);

        decoder.push(&frame[..3]).unwrap();
        assert!(decoder.next_message().unwrap().is_none());

        decoder.push(&frame[3..10]).unwrap();
        assert!(decoder.next_message().unwrap().is_none());

        decoder.push(&frame[10..]).unwrap();
        assert_eq!(decoder.next_message().unwrap(), Some(call("1")));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_splits_concatenated_frames() {
        let mut bytes = encode_frame(&call("1")).unwrap();
        bytes.extend(encode_frame(&Message::Result(ResultMessage::success("9", json!(null)))).unwrap());
        bytes.extend(&encode_frame(&call("2")).unwrap()[..4]);

        let mut decoder = FrameDecoder::new(None);
        decoder.push(&bytes).unwrap();

        assert_eq!(decoder.next_message().unwrap(), Some(call("1")));
        assert!(matches!(decoder.next_message().unwrap(), Some(Message::Result(_))));
        assert!(decoder.next_message().unwrap().is_none());
        assert_eq!(decoder.buffered(), 4);
    }

    #[test]
    fn test_decoder_enforces_ingress_limit() {
        let mut decoder = FrameDecoder::new(Some(8));
        let err = decoder.push(&[0u8; 9]).unwrap_err();
        assert!(err.is_queue_size_limit());
    }

    #[test]
    fn test_short_frame_length_is_protocol_error() {
        let mut decoder = FrameDecoder::new(None);
        decoder.push(&[0, 0, 0, 0, 0, 2, b'[', b']']).unwrap();
        let err = decoder.next_message().unwrap_err();
        assert_eq!(err.name(), "ProtocolError");
    }

    #[test]
    fn test_malformed_body_is_error() {
        let body = br#"[5,"1",null]"#;
        let mut frame = ((body.len() + 6) as u64).to_be_bytes()[2..].to_vec();
        frame.extend_from_slice(body);

        let mut decoder = FrameDecoder::new(None);
        decoder.push(&frame).unwrap();
        assert!(decoder.next_message().is_err());
    }
}
