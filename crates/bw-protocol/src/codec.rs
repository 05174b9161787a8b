//! Tokio codec for framed protocol envelopes

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::call::CallId;
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Call this frame belongs to
    pub call_id: CallId,
    /// The envelope payload
    pub envelope: Envelope,
}

impl Frame {
    /// Create a new frame
    pub fn new(call_id: CallId, envelope: Envelope) -> Self {
        Self { call_id, envelope }
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            // Keep the header and wait for the rest of the payload
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload_bytes = src.split_to(payload_len).freeze();
        let envelope: Envelope = bincode::deserialize(&payload_bytes)?;

        if envelope.kind() != header.kind {
            return Err(ProtocolError::KindMismatch {
                header: header.kind,
                payload: envelope.kind(),
            });
        }

        Ok(Some(Frame {
            call_id: header.call_id,
            envelope,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.envelope)?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(frame.call_id, frame.envelope.kind(), payload_len as u32);
        header.encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ErrorCode, Method};
    use crate::frame::HEADER_SIZE;
    use bytes::Bytes;

    #[test]
    fn test_codec_request() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(
            CallId::new(1),
            Envelope::Request {
                method: Method::GitCredentials,
                payload: r#"{"host":"github.com"}"#.to_string(),
            },
        );

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_chunk_preserves_bytes() {
        let mut codec = FrameCodec::new();
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let frame = Frame::new(CallId::new(9), Envelope::Chunk(Bytes::from(data.clone())));

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded.envelope {
            Envelope::Chunk(bytes) => assert_eq!(bytes.as_ref(), &data[..]),
            other => panic!("Expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(
            CallId::new(3),
            Envelope::Error {
                code: ErrorCode::PermissionDenied,
                message: "docker credentials forbidden".to_string(),
            },
        );

        let mut full_buf = BytesMut::new();
        codec.encode(frame.clone(), &mut full_buf).unwrap();

        // Header only
        let mut partial = full_buf.split_to(HEADER_SIZE + 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_codec_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Frame::new(CallId::new(1), Envelope::Chunk(Bytes::from_static(b"ab"))), &mut buf)
            .unwrap();
        codec
            .encode(Frame::new(CallId::new(1), Envelope::StreamEnd), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first.envelope, Envelope::Chunk(_)));
        assert_eq!(second.envelope, Envelope::StreamEnd);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_kind_mismatch() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(CallId::new(1), Envelope::StreamEnd), &mut buf)
            .unwrap();

        // Rewrite the kind byte to claim a response
        buf[4] = crate::envelope::FrameKind::Response.as_u8();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::KindMismatch { .. })
        ));
    }
}
