//! Envelope framing on a byte stream.
//!
//! Each record is a 4-byte big-endian length prefix followed by the JSON
//! encoding of an [`Envelope`]. A frame that is well-delimited but not a
//! valid envelope is surfaced as an item-level error so the connection can
//! keep reading; only framing failures end the stream.

use bytes::{Bytes, BytesMut};
use relaynet_core::{CoreError, Envelope};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize an envelope once so it can be queued on many connections.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, CoreError> {
    envelope.to_bytes().map(Bytes::from)
}

/// Length-delimited JSON envelope codec.
#[derive(Debug)]
pub struct EnvelopeCodec {
    frames: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_len)
                .new_codec(),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, CoreError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self
            .frames
            .decode(src)?
            .map(|frame| Envelope::from_bytes(&frame)))
    }
}

impl Encoder<Bytes> for EnvelopeCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.frames.encode(frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use relaynet_core::{ApplicationEnvelope, MessageKind};

    fn frame_of(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let env = Envelope::empty(MessageKind::Keepalive);
        let bytes = encode_envelope(&env).unwrap();

        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(bytes.clone(), &mut buf).unwrap();

        assert_eq!(&buf[..4], &(bytes.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], &bytes[..]);
    }

    #[test]
    fn test_decode_full_frame() {
        let app = ApplicationEnvelope::new("c1:a", "c1:b", b"hi".to_vec());
        let env = Envelope::application(&app).unwrap();
        let mut buf = frame_of(&env.to_bytes().unwrap());

        let mut codec = EnvelopeCodec::new();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let env = Envelope::empty(MessageKind::Keepalive);
        let full = frame_of(&env.to_bytes().unwrap());

        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 2..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_malformed_frame_is_item_error() {
        let mut buf = frame_of(b"{not json");
        let keepalive = Envelope::empty(MessageKind::Keepalive).to_bytes().unwrap();
        buf.extend_from_slice(&frame_of(&keepalive));

        let mut codec = EnvelopeCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is_err());

        // The stream stays usable after a bad frame.
        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.kind, MessageKind::Keepalive);
    }

    #[test]
    fn test_oversized_frame_is_stream_error() {
        let mut codec = EnvelopeCodec::with_max_frame_len(8);
        let mut buf = frame_of(&[b'x'; 32]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
