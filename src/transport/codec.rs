//! Length-delimited JSON framing for the duplex transport.
//!
//! Each envelope is serialized as a self-delimited payload: a 4-byte
//! big-endian length prefix followed by a JSON object, matching the wire
//! protocol's "one JSON object per frame" rule (spec §4.1, §6). Built on
//! `tokio_util`'s length-delimited codec rather than hand-rolling frame
//! boundaries over raw reads.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::envelope::Envelope;
use crate::error::TransportError;

/// Encodes/decodes [`Envelope`]s over a length-delimited byte stream,
/// rejecting frames over `max_frame_bytes`.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
}

impl EnvelopeCodec {
    /// Builds a codec that rejects frames larger than `max_frame_bytes`.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        let mut inner = LengthDelimitedCodec::new();
        inner.set_max_frame_length(max_frame_bytes);
        Self {
            inner,
            max_frame_bytes,
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self
            .inner
            .decode(src)
            .map_err(|_| TransportError::PayloadTooLarge {
                size: src.len(),
                limit: self.max_frame_bytes,
            })?
        else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_slice(&frame)
            .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
        if json.len() > self.max_frame_bytes {
            return Err(TransportError::PayloadTooLarge {
                size: json.len(),
                limit: self.max_frame_bytes,
            });
        }
        self.inner
            .encode(bytes::Bytes::from(json), dst)
            .map_err(TransportError::Io)
    }
}

/// Reads a length-prefixed frame's declared size without decoding its body,
/// used by tests exercising the size-limit rejection path directly against
/// raw bytes.
#[must_use]
pub fn peek_frame_len(buf: &BytesMut) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some((&buf[..4]).get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::AgentId;
    use crate::envelope::EnvelopeKind;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            EnvelopeKind::Direct,
            AgentId::try_new("alpha".to_string()).unwrap(),
            serde_json::json!({"text": "hi"}),
        )
    }

    #[test]
    fn encodes_then_decodes_round_trip() {
        let mut codec = EnvelopeCodec::new(1024 * 1024);
        let mut buf = BytesMut::new();
        codec.encode(sample_envelope(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.sender_id, sample_envelope().sender_id);
    }

    #[test]
    fn rejects_oversize_payload_on_encode() {
        let mut codec = EnvelopeCodec::new(8);
        let mut buf = BytesMut::new();
        let result = codec.encode(sample_envelope(), &mut buf);
        assert!(matches!(result, Err(TransportError::PayloadTooLarge { .. })));
    }
}
