use std::sync::Arc;

use bytes::Bytes;

use crate::config::CodecKind;
use crate::error::{Error, Result};
use crate::protocol::binary_codec::BinaryCodec;
use crate::protocol::ProtocolMessage;

/// Converts protocol messages to and from their wire representation. The choice of codec
///  affects the wire format only, never protocol semantics.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, msg: &ProtocolMessage) -> Result<Bytes>;

    fn decode(&self, buf: &[u8]) -> Result<ProtocolMessage>;
}

pub fn codec_for(kind: CodecKind) -> Arc<dyn Codec> {
    match kind {
        CodecKind::Json => Arc::new(JsonCodec {}),
        CodecKind::Binary => Arc::new(BinaryCodec {}),
    }
}

pub struct JsonCodec {}

impl Codec for JsonCodec {
    fn encode(&self, msg: &ProtocolMessage) -> Result<Bytes> {
        serde_json::to_vec(msg)
            .map(Bytes::from)
            .map_err(|e| Error::Decode(format!("cannot encode {} as JSON: {}", msg.kind(), e)))
    }

    fn decode(&self, buf: &[u8]) -> Result<ProtocolMessage> {
        serde_json::from_slice(buf)
            .map_err(|e| Error::Decode(format!("invalid JSON protocol message: {}", e)))
    }
}
