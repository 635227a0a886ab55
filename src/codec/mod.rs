//! Message codecs of the typed layer.
//!
//! A message type must be both a prost message and serde (de)serialisable
//! so either codec can carry it; the codec is picked at runtime from
//! configuration through [`Serializer`].

mod json;
mod proto;

pub use json::*;
pub use proto::*;

#[cfg(test)]
mod codec_test;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::CodecKind;
use crate::KvConfig;
use crate::Result;

/// Message carried by typed brokers and watchers
pub trait KvMessage: prost::Message + Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Name used in logs and crypto policies
    fn label() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<T> KvMessage for T where T: prost::Message + Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

/// Turns messages into stored bytes and back
pub trait Codec: Clone + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn marshal<M: KvMessage>(
        &self,
        msg: &M,
    ) -> Result<Vec<u8>>;

    /// Decodes into `msg`, replacing its content.
    fn unmarshal<M: KvMessage>(
        &self,
        data: &[u8],
        msg: &mut M,
    ) -> Result<()>;
}

/// Codec chosen by `codec` in the configuration
#[derive(Debug, Clone)]
pub enum Serializer {
    Proto(ProtoCodec),
    Json(JsonCodec),
}

impl Serializer {
    pub fn from_config(config: &KvConfig) -> Self {
        match config.codec {
            CodecKind::Proto => Serializer::Proto(ProtoCodec),
            CodecKind::Json => Serializer::Json(JsonCodec::new(config.expand_env_vars)),
        }
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Serializer::Proto(ProtoCodec)
    }
}

impl Codec for Serializer {
    fn name(&self) -> &'static str {
        match self {
            Serializer::Proto(c) => c.name(),
            Serializer::Json(c) => c.name(),
        }
    }

    fn marshal<M: KvMessage>(
        &self,
        msg: &M,
    ) -> Result<Vec<u8>> {
        match self {
            Serializer::Proto(c) => c.marshal(msg),
            Serializer::Json(c) => c.marshal(msg),
        }
    }

    fn unmarshal<M: KvMessage>(
        &self,
        data: &[u8],
        msg: &mut M,
    ) -> Result<()> {
        match self {
            Serializer::Proto(c) => c.unmarshal(data, msg),
            Serializer::Json(c) => c.unmarshal(data, msg),
        }
    }
}
