use super::Codec;
use super::KvMessage;
use crate::Result;

/// Protobuf wire format
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodec;

impl Codec for ProtoCodec {
    fn name(&self) -> &'static str {
        "proto"
    }

    fn marshal<M: KvMessage>(
        &self,
        msg: &M,
    ) -> Result<Vec<u8>> {
        Ok(msg.encode_to_vec())
    }

    fn unmarshal<M: KvMessage>(
        &self,
        data: &[u8],
        msg: &mut M,
    ) -> Result<()> {
        msg.clear();
        msg.merge(data)?;
        Ok(())
    }
}
