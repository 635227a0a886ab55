//! Message-typed views over byte brokers and watchers.
//!
//! Values are (de)serialised with a [`Serializer`]; when a
//! [`MessageCrypto`] is attached, the fields its policy names are decrypted
//! right after decoding.

mod broker;
mod watcher;

pub use broker::*;
pub use watcher::*;

#[cfg(test)]
mod broker_test;

use crate::Codec;
use crate::KvMessage;
use crate::MessageCrypto;
use crate::Result;
use crate::Serializer;

/// Codec plus optional field crypto applied on reads
#[derive(Debug, Clone, Default)]
pub struct MessageDecoder {
    codec: Serializer,
    crypto: Option<MessageCrypto>,
}

impl MessageDecoder {
    pub fn new(
        codec: Serializer,
        crypto: Option<MessageCrypto>,
    ) -> Self {
        Self { codec, crypto }
    }

    pub fn codec(&self) -> &Serializer {
        &self.codec
    }

    pub fn decode_into<M: KvMessage>(
        &self,
        data: &[u8],
        msg: &mut M,
    ) -> Result<()> {
        self.codec.unmarshal(data, msg)?;
        if let Some(crypto) = &self.crypto {
            crypto.decrypt(msg)?;
        }
        Ok(())
    }

    pub fn decode<M: KvMessage>(
        &self,
        data: &[u8],
    ) -> Result<M> {
        let mut msg = M::default();
        self.decode_into(data, &mut msg)?;
        Ok(msg)
    }

    pub fn encode<M: KvMessage>(
        &self,
        msg: &M,
    ) -> Result<Vec<u8>> {
        self.codec.marshal(msg)
    }
}
