use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::MessageDecoder;
use crate::DeleteOptions;
use crate::KeyIterator;
use crate::KeyVal;
use crate::KeyValBroker;
use crate::KvIterator;
use crate::KvMessage;
use crate::PutOptions;
use crate::Result;
use crate::Revision;
use crate::Txn;

/// Broker storing messages instead of bytes
#[derive(Clone)]
pub struct TypedBroker {
    inner: Arc<dyn KeyValBroker>,
    decoder: MessageDecoder,
}

impl std::fmt::Debug for TypedBroker {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TypedBroker").field("decoder", &self.decoder).finish_non_exhaustive()
    }
}

impl TypedBroker {
    pub fn new(
        inner: Arc<dyn KeyValBroker>,
        decoder: MessageDecoder,
    ) -> Self {
        Self { inner, decoder }
    }

    /// Underlying byte broker
    pub fn bytes(&self) -> &Arc<dyn KeyValBroker> {
        &self.inner
    }

    pub async fn put<M: KvMessage>(
        &self,
        key: &str,
        msg: &M,
        opts: PutOptions,
    ) -> Result<()> {
        let data = self.decoder.encode(msg)?;
        self.inner.put(key, &data, opts).await
    }

    /// Decodes the value of `key` into `msg`; returns its revision, or
    /// `None` with `msg` untouched when the key is absent.
    pub async fn get_into<M: KvMessage>(
        &self,
        key: &str,
        msg: &mut M,
    ) -> Result<Option<Revision>> {
        let Some(found) = self.inner.get(key).await? else {
            return Ok(None);
        };
        self.decoder.decode_into(&found.value, msg)?;
        Ok(Some(found.revision))
    }

    pub async fn get<M: KvMessage>(
        &self,
        key: &str,
    ) -> Result<Option<M>> {
        let mut msg = M::default();
        Ok(self.get_into(key, &mut msg).await?.map(|_| msg))
    }

    pub async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<bool> {
        self.inner.delete(key, opts).await
    }

    pub async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.inner.list_keys(prefix).await
    }

    pub async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<TypedKvIterator> {
        let inner = self.inner.list_values(prefix).await?;
        Ok(TypedKvIterator {
            inner,
            decoder: self.decoder.clone(),
        })
    }

    pub fn new_txn(&self) -> Result<TypedTxn> {
        Ok(TypedTxn {
            txn: self.inner.new_txn()?,
            decoder: self.decoder.clone(),
        })
    }

    pub fn new_broker(
        &self,
        prefix: &str,
    ) -> Result<TypedBroker> {
        Ok(TypedBroker::new(self.inner.new_broker(prefix)?, self.decoder.clone()))
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// Decoded list entry
#[derive(Debug, Clone, PartialEq)]
pub struct TypedKv<M> {
    pub key: String,
    pub value: M,
    pub revision: Revision,
}

/// List cursor decoding values on demand
pub struct TypedKvIterator {
    inner: KvIterator,
    decoder: MessageDecoder,
}

impl TypedKvIterator {
    /// Decodes the next value into `msg`, reusing its allocations.
    pub async fn next_into<M: KvMessage>(
        &mut self,
        msg: &mut M,
    ) -> Result<Option<KeyVal>> {
        let Some(kv) = self.inner.next().await? else {
            return Ok(None);
        };
        self.decoder.decode_into(&kv.value, msg)?;
        Ok(Some(KeyVal {
            key: kv.key,
            revision: kv.revision,
        }))
    }

    pub async fn next<M: KvMessage>(&mut self) -> Result<Option<TypedKv<M>>> {
        let mut value = M::default();
        Ok(self.next_into(&mut value).await?.map(|kv| TypedKv {
            key: kv.key,
            value,
            revision: kv.revision,
        }))
    }

    pub async fn try_collect<M: KvMessage>(mut self) -> Result<Vec<TypedKv<M>>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

/// [`Txn`] taking messages
pub struct TypedTxn {
    txn: Txn,
    decoder: MessageDecoder,
}

impl TypedTxn {
    pub fn put<M: KvMessage>(
        &mut self,
        key: &str,
        msg: &M,
    ) -> Result<&mut Self> {
        let data = self.decoder.encode(msg)?;
        self.txn.put(key, data)?;
        Ok(self)
    }

    pub fn delete(
        &mut self,
        key: &str,
    ) -> Result<&mut Self> {
        self.txn.delete(key)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.txn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txn.is_empty()
    }

    pub fn abort(&mut self) {
        self.txn.abort();
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.txn.commit().await
    }

    pub async fn commit_with_cancel(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.txn.commit_with_cancel(cancel).await
    }
}
