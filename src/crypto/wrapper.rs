use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use super::FieldCrypto;
use crate::ChangeEvent;
use crate::DeleteOptions;
use crate::EventSink;
use crate::KeyIterator;
use crate::KeyValBroker;
use crate::KeyValWatcher;
use crate::KvIterator;
use crate::PutOptions;
use crate::Result;
use crate::Txn;
use crate::Versioned;

/// Broker whose reads pass through [`FieldCrypto::wrap_json`]. Writes go
/// through unchanged.
pub struct CryptoBroker {
    inner: Arc<dyn KeyValBroker>,
    crypto: Arc<FieldCrypto>,
}

impl CryptoBroker {
    pub fn new(
        inner: Arc<dyn KeyValBroker>,
        crypto: Arc<FieldCrypto>,
    ) -> Self {
        Self { inner, crypto }
    }
}

#[async_trait]
impl KeyValBroker for CryptoBroker {
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        opts: PutOptions,
    ) -> Result<()> {
        self.inner.put(key, value, opts).await
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Versioned>> {
        let Some(mut found) = self.inner.get(key).await? else {
            return Ok(None);
        };
        decrypt_in_place(&self.crypto, &mut found.value)?;
        Ok(Some(found))
    }

    async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<bool> {
        self.inner.delete(key, opts).await
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.inner.list_keys(prefix).await
    }

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator> {
        let crypto = self.crypto.clone();
        let iter = self.inner.list_values(prefix).await?;
        Ok(iter.map(move |mut kv| {
            decrypt_in_place(&crypto, &mut kv.value)?;
            Ok(kv)
        }))
    }

    fn new_txn(&self) -> Result<Txn> {
        self.inner.new_txn()
    }

    fn new_broker(
        &self,
        prefix: &str,
    ) -> Result<Arc<dyn KeyValBroker>> {
        Ok(Arc::new(CryptoBroker::new(
            self.inner.new_broker(prefix)?,
            self.crypto.clone(),
        )))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// Watcher decrypting event values before they reach the caller's sink
pub struct CryptoWatcher {
    inner: Arc<dyn KeyValWatcher>,
    crypto: Arc<FieldCrypto>,
}

impl CryptoWatcher {
    pub fn new(
        inner: Arc<dyn KeyValWatcher>,
        crypto: Arc<FieldCrypto>,
    ) -> Self {
        Self { inner, crypto }
    }
}

#[async_trait]
impl KeyValWatcher for CryptoWatcher {
    async fn watch(
        &self,
        sink: Arc<dyn EventSink<ChangeEvent>>,
        close_rx: mpsc::Receiver<String>,
        keys: &[&str],
    ) -> Result<()> {
        let sink = Arc::new(DecryptingSink {
            crypto: self.crypto.clone(),
            sink,
        });
        self.inner.watch(sink, close_rx, keys).await
    }

    fn new_watcher(
        &self,
        prefix: &str,
    ) -> Result<Arc<dyn KeyValWatcher>> {
        Ok(Arc::new(CryptoWatcher::new(
            self.inner.new_watcher(prefix)?,
            self.crypto.clone(),
        )))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

struct DecryptingSink {
    crypto: Arc<FieldCrypto>,
    sink: Arc<dyn EventSink<ChangeEvent>>,
}

impl DecryptingSink {
    fn decrypt(
        &self,
        event: &mut ChangeEvent,
    ) -> Result<()> {
        for value in [&mut event.value, &mut event.prev_value].into_iter().flatten() {
            decrypt_in_place(&self.crypto, value)?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink<ChangeEvent> for DecryptingSink {
    async fn deliver(
        &self,
        mut event: ChangeEvent,
    ) -> Result<()> {
        if let Err(e) = self.decrypt(&mut event) {
            warn!("dropping event for {}: {}", event.key, e);
            return Err(e);
        }
        self.sink.deliver(event).await
    }
}

fn decrypt_in_place(
    crypto: &FieldCrypto,
    value: &mut Vec<u8>,
) -> Result<()> {
    let plain = match crypto.wrap_json(value)? {
        Cow::Borrowed(_) => return Ok(()),
        Cow::Owned(plain) => plain,
    };
    *value = plain;
    Ok(())
}
