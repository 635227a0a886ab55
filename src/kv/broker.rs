use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::utils::join_prefix;
use crate::utils::trim_prefix;
use crate::utils::validate_key;
use crate::ChangeEvent;
use crate::DeleteOptions;
use crate::Error;
use crate::EventSink;
use crate::KeyIterator;
use crate::KvDriver;
use crate::KvIterator;
use crate::PutOptions;
use crate::Result;
use crate::Txn;
use crate::Versioned;
use crate::WatchRequest;

/// Read/write handle over byte values, optionally scoped by a key prefix.
///
/// Wrappers (crypto, metrics, ...) implement it by delegating to an inner
/// broker.
#[async_trait]
pub trait KeyValBroker: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        opts: PutOptions,
    ) -> Result<()>;

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Versioned>>;

    async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<bool>;

    /// Keys under `prefix`, with the broker prefix stripped
    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator>;

    /// Entries under `prefix`, with the broker prefix stripped
    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator>;

    /// Transaction whose keys are relative to this broker
    fn new_txn(&self) -> Result<Txn>;

    /// Nested view; prefixes concatenate
    fn new_broker(
        &self,
        prefix: &str,
    ) -> Result<Arc<dyn KeyValBroker>>;

    /// Makes this handle unusable; the driver stays open.
    fn close(&self) -> Result<()>;
}

/// Subscription handle over byte values, optionally prefix-scoped.
#[async_trait]
pub trait KeyValWatcher: Send + Sync {
    /// Watches `keys` (relative, exact keys or prefixes) until `close_rx`
    /// says otherwise. Event keys arrive relative to this watcher.
    async fn watch(
        &self,
        sink: Arc<dyn EventSink<ChangeEvent>>,
        close_rx: mpsc::Receiver<String>,
        keys: &[&str],
    ) -> Result<()>;

    fn new_watcher(
        &self,
        prefix: &str,
    ) -> Result<Arc<dyn KeyValWatcher>>;

    /// Ends every subscription made through this handle.
    fn close(&self) -> Result<()>;
}

/// Prefix-scoped broker over a shared driver. Cloning is cheap; clones share
/// the closed state.
#[derive(Clone)]
pub struct BytesBroker {
    driver: Arc<dyn KvDriver>,
    prefix: String,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for BytesBroker {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("BytesBroker")
            .field("backend", &self.driver.name())
            .field("prefix", &self.prefix)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl BytesBroker {
    pub fn new(
        driver: Arc<dyn KvDriver>,
        prefix: &str,
    ) -> Self {
        Self {
            driver,
            prefix: prefix.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn driver(&self) -> &Arc<dyn KvDriver> {
        &self.driver
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("broker"));
        }
        Ok(())
    }

    fn absolute(
        &self,
        key: &str,
    ) -> Result<String> {
        self.ensure_open()?;
        let full = join_prefix(&self.prefix, key);
        validate_key(&full)?;
        Ok(full)
    }
}

#[async_trait]
impl KeyValBroker for BytesBroker {
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        opts: PutOptions,
    ) -> Result<()> {
        let key = self.absolute(key)?;
        self.driver.put(&key, value, opts).await
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Versioned>> {
        let key = self.absolute(key)?;
        self.driver.get(&key).await
    }

    async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<bool> {
        let key = self.absolute(key)?;
        self.driver.delete(&key, opts).await
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.ensure_open()?;
        let full = join_prefix(&self.prefix, prefix);
        let scope = self.prefix.clone();
        let iter = self.driver.list_keys(&full).await?;
        Ok(iter.filter_map(move |mut kv| {
            Ok(trim_prefix(&kv.key, &scope).map(|key| {
                kv.key = key;
                kv
            }))
        }))
    }

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator> {
        self.ensure_open()?;
        let full = join_prefix(&self.prefix, prefix);
        let scope = self.prefix.clone();
        let iter = self.driver.list_values(&full).await?;
        Ok(iter.filter_map(move |mut kv| {
            Ok(trim_prefix(&kv.key, &scope).map(|key| {
                kv.key = key;
                kv
            }))
        }))
    }

    fn new_txn(&self) -> Result<Txn> {
        self.ensure_open()?;
        Ok(Txn::new(self.driver.clone(), &self.prefix))
    }

    fn new_broker(
        &self,
        prefix: &str,
    ) -> Result<Arc<dyn KeyValBroker>> {
        self.ensure_open()?;
        Ok(Arc::new(BytesBroker::new(
            self.driver.clone(),
            &join_prefix(&self.prefix, prefix),
        )))
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("[{}] broker {:?} closed", self.driver.name(), self.prefix);
        }
        Ok(())
    }
}

/// Prefix-scoped watcher over a shared driver
#[derive(Clone)]
pub struct BytesWatcher {
    driver: Arc<dyn KvDriver>,
    prefix: String,
    closed: Arc<AtomicBool>,
    subscriptions: CancellationToken,
}

impl fmt::Debug for BytesWatcher {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("BytesWatcher")
            .field("backend", &self.driver.name())
            .field("prefix", &self.prefix)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl BytesWatcher {
    pub fn new(
        driver: Arc<dyn KvDriver>,
        prefix: &str,
    ) -> Self {
        Self {
            driver,
            prefix: prefix.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
            subscriptions: CancellationToken::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl KeyValWatcher for BytesWatcher {
    async fn watch(
        &self,
        sink: Arc<dyn EventSink<ChangeEvent>>,
        close_rx: mpsc::Receiver<String>,
        keys: &[&str],
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("watcher"));
        }
        if keys.is_empty() {
            return Err(Error::invalid("watch needs at least one key"));
        }

        let request = WatchRequest {
            keys: keys.iter().map(|k| join_prefix(&self.prefix, k)).collect(),
            sink,
            close_rx,
            trimmer: Some(self.prefix.clone()),
            owner: Some(self.subscriptions.child_token()),
        };
        self.driver.watch(request).await
    }

    fn new_watcher(
        &self,
        prefix: &str,
    ) -> Result<Arc<dyn KeyValWatcher>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("watcher"));
        }
        Ok(Arc::new(BytesWatcher::new(
            self.driver.clone(),
            &join_prefix(&self.prefix, prefix),
        )))
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.subscriptions.cancel();
            debug!("[{}] watcher {:?} closed", self.driver.name(), self.prefix);
        }
        Ok(())
    }
}
