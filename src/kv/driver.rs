use std::sync::Arc;

use async_trait::async_trait;

use crate::BytesBroker;
use crate::BytesWatcher;
use crate::Capabilities;
use crate::DeleteOptions;
use crate::Error;
use crate::KeyIterator;
use crate::KvIterator;
use crate::PutOptions;
use crate::Result;
use crate::Txn;
use crate::TxnOp;
use crate::Versioned;
use crate::WatchRequest;

/// Byte-level contract every backend implements.
///
/// Keys are absolute here; prefix handling lives in the brokers. Operations
/// fail with `Closed` once [`KvDriver::close`] was called.
#[async_trait]
pub trait KvDriver: Send + Sync + 'static {
    /// Backend name used in logs, metrics and the health probe key
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn is_closed(&self) -> bool;

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        opts: PutOptions,
    ) -> Result<()>;

    /// `None` when the key does not exist
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Versioned>>;

    /// Returns whether anything was removed
    async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<bool>;

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator>;

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator>;

    /// Applies every op or none of them
    async fn commit(
        &self,
        ops: Vec<TxnOp>,
    ) -> Result<()>;

    /// Registers a subscription; returns once it is active.
    async fn watch(
        &self,
        request: WatchRequest,
    ) -> Result<()>;

    /// Cancels every subscription and waits for background tasks. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Constructors of scoped views over a shared driver
pub trait DriverExt {
    fn new_broker(
        &self,
        prefix: &str,
    ) -> BytesBroker;

    fn new_watcher(
        &self,
        prefix: &str,
    ) -> BytesWatcher;

    fn new_txn(&self) -> Txn;
}

impl DriverExt for Arc<dyn KvDriver> {
    fn new_broker(
        &self,
        prefix: &str,
    ) -> BytesBroker {
        BytesBroker::new(self.clone(), prefix)
    }

    fn new_watcher(
        &self,
        prefix: &str,
    ) -> BytesWatcher {
        BytesWatcher::new(self.clone(), prefix)
    }

    fn new_txn(&self) -> Txn {
        Txn::new(self.clone(), "")
    }
}

/// `Unsupported` for a write on a read-only backend
pub(crate) fn unsupported(
    backend: &'static str,
    op: &'static str,
) -> Error {
    Error::Unsupported { backend, op }
}
