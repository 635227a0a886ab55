use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::BackendError;
use crate::utils::join_prefix;
use crate::utils::validate_key;
use crate::Error;
use crate::KvDriver;
use crate::Result;
use crate::TxnOp;

/// Single-use batch of puts and deletes committed atomically.
///
/// ```ignore
/// let mut txn = broker.new_txn()?;
/// txn.put("x", "1")?.put("y", "2")?.delete("z")?;
/// txn.commit().await?;
/// ```
///
/// After `commit` (or `abort`) every call fails with `Closed`. When one key
/// is touched more than once, the last op on it is the one applied.
pub struct Txn {
    driver: Arc<dyn KvDriver>,
    prefix: String,
    ops: Vec<TxnOp>,
    finished: bool,
}

impl fmt::Debug for Txn {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Txn")
            .field("backend", &self.driver.name())
            .field("prefix", &self.prefix)
            .field("ops", &self.ops)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Txn {
    pub(crate) fn new(
        driver: Arc<dyn KvDriver>,
        prefix: &str,
    ) -> Self {
        Self {
            driver,
            prefix: prefix.to_string(),
            ops: Vec::new(),
            finished: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::Closed("transaction"));
        }
        Ok(())
    }

    pub fn put(
        &mut self,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<&mut Self> {
        self.ensure_open()?;
        let key = join_prefix(&self.prefix, key);
        validate_key(&key)?;
        self.ops.push(TxnOp::Put {
            key,
            value: value.into(),
        });
        Ok(self)
    }

    pub fn delete(
        &mut self,
        key: &str,
    ) -> Result<&mut Self> {
        self.ensure_open()?;
        let key = join_prefix(&self.prefix, key);
        validate_key(&key)?;
        self.ops.push(TxnOp::Delete { key });
        Ok(self)
    }

    /// Ops queued so far, keys absolute
    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Discards the queued ops.
    pub fn abort(&mut self) {
        self.ops.clear();
        self.finished = true;
    }

    pub async fn commit(&mut self) -> Result<()> {
        let ops = self.take_ops()?;
        if ops.is_empty() {
            return Ok(());
        }
        debug!("[{}] committing {} ops", self.driver.name(), ops.len());
        self.driver.commit(ops).await
    }

    /// Like [`Txn::commit`], abandoning the request once `cancel` fires.
    ///
    /// The backend still applies the batch all-or-nothing.
    pub async fn commit_with_cancel(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ops = self.take_ops()?;
        if ops.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Unavailable(BackendError::Cancelled("commit"))),
            result = self.driver.commit(ops) => result,
        }
    }

    fn take_ops(&mut self) -> Result<Vec<TxnOp>> {
        self.ensure_open()?;
        self.finished = true;
        Ok(std::mem::take(&mut self.ops))
    }
}

/// Keeps only the last op per key, in the order those ops were queued.
///
/// A batch is one change per key: every driver applies it under a single
/// revision, so a watcher sees at most one event per key per commit.
pub(crate) fn coalesce_ops(ops: Vec<TxnOp>) -> Vec<TxnOp> {
    let keep: Vec<bool> = {
        let mut last: HashMap<&str, usize> = HashMap::with_capacity(ops.len());
        for (idx, op) in ops.iter().enumerate() {
            last.insert(op.key(), idx);
        }
        ops.iter()
            .enumerate()
            .map(|(idx, op)| last.get(op.key()) == Some(&idx))
            .collect()
    };
    if keep.iter().all(|k| *k) {
        return ops;
    }
    ops.into_iter().zip(keep).filter_map(|(op, keep)| keep.then_some(op)).collect()
}
