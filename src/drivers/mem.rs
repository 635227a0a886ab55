use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::kv::coalesce_ops;
use crate::utils::async_task::with_timeout;
use crate::utils::has_prefix;
use crate::utils::validate_key;
use crate::Capabilities;
use crate::ChangeEvent;
use crate::DeleteOptions;
use crate::Error;
use crate::KeyIterator;
use crate::KeyVal;
use crate::KvDriver;
use crate::KvIterator;
use crate::KvPair;
use crate::MemoryConfig;
use crate::PutOptions;
use crate::Result;
use crate::TxnOp;
use crate::Versioned;
use crate::WatchConfig;
use crate::WatchHub;
use crate::WatchRequest;

const NAME: &str = "memory";

#[derive(Debug, Clone)]
struct MemEntry {
    value: Vec<u8>,
    revision: u64,
    expires_at: Option<Instant>,
}

impl MemEntry {
    fn is_live(
        &self,
        now: Instant,
    ) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct MemTable {
    entries: BTreeMap<String, MemEntry>,
    revision: u64,
}

impl MemTable {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn live(
        &self,
        key: &str,
        now: Instant,
    ) -> Option<&MemEntry> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn scan<'a>(
        &'a self,
        prefix: &'a str,
        now: Instant,
    ) -> impl Iterator<Item = (&'a String, &'a MemEntry)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| has_prefix(k, prefix))
            .filter(move |(_, e)| e.is_live(now))
    }
}

#[derive(Debug)]
struct MemState {
    table: RwLock<MemTable>,
    hub: Arc<WatchHub>,
}

impl MemState {
    /// Removes expired entries, announcing each as a Delete.
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table.write();
        let expired: Vec<String> = table
            .entries
            .iter()
            .filter(|(_, e)| !e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(old) = table.entries.remove(key) {
                let revision = table.next_revision();
                self.hub.publish(ChangeEvent::delete(key.clone(), Some(old.value), revision));
            }
        }
        expired.len()
    }
}

/// In-process store: an ordered map under one lock, with TTL support and
/// in-process change broadcast.
#[derive(Debug)]
pub struct MemDriver {
    state: Arc<MemState>,
    closed: AtomicBool,
    op_timeout: Duration,
}

impl MemDriver {
    /// Must be called inside a tokio runtime; starts the TTL sweeper.
    pub fn new(
        config: &MemoryConfig,
        watch: &WatchConfig,
    ) -> Self {
        let op_timeout = Duration::from_millis(config.op_timeout);
        let delivery_timeout = watch.delivery_timeout.map(Duration::from_millis).unwrap_or(op_timeout);
        let hub = WatchHub::new(NAME, delivery_timeout, watch.filter_dup_notifs);
        let state = Arc::new(MemState {
            table: RwLock::new(MemTable::default()),
            hub: hub.clone(),
        });

        let sweep_interval = Duration::from_millis(config.ttl_sweep_interval);
        let sweeper = state.clone();
        let shutdown = hub.shutdown_token().clone();
        hub.spawn("memory-ttl-sweeper", async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        let removed = sweeper.sweep();
                        if removed > 0 {
                            trace!("[{}] expired {} keys", NAME, removed);
                        }
                    }
                }
            }
        });

        Self {
            state,
            closed: AtomicBool::new(false),
            op_timeout,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("memory driver"));
        }
        Ok(())
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state.table.read().entries.values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_put(
        &self,
        table: &mut MemTable,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        revision: u64,
    ) {
        let now = Instant::now();
        let prev = table
            .entries
            .insert(
                key.to_string(),
                MemEntry {
                    value: value.to_vec(),
                    revision,
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            )
            .filter(|e| e.is_live(now))
            .map(|e| e.value);
        self.state.hub.publish(ChangeEvent::put(key, value.to_vec(), prev, revision));
    }

    fn apply_delete(
        &self,
        table: &mut MemTable,
        key: &str,
        revision: u64,
    ) -> bool {
        match table.entries.remove(key) {
            Some(old) if old.is_live(Instant::now()) => {
                self.state.hub.publish(ChangeEvent::delete(key, Some(old.value), revision));
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl KvDriver for MemDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            txn: true,
            ttl: true,
            revisions: true,
            writable: true,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[instrument(skip(self, value))]
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        opts: PutOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        with_timeout(NAME, "put", self.op_timeout, async {
            let mut table = self.state.table.write();
            let revision = table.next_revision();
            self.apply_put(&mut table, key, value, opts.ttl, revision);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Versioned>> {
        self.ensure_open()?;
        validate_key(key)?;
        let table = self.state.table.read();
        Ok(table.live(key, Instant::now()).map(|e| Versioned {
            value: e.value.clone(),
            revision: e.revision,
        }))
    }

    #[instrument(skip(self))]
    async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<bool> {
        self.ensure_open()?;
        if !opts.prefix {
            validate_key(key)?;
        }
        with_timeout(NAME, "delete", self.op_timeout, async {
            let mut table = self.state.table.write();
            let keys: Vec<String> = if opts.prefix {
                table.scan(key, Instant::now()).map(|(k, _)| k.clone()).collect()
            } else {
                vec![key.to_string()]
            };
            if keys.is_empty() {
                return Ok(false);
            }
            let revision = table.next_revision();
            let mut existed = false;
            for k in &keys {
                existed |= self.apply_delete(&mut table, k, revision);
            }
            Ok(existed)
        })
        .await
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.ensure_open()?;
        let table = self.state.table.read();
        let items: Vec<KeyVal> = table
            .scan(prefix, Instant::now())
            .map(|(k, e)| KeyVal {
                key: k.clone(),
                revision: e.revision,
            })
            .collect();
        Ok(KeyIterator::from_vec(items))
    }

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator> {
        self.ensure_open()?;
        let table = self.state.table.read();
        let items: Vec<KvPair> = table
            .scan(prefix, Instant::now())
            .map(|(k, e)| KvPair {
                key: k.clone(),
                value: e.value.clone(),
                revision: e.revision,
            })
            .collect();
        Ok(KvIterator::from_vec(items))
    }

    #[instrument(skip(self, ops), fields(ops = ops.len()))]
    async fn commit(
        &self,
        ops: Vec<TxnOp>,
    ) -> Result<()> {
        self.ensure_open()?;
        for op in &ops {
            validate_key(op.key())?;
        }
        let ops = coalesce_ops(ops);
        with_timeout(NAME, "commit", self.op_timeout, async {
            let mut table = self.state.table.write();
            let revision = table.next_revision();
            for op in &ops {
                match op {
                    TxnOp::Put { key, value } => self.apply_put(&mut table, key, value, None, revision),
                    TxnOp::Delete { key } => {
                        self.apply_delete(&mut table, key, revision);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn watch(
        &self,
        request: WatchRequest,
    ) -> Result<()> {
        self.ensure_open()?;
        self.state.hub.subscribe(request)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.hub.close().await;
        debug!("[{}] driver closed", NAME);
        Ok(())
    }
}
