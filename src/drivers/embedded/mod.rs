//! Embedded single-file driver on sled.
//!
//! The database is opened exclusively, so every change goes through this
//! driver: writes are serialised, each write captures the value it replaced
//! and the resulting before/after pair is published to the watch hub.

mod layout;

pub(crate) use layout::*;


use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use sled::Tree;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::kv::coalesce_ops;
use crate::constants::LAYOUT_META_KEY;
use crate::constants::LAYOUT_META_TREE;
use crate::constants::ROOT_BUCKET;
use crate::errors::BackendError;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::utils::async_task::with_timeout;
use crate::utils::async_task::BackoffPolicy;
use crate::utils::validate_key;
use crate::Capabilities;
use crate::ChangeEvent;
use crate::DeleteOptions;
use crate::EmbeddedConfig;
use crate::Error;
use crate::KeyIterator;
use crate::KeyVal;
use crate::KvDriver;
use crate::KvIterator;
use crate::KvPair;
use crate::ListIter;
use crate::PutOptions;
use crate::Result;
use crate::TxnOp;
use crate::Versioned;
use crate::WatchConfig;
use crate::WatchHub;
use crate::WatchRequest;

const NAME: &str = "embedded";

/// Driver over one sled database file
#[derive(Debug)]
pub struct EmbeddedDriver {
    db: sled::Db,
    layout: BucketLayout,
    buckets: DashMap<String, Tree>,
    write_lock: Mutex<()>,
    hub: Arc<WatchHub>,
    closed: AtomicBool,
    op_timeout: Duration,
}

impl EmbeddedDriver {
    /// Opens (or creates) the database, retrying for `lock-timeout` while
    /// another process holds it.
    pub async fn open(
        config: &EmbeddedConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let layout = BucketLayout::from_config(config);
        let db = open_with_lock_retry(config).await?;
        check_layout(&db, &layout, &config.db_path)?;

        let buckets = DashMap::new();
        for name in db.tree_names() {
            let name = String::from_utf8_lossy(&name).to_string();
            if is_bucket_name(&name) {
                buckets.insert(name.clone(), db.open_tree(&name)?);
            }
        }
        if !buckets.contains_key(ROOT_BUCKET) {
            buckets.insert(ROOT_BUCKET.to_string(), db.open_tree(ROOT_BUCKET)?);
        }

        let op_timeout = Duration::from_millis(config.op_timeout);
        let delivery_timeout = watch.delivery_timeout.map(Duration::from_millis).unwrap_or(op_timeout);
        info!(
            "[{}] opened {} in {} mode with {} buckets",
            NAME,
            config.db_path,
            layout.tag(),
            buckets.len()
        );

        Ok(Self {
            db,
            layout,
            buckets,
            write_lock: Mutex::new(()),
            hub: WatchHub::new(NAME, delivery_timeout, watch.filter_dup_notifs),
            closed: AtomicBool::new(false),
            op_timeout,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("embedded driver"));
        }
        Ok(())
    }

    /// Existing bucket, or a freshly created one when `create` is set
    fn bucket(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Option<Tree>> {
        if let Some(tree) = self.buckets.get(name) {
            return Ok(Some(tree.clone()));
        }
        if !create {
            return Ok(None);
        }
        let tree = self.db.open_tree(name)?;
        self.buckets.insert(name.to_string(), tree.clone());
        debug!("[{}] created bucket {:?}", NAME, name);
        Ok(Some(tree))
    }

    fn next_revision(&self) -> Result<u64> {
        Ok(self.db.generate_id()? + 1)
    }

    fn sorted_bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Entries under `prefix` across buckets, sorted by key
    fn collect_entries<T>(
        &self,
        prefix: &str,
        make: fn(String, StoredValue) -> T,
        key_of: fn(&T) -> &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for name in self.sorted_bucket_names() {
            let Some(scope) = self.layout.scan_scope(&name, prefix) else {
                continue;
            };
            let Some(tree) = self.bucket(&name, false)? else {
                continue;
            };
            for item in tree.scan_prefix(scope.as_bytes()) {
                let (k, v) = item?;
                let inner = decode_key(&k)?;
                items.push(make(self.layout.full_key(&name, &inner), decode_value(&v)?));
            }
        }
        items.sort_by(|a, b| key_of(a).cmp(key_of(b)));
        Ok(items)
    }

    /// Lazy cursor in flat mode, sorted snapshot across buckets in tree mode
    fn scan<T: Send + 'static>(
        &self,
        prefix: &str,
        make: fn(String, StoredValue) -> T,
        key_of: fn(&T) -> &str,
    ) -> Result<ListIter<T>> {
        self.ensure_open()?;
        if self.layout != BucketLayout::Flat {
            return Ok(ListIter::from_vec(self.collect_entries(prefix, make, key_of)?));
        }
        let Some(tree) = self.bucket(ROOT_BUCKET, false)? else {
            return Ok(ListIter::empty());
        };
        let cursor = tree.scan_prefix(prefix.as_bytes()).map(move |item| {
            let (k, v) = item?;
            Ok(make(decode_key(&k)?, decode_value(&v)?))
        });
        Ok(ListIter::from_lazy(cursor))
    }

    /// Applies `ops` in one multi-bucket transaction and publishes the changes.
    fn apply(
        &self,
        ops: &[TxnOp],
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let revision = self.next_revision()?;

        let mut bucket_index: HashMap<&str, usize> = HashMap::new();
        let mut trees: Vec<Tree> = Vec::new();
        let mut planned: Vec<(usize, &TxnOp, &str, Option<Vec<u8>>)> = Vec::with_capacity(ops.len());
        for op in ops {
            let (bucket, inner) = self.layout.locate(op.key());
            let idx = match bucket_index.get(bucket) {
                Some(idx) => *idx,
                None => {
                    let create = matches!(op, TxnOp::Put { .. });
                    let Some(tree) = self.bucket(bucket, create)? else {
                        // nothing to delete in a bucket that does not exist
                        continue;
                    };
                    trees.push(tree);
                    bucket_index.insert(bucket, trees.len() - 1);
                    trees.len() - 1
                }
            };
            let encoded = match op {
                TxnOp::Put { value, .. } => Some(bincode::serialize(&StoredValue {
                    revision,
                    data: value.clone(),
                })?),
                TxnOp::Delete { .. } => None,
            };
            planned.push((idx, op, inner, encoded));
        }
        if planned.is_empty() {
            return Ok(());
        }

        let replaced = trees
            .as_slice()
            .transaction(|views| {
                let mut replaced = Vec::with_capacity(planned.len());
                for (idx, _, inner, encoded) in &planned {
                    let view = &views[*idx];
                    let prev = match encoded {
                        Some(bytes) => view.insert(inner.as_bytes(), bytes.as_slice())?,
                        None => view.remove(inner.as_bytes())?,
                    };
                    replaced.push(prev);
                }
                Ok::<_, ConflictableTransactionError<Error>>(replaced)
            })
            .map_err(Error::from)?;

        for ((_, op, _, _), prev) in planned.iter().zip(replaced) {
            let prev = prev.and_then(|raw| match decode_value(&raw) {
                Ok(stored) => Some(stored.data),
                Err(e) => {
                    warn!("[{}] unreadable previous value of {}: {}", NAME, op.key(), e);
                    None
                }
            });
            match op {
                TxnOp::Put { key, value } => {
                    self.hub.publish(ChangeEvent::put(key.clone(), value.clone(), prev, revision));
                }
                TxnOp::Delete { key } => {
                    if prev.is_some() {
                        self.hub.publish(ChangeEvent::delete(key.clone(), prev, revision));
                    }
                }
            }
        }
        debug!("[{}] applied {} ops at revision {}", NAME, planned.len(), revision);
        Ok(())
    }

    /// Current value of `key`, read straight from its bucket
    fn read(
        &self,
        key: &str,
    ) -> Result<Option<StoredValue>> {
        let (bucket, inner) = self.layout.locate(key);
        let Some(tree) = self.bucket(bucket, false)? else {
            return Ok(None);
        };
        match tree.get(inner.as_bytes())? {
            Some(raw) => decode_value(&raw).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl KvDriver for EmbeddedDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            txn: true,
            ttl: false,
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
        if opts.ttl.is_some() {
            return Err(Error::Unsupported { backend: NAME, op: "put-ttl" });
        }
        let op = TxnOp::Put {
            key: key.to_string(),
            value: value.to_vec(),
        };
        with_timeout(NAME, "put", self.op_timeout, async { self.apply(std::slice::from_ref(&op)) }).await
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Versioned>> {
        self.ensure_open()?;
        validate_key(key)?;
        with_timeout(NAME, "get", self.op_timeout, async {
            Ok(self.read(key)?.map(|stored| Versioned {
                value: stored.data,
                revision: stored.revision,
            }))
        })
        .await
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
            let keys: Vec<String> = if opts.prefix {
                self.collect_entries(key, |key, _| key, |key| key.as_str())?
            } else if self.read(key)?.is_some() {
                vec![key.to_string()]
            } else {
                Vec::new()
            };
            if keys.is_empty() {
                return Ok(false);
            }
            let ops: Vec<TxnOp> = keys.into_iter().map(|key| TxnOp::Delete { key }).collect();
            self.apply(&ops)?;
            Ok(true)
        })
        .await
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.scan(
            prefix,
            |key, stored| KeyVal {
                key,
                revision: stored.revision,
            },
            |kv| kv.key.as_str(),
        )
    }

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator> {
        self.scan(
            prefix,
            |key, stored| KvPair {
                key,
                value: stored.data,
                revision: stored.revision,
            },
            |kv| kv.key.as_str(),
        )
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
        with_timeout(NAME, "commit", self.op_timeout, async { self.apply(&ops) }).await
    }

    async fn watch(
        &self,
        request: WatchRequest,
    ) -> Result<()> {
        self.ensure_open()?;
        self.hub.subscribe(request)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.hub.close().await;
        let flushed = self.db.flush_async().await;
        info!("[{}] database closed", NAME);
        flushed.map(|_| ()).map_err(Error::from)
    }
}

fn is_bucket_name(name: &str) -> bool {
    name != LAYOUT_META_TREE && !name.starts_with("__sled__")
}

fn decode_key(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|e| Error::invalid(format!("stored key is not utf-8: {e}")))
}

fn decode_value(raw: &[u8]) -> Result<StoredValue> {
    Ok(bincode::deserialize(raw)?)
}

fn open_db(config: &EmbeddedConfig) -> Result<sled::Db> {
    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = sled::Config::default()
        .path(&config.db_path)
        .cache_capacity(config.cache_capacity)
        .use_compression(true)
        .open()?;
    Ok(db)
}

fn is_lock_error(e: &Error) -> bool {
    match e {
        Error::Unavailable(BackendError::Sled(sled::Error::Io(io))) => {
            io.kind() == io::ErrorKind::WouldBlock || io.to_string().contains("lock")
        }
        _ => false,
    }
}

async fn open_with_lock_retry(config: &EmbeddedConfig) -> Result<sled::Db> {
    let attempt = || {
        let config = config.clone();
        async move { tokio::task::spawn_blocking(move || open_db(&config)).await? }
    };
    if config.lock_timeout == 0 {
        return attempt().await;
    }
    let policy = BackoffPolicy::spanning(Duration::from_millis(config.lock_timeout), 50);
    task_with_timeout_and_exponential_backoff(attempt, policy, is_lock_error).await
}

/// Records the layout on first open and rejects a different one later.
fn check_layout(
    db: &sled::Db,
    layout: &BucketLayout,
    path: &str,
) -> Result<()> {
    let meta = db.open_tree(LAYOUT_META_TREE)?;
    let tag = layout.tag();
    match meta.get(LAYOUT_META_KEY)? {
        Some(stored) if stored.as_ref() == tag.as_bytes() => Ok(()),
        Some(stored) => Err(Error::invalid(format!(
            "database {} was created in {} mode, configured {}",
            path,
            String::from_utf8_lossy(&stored),
            tag
        ))),
        None => {
            meta.insert(LAYOUT_META_KEY, tag.as_bytes())?;
            Ok(())
        }
    }
}
