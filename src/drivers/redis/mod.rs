//! Redis driver, single node or cluster.
//!
//! Redis keeps no revisions, every revision is 0. Watches subscribe to
//! keyspace notifications and read the key after each one; the previous
//! value is whatever the watch last saw.

mod slot;

pub(crate) use slot::*;

#[cfg(test)]
mod slot_test;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionLike;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::Cmd;
use redis::ConnectionInfo;
use redis::IntoConnectionInfo;
use redis::Pipeline;
use redis::RedisFuture;
use redis::Value;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use crate::kv::coalesce_ops;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::utils::async_task::with_timeout;
use crate::utils::async_task::BackoffPolicy;
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
use crate::PutOptions;
use crate::RedisConfig;
use crate::Result;
use crate::Subscription;
use crate::TxnOp;
use crate::Versioned;
use crate::WatchConfig;
use crate::WatchHub;
use crate::WatchRequest;
use crate::WatchedKey;

const NAME: &str = "redis";
const SCAN_COUNT: usize = 500;

type KeyspaceStream = BoxStream<'static, redis::Msg>;

/// Data connection of either topology
#[derive(Clone)]
enum RedisConn {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConn {
    fn req_packed_command<'a>(
        &'a mut self,
        cmd: &'a Cmd,
    ) -> RedisFuture<'a, Value> {
        match self {
            RedisConn::Single(conn) => conn.req_packed_command(cmd),
            RedisConn::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            RedisConn::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConn::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConn::Single(conn) => conn.get_db(),
            RedisConn::Cluster(conn) => conn.get_db(),
        }
    }
}

/// Driver over a Redis node or cluster
pub struct RedisDriver {
    conn: RedisConn,
    /// Node that carries keyspace notification subscriptions
    pubsub: redis::Client,
    cluster: bool,
    hub: Arc<WatchHub>,
    closed: AtomicBool,
    op_timeout: Duration,
    reconnect: BackoffPolicy,
}

impl std::fmt::Debug for RedisDriver {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RedisDriver")
            .field("cluster", &self.cluster)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl RedisDriver {
    pub async fn connect(
        config: &RedisConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let nodes = connection_infos(config)?;
        let first = nodes.first().cloned().ok_or_else(|| Error::invalid("redis.endpoints is empty"))?;
        let dial_timeout = Duration::from_millis(config.dial_timeout);
        let cluster = config.is_cluster();

        let connecting = async {
            if cluster {
                let mut builder = ClusterClient::builder(nodes.clone());
                if let Some(password) = &config.password {
                    builder = builder.password(password.clone());
                }
                let client = builder.build()?;
                Ok::<_, Error>(RedisConn::Cluster(client.get_async_connection().await?))
            } else {
                let client = redis::Client::open(first.clone())?;
                Ok(RedisConn::Single(client.get_multiplexed_async_connection().await?))
            }
        };
        let conn = tokio::time::timeout(dial_timeout, connecting)
            .await
            .map_err(|_| Error::Timeout {
                op: "connect",
                after: dial_timeout,
            })??;
        info!(
            "[{}] connected to {} ({})",
            NAME,
            config.endpoints.join(","),
            if cluster { "cluster" } else { "single node" }
        );

        let op_timeout = Duration::from_millis(config.op_timeout);
        let delivery_timeout = watch.delivery_timeout.map(Duration::from_millis).unwrap_or(op_timeout);
        let driver = Self {
            conn,
            pubsub: redis::Client::open(first)?,
            cluster,
            hub: WatchHub::new(NAME, delivery_timeout, watch.filter_dup_notifs),
            closed: AtomicBool::new(false),
            op_timeout,
            reconnect: watch.reconnect_policy(),
        };
        driver.enable_keyspace_events().await;
        Ok(driver)
    }

    /// Keyspace notifications are off by default; managed services may
    /// refuse CONFIG, which only affects watches.
    async fn enable_keyspace_events(&self) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KA")
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            debug!("[{}] could not enable keyspace notifications: {}", NAME, e);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("redis driver"));
        }
        Ok(())
    }

    /// Keys under `prefix`, sorted
    async fn scan_keys(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = if self.cluster {
            redis::cmd("KEYS").arg(&pattern).query_async(&mut conn).await?
        } else {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys
        };
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Keyspace subscriptions of every watched key, live once this returns
    async fn open_streams(
        &self,
        subscription: &Subscription,
    ) -> Result<Vec<(WatchedKey, KeyspaceStream)>> {
        let mut streams = Vec::new();
        for watched in subscription.watched_keys() {
            let stream = open_keyspace(self.pubsub.clone(), watched.key.clone()).await?;
            streams.push((watched, stream));
        }
        Ok(streams)
    }

    async fn read(
        &self,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }
}

/// Pattern subscription on the keyspace channels under `key`
async fn open_keyspace(
    pubsub: redis::Client,
    key: String,
) -> Result<KeyspaceStream> {
    let mut channel = pubsub.get_async_pubsub().await?;
    channel.psubscribe(keyspace_pattern(&key)).await?;
    Ok(channel.into_on_message().boxed())
}

/// Keyspace notification loop of one watched prefix.
///
/// A lost subscription is re-established with backoff; notifications sent
/// in between are gone. When the `reconnect` window runs out the
/// subscription is cancelled.
async fn watch_key(
    pubsub: redis::Client,
    mut conn: RedisConn,
    subscription: Arc<Subscription>,
    watched: WatchedKey,
    mut messages: KeyspaceStream,
    reconnect: BackoffPolicy,
) -> Result<()> {
    let WatchedKey { key, token } = watched;
    debug!("[{}] keyspace subscription for {}", NAME, key);

    let mut last_seen: HashMap<String, Vec<u8>> = HashMap::new();
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = messages.next() => msg,
        };
        let Some(msg) = msg else {
            warn!("[{}] keyspace subscription for {} ended, re-subscribing", NAME, key);
            let reopened = tokio::select! {
                _ = token.cancelled() => break,
                reopened = task_with_timeout_and_exponential_backoff(
                    || open_keyspace(pubsub.clone(), key.clone()),
                    reconnect,
                    Error::is_transient,
                ) => reopened,
            };
            match reopened {
                Ok(stream) => {
                    messages = stream;
                    last_seen.clear();
                    info!("[{}] keyspace subscription for {} restored", NAME, key);
                    continue;
                }
                Err(e) => {
                    error!("[{}] giving up on the watch of {}: {}", NAME, key, e);
                    subscription.cancel("redis keyspace subscription lost");
                    return Err(e);
                }
            }
        };
        let Some(changed) = key_from_channel(msg.get_channel_name()).map(str::to_string) else {
            continue;
        };
        let op: String = match msg.get_payload() {
            Ok(op) => op,
            Err(e) => {
                warn!("[{}] unreadable notification for {}: {}", NAME, changed, e);
                continue;
            }
        };
        trace!("[{}] keyspace {} on {}", NAME, op, changed);

        let event = if is_removal(&op) {
            ChangeEvent::delete(changed.clone(), last_seen.remove(&changed), 0)
        } else {
            let current: Option<Vec<u8>> = match redis::cmd("GET").arg(&changed).query_async(&mut conn).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("[{}] reading {} after {} failed: {}", NAME, changed, op, e);
                    continue;
                }
            };
            match current {
                Some(value) => {
                    let prev = last_seen.insert(changed.clone(), value.clone());
                    ChangeEvent::put(changed.clone(), value, prev, 0)
                }
                // gone again, or not a string value
                None => match last_seen.remove(&changed) {
                    Some(prev) => ChangeEvent::delete(changed.clone(), Some(prev), 0),
                    None => continue,
                },
            }
        };
        subscription.deliver_from(&key, event);
    }
    Ok(())
}

#[async_trait]
impl KvDriver for RedisDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            txn: true,
            ttl: true,
            revisions: false,
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
        let mut conn = self.conn.clone();
        with_timeout(NAME, "put", self.op_timeout, async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = opts.ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            let _: () = cmd.query_async(&mut conn).await?;
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
        let value = with_timeout(NAME, "get", self.op_timeout, self.read(key)).await?;
        Ok(value.map(|value| Versioned { value, revision: 0 }))
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
            let keys = if opts.prefix {
                self.scan_keys(key).await?
            } else {
                vec![key.to_string()]
            };
            let mut conn = self.conn.clone();
            let mut removed: i64 = 0;
            // one DEL per key so cluster mode never sends a cross-slot command
            for k in &keys {
                let n: i64 = redis::cmd("DEL").arg(k).query_async(&mut conn).await?;
                removed += n;
            }
            Ok(removed > 0)
        })
        .await
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.ensure_open()?;
        let keys = with_timeout(NAME, "list_keys", self.op_timeout, self.scan_keys(prefix)).await?;
        Ok(KeyIterator::from_vec(
            keys.into_iter().map(|key| KeyVal { key, revision: 0 }).collect(),
        ))
    }

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator> {
        self.ensure_open()?;
        let items = with_timeout(NAME, "list_values", self.op_timeout, async {
            let mut items = Vec::new();
            for key in self.scan_keys(prefix).await? {
                // removed between SCAN and GET
                if let Some(value) = self.read(&key).await? {
                    items.push(KvPair {
                        key,
                        value,
                        revision: 0,
                    });
                }
            }
            Ok(items)
        })
        .await?;
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
        if ops.is_empty() {
            return Ok(());
        }
        if self.cluster {
            let slots = slots_of(&ops);
            if slots.len() > 1 {
                return Err(Error::CrossSlot(slots));
            }
        }
        let mut conn = self.conn.clone();
        with_timeout(NAME, "commit", self.op_timeout, async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in &ops {
                match op {
                    TxnOp::Put { key, value } => pipe.cmd("SET").arg(key).arg(value.as_slice()).ignore(),
                    TxnOp::Delete { key } => pipe.cmd("DEL").arg(key).ignore(),
                };
            }
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn watch(
        &self,
        request: WatchRequest,
    ) -> Result<()> {
        self.ensure_open()?;
        let subscription = self.hub.subscribe(request)?;
        let streams = match with_timeout(NAME, "watch", self.op_timeout, self.open_streams(&subscription)).await {
            Ok(streams) => streams,
            Err(e) => {
                subscription.cancel("keyspace subscription failed");
                return Err(e);
            }
        };
        for (watched, stream) in streams {
            let name = format!("redis-keyspace-{}-{}", subscription.id(), watched.key);
            self.hub.spawn(
                &name,
                watch_key(
                    self.pubsub.clone(),
                    self.conn.clone(),
                    subscription.clone(),
                    watched,
                    stream,
                    self.reconnect,
                ),
            );
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.hub.close().await;
        info!("[{}] driver closed", NAME);
        Ok(())
    }
}

fn connection_infos(config: &RedisConfig) -> Result<Vec<ConnectionInfo>> {
    config
        .endpoints
        .iter()
        .map(|endpoint| {
            let mut info = endpoint.as_str().into_connection_info()?;
            if config.password.is_some() {
                info.redis.password = config.password.clone();
            }
            if !config.is_cluster() {
                info.redis.db = config.db;
            }
            Ok(info)
        })
        .collect()
}
