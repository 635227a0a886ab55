//! etcd v3 driver.
//!
//! Values map one to one onto etcd keys, revisions are `mod_revision`. Each
//! watched key gets its own native watch stream with `prev_kv` so events
//! carry the replaced value.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::Certificate;
use etcd_client::Client;
use etcd_client::Compare;
use etcd_client::CompareOp;
use etcd_client::ConnectOptions;
use etcd_client::DeleteOptions as EtcdDeleteOptions;
use etcd_client::EventType;
use etcd_client::GetOptions;
use etcd_client::Identity;
use etcd_client::PutOptions as EtcdPutOptions;
use etcd_client::TlsOptions;
use etcd_client::Txn as EtcdTxn;
use etcd_client::TxnOp as EtcdTxnOp;
use etcd_client::WatchOptions;
use etcd_client::WatchStream;
use etcd_client::Watcher;
use tokio_util::sync::CancellationToken;
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
use crate::EtcdConfig;
use crate::KeyIterator;
use crate::KeyVal;
use crate::KvDriver;
use crate::KvIterator;
use crate::KvPair;
use crate::PutOptions;
use crate::Result;
use crate::Subscription;
use crate::TlsConfig;
use crate::TxnOp;
use crate::Versioned;
use crate::WatchConfig;
use crate::WatchHub;
use crate::WatchRequest;
use crate::WatchedKey;

const NAME: &str = "etcd";

type OpenedStream = (Watcher, WatchStream);

/// Driver over an etcd v3 cluster
pub struct EtcdDriver {
    client: Client,
    hub: Arc<WatchHub>,
    closed: AtomicBool,
    op_timeout: Duration,
    reconnect: BackoffPolicy,
}

impl std::fmt::Debug for EtcdDriver {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdDriver")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl EtcdDriver {
    pub async fn connect(
        config: &EtcdConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let endpoints = normalize_endpoints(&config.endpoints, config.tls.enabled());
        let options = connect_options(config).await?;

        let client = tokio::time::timeout(config.dial_timeout(), Client::connect(&endpoints, Some(options)))
            .await
            .map_err(|_| Error::Timeout {
                op: "connect",
                after: config.dial_timeout(),
            })??;
        info!("[{}] connected to {:?}", NAME, endpoints);

        let op_timeout = config.op_timeout();
        let delivery_timeout = watch.delivery_timeout.map(Duration::from_millis).unwrap_or(op_timeout);
        let driver = Self {
            client,
            hub: WatchHub::new(NAME, delivery_timeout, watch.filter_dup_notifs),
            closed: AtomicBool::new(false),
            op_timeout,
            reconnect: watch.reconnect_policy(),
        };
        if config.auto_compact > 0 {
            driver.start_auto_compact(Duration::from_millis(config.auto_compact));
        }
        Ok(driver)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("etcd driver"));
        }
        Ok(())
    }

    /// Compacts history up to the current revision every `interval`.
    fn start_auto_compact(
        &self,
        interval: Duration,
    ) {
        let mut client = self.client.clone();
        let shutdown = self.hub.shutdown_token().clone();
        self.hub.spawn("etcd-auto-compact", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        let resp = client.get("", Some(GetOptions::new().with_all_keys().with_keys_only().with_limit(1))).await;
                        let revision = match resp {
                            Ok(resp) => resp.header().map(|h| h.revision()).unwrap_or(0),
                            Err(e) => {
                                warn!("[{}] auto-compact could not read revision: {}", NAME, e);
                                continue;
                            }
                        };
                        if revision <= 0 {
                            continue;
                        }
                        match client.compact(revision, None).await {
                            Ok(_) => debug!("[{}] compacted up to revision {}", NAME, revision),
                            Err(e) => warn!("[{}] auto-compact at {} failed: {}", NAME, revision, e),
                        }
                    }
                }
            }
        });
    }

    /// Puts `value` only if the current value equals `expected`.
    #[instrument(skip(self, expected, value))]
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let txn = EtcdTxn::new()
            .when(vec![Compare::value(key, CompareOp::Equal, expected)])
            .and_then(vec![EtcdTxnOp::put(key, value, None)]);
        self.conditional("compare_and_swap", key, txn).await
    }

    /// Deletes `key` only if its current value equals `expected`.
    #[instrument(skip(self, expected))]
    pub async fn compare_and_delete(
        &self,
        key: &str,
        expected: &[u8],
    ) -> Result<()> {
        let txn = EtcdTxn::new()
            .when(vec![Compare::value(key, CompareOp::Equal, expected)])
            .and_then(vec![EtcdTxnOp::delete(key, None)]);
        self.conditional("compare_and_delete", key, txn).await
    }

    /// Creates `key`; fails with `Conflict` when it already exists.
    #[instrument(skip(self, value))]
    pub async fn put_if_not_exists(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let txn = EtcdTxn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![EtcdTxnOp::put(key, value, None)]);
        self.conditional("put_if_not_exists", key, txn).await
    }

    async fn conditional(
        &self,
        op: &'static str,
        key: &str,
        txn: EtcdTxn,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        let mut client = self.client.clone();
        with_timeout(NAME, op, self.op_timeout, async move {
            let resp = client.txn(txn).await?;
            if !resp.succeeded() {
                return Err(Error::Conflict(format!("{op} precondition failed for {key}")));
            }
            Ok(())
        })
        .await
    }

    /// Pins the subscription at the current store revision and opens one
    /// native stream per watched key, starting right after it.
    async fn open_streams(
        &self,
        subscription: &Subscription,
    ) -> Result<Vec<(WatchedKey, i64, OpenedStream)>> {
        let mut client = self.client.clone();
        let resp = client.get("", Some(GetOptions::new().with_all_keys().with_count_only())).await?;
        let start = resp.header().map(|h| h.revision()).unwrap_or(0) + 1;

        let mut streams = Vec::new();
        for watched in subscription.watched_keys() {
            let opened = open_stream(client.clone(), watched.key.clone(), start).await?;
            streams.push((watched, start, opened));
        }
        Ok(streams)
    }
}

/// Prefix watch on `key` with previous values, replaying from `start_revision`
async fn open_stream(
    mut client: Client,
    key: String,
    start_revision: i64,
) -> Result<OpenedStream> {
    let options = WatchOptions::new()
        .with_prefix()
        .with_prev_key()
        .with_start_revision(start_revision);
    Ok(client.watch(key.as_str(), Some(options)).await?)
}

/// Why [`pump`] returned
enum StreamEnd {
    Cancelled,
    Broken(String),
}

/// Forwards events of one stream until it breaks or `token` fires.
/// `next_revision` tracks where a re-opened stream has to resume.
async fn pump(
    subscription: &Subscription,
    key: &str,
    token: &CancellationToken,
    stream: &mut WatchStream,
    next_revision: &mut i64,
) -> StreamEnd {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return StreamEnd::Cancelled,
            message = stream.message() => message,
        };
        let resp = match message {
            Ok(Some(resp)) => resp,
            Ok(None) => return StreamEnd::Broken("ended by the server".into()),
            Err(e) => return StreamEnd::Broken(e.to_string()),
        };
        if resp.canceled() {
            if resp.compact_revision() > *next_revision {
                warn!(
                    "[{}] history of {} compacted, changes before revision {} are lost",
                    NAME,
                    key,
                    resp.compact_revision()
                );
                *next_revision = resp.compact_revision();
            }
            return StreamEnd::Broken(format!("cancelled by the server: {}", resp.cancel_reason()));
        }
        for event in resp.events() {
            let Some(kv) = event.kv() else {
                continue;
            };
            *next_revision = (*next_revision).max(kv.mod_revision() + 1);
            let event_key = String::from_utf8_lossy(kv.key()).to_string();
            let revision = kv.mod_revision().max(0) as u64;
            let prev = event.prev_kv().map(|p| p.value().to_vec());
            let change = match event.event_type() {
                EventType::Put => ChangeEvent::put(event_key, kv.value().to_vec(), prev, revision),
                EventType::Delete => ChangeEvent::delete(event_key, prev, revision),
            };
            trace!("[{}] {:?} {}", NAME, change.kind, change.key);
            subscription.deliver_from(key, change);
        }
    }
}

/// Runs the native watch of one key until its token is cancelled.
///
/// A broken stream is re-opened at the revision after the last one seen,
/// so nothing is skipped or replayed. When re-opening keeps failing for the
/// whole `reconnect` window the subscription is cancelled.
async fn watch_key(
    client: Client,
    subscription: Arc<Subscription>,
    watched: WatchedKey,
    mut next_revision: i64,
    opened: OpenedStream,
    reconnect: BackoffPolicy,
) -> Result<()> {
    let WatchedKey { key, token } = watched;
    let (mut watcher, mut stream) = opened;
    debug!("[{}] native watch started for {} at revision {}", NAME, key, next_revision);

    loop {
        let end = pump(&subscription, &key, &token, &mut stream, &mut next_revision).await;
        if let Err(e) = watcher.cancel().await {
            debug!("[{}] cancelling watch for {}: {}", NAME, key, e);
        }
        let reason = match end {
            StreamEnd::Cancelled => return Ok(()),
            StreamEnd::Broken(reason) => reason,
        };
        warn!(
            "[{}] watch stream for {} broke ({}), re-opening at revision {}",
            NAME, key, reason, next_revision
        );

        let reopened = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            reopened = task_with_timeout_and_exponential_backoff(
                || open_stream(client.clone(), key.clone(), next_revision),
                reconnect,
                Error::is_transient,
            ) => reopened,
        };
        match reopened {
            Ok(opened) => {
                (watcher, stream) = opened;
                info!("[{}] watch for {} resumed", NAME, key);
            }
            Err(e) => {
                error!("[{}] giving up on the watch of {}: {}", NAME, key, e);
                subscription.cancel("etcd watch stream lost");
                return Err(e);
            }
        }
    }
}

#[async_trait]
impl KvDriver for EtcdDriver {
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
        let mut client = self.client.clone();
        with_timeout(NAME, "put", self.op_timeout, async move {
            let options = match opts.ttl {
                Some(ttl) => {
                    let lease = client.lease_grant(ttl_seconds(ttl), None).await?;
                    Some(EtcdPutOptions::new().with_lease(lease.id()))
                }
                None => None,
            };
            client.put(key, value, options).await?;
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
        let mut client = self.client.clone();
        with_timeout(NAME, "get", self.op_timeout, async move {
            let resp = client.get(key, None).await?;
            Ok(resp.kvs().first().map(|kv| Versioned {
                value: kv.value().to_vec(),
                revision: kv.mod_revision().max(0) as u64,
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
        let mut client = self.client.clone();
        with_timeout(NAME, "delete", self.op_timeout, async move {
            let options = opts.prefix.then(|| EtcdDeleteOptions::new().with_prefix());
            let resp = client.delete(key, options).await?;
            Ok(resp.deleted() > 0)
        })
        .await
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let items = with_timeout(NAME, "list_keys", self.op_timeout, async move {
            let resp = client.get(prefix, Some(range_options(prefix).with_keys_only())).await?;
            resp.kvs()
                .iter()
                .map(|kv| {
                    Ok(KeyVal {
                        key: kv.key_str()?.to_string(),
                        revision: kv.mod_revision().max(0) as u64,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .await?;
        Ok(KeyIterator::from_vec(items))
    }

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let items = with_timeout(NAME, "list_values", self.op_timeout, async move {
            let resp = client.get(prefix, Some(range_options(prefix))).await?;
            resp.kvs()
                .iter()
                .map(|kv| {
                    Ok(KvPair {
                        key: kv.key_str()?.to_string(),
                        value: kv.value().to_vec(),
                        revision: kv.mod_revision().max(0) as u64,
                    })
                })
                .collect::<Result<Vec<_>>>()
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
        let mut client = self.client.clone();
        with_timeout(NAME, "commit", self.op_timeout, async move {
            let resp = client.txn(EtcdTxn::new().and_then(to_etcd_ops(&ops))).await?;
            if !resp.succeeded() {
                return Err(Error::Conflict("etcd transaction was not applied".into()));
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
        let subscription = self.hub.subscribe(request)?;
        let streams = match with_timeout(NAME, "watch", self.op_timeout, self.open_streams(&subscription)).await {
            Ok(streams) => streams,
            Err(e) => {
                subscription.cancel("native watch could not be opened");
                return Err(e);
            }
        };
        for (watched, start, opened) in streams {
            let name = format!("etcd-watch-{}-{}", subscription.id(), watched.key);
            self.hub.spawn(
                &name,
                watch_key(
                    self.client.clone(),
                    subscription.clone(),
                    watched,
                    start,
                    opened,
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

fn range_options(prefix: &str) -> GetOptions {
    if prefix.is_empty() {
        GetOptions::new().with_all_keys()
    } else {
        GetOptions::new().with_prefix()
    }
}

/// Lease TTL in whole seconds, rounded up, at least one.
pub(crate) fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

/// Adds the URL scheme etcd-client expects.
pub(crate) fn normalize_endpoints(
    endpoints: &[String],
    tls: bool,
) -> Vec<String> {
    let scheme = if tls { "https://" } else { "http://" };
    endpoints
        .iter()
        .map(|ep| {
            if ep.contains("://") {
                ep.clone()
            } else {
                format!("{scheme}{ep}")
            }
        })
        .collect()
}

pub(crate) fn to_etcd_ops(ops: &[TxnOp]) -> Vec<EtcdTxnOp> {
    ops.iter()
        .map(|op| match op {
            TxnOp::Put { key, value } => EtcdTxnOp::put(key.as_str(), value.clone(), None),
            TxnOp::Delete { key } => EtcdTxnOp::delete(key.as_str(), None),
        })
        .collect()
}

async fn connect_options(config: &EtcdConfig) -> Result<ConnectOptions> {
    let mut options = ConnectOptions::new()
        .with_connect_timeout(config.dial_timeout())
        .with_keep_alive(Duration::from_secs(10), config.op_timeout());
    if let (Some(user), Some(password)) = (&config.username, &config.password) {
        options = options.with_user(user.clone(), password.clone());
    }
    if let Some(tls) = tls_options(&config.tls).await? {
        options = options.with_tls(tls);
    }
    Ok(options)
}

async fn tls_options(tls: &TlsConfig) -> Result<Option<TlsOptions>> {
    if !tls.enabled() {
        return Ok(None);
    }
    if tls.insecure_skip_tls_verify {
        warn!("[{}] insecure-skip-tls-verify is not supported, server certificates are verified", NAME);
    }
    let mut options = TlsOptions::new();
    if let Some(ca) = &tls.ca_file {
        let pem = tokio::fs::read(ca).await?;
        options = options.ca_certificate(Certificate::from_pem(pem));
    }
    if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
        let cert = tokio::fs::read(cert).await?;
        let key = tokio::fs::read(key).await?;
        options = options.identity(Identity::from_pem(cert, key));
    }
    Ok(Some(options))
}
