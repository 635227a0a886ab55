//! Consul KV driver over the HTTP API.
//!
//! Watches are blocking queries: one polling loop per watched key that
//! diffs consecutive snapshots into Put and Delete events.

mod wire;

pub(crate) use wire::*;

#[cfg(test)]
mod wire_test;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::ConfigError;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::Url;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::kv::coalesce_ops;
use crate::utils::async_task::with_timeout;
use crate::utils::validate_key;
use crate::Capabilities;
use crate::ConsulConfig;
use crate::DeleteOptions;
use crate::Error;
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

const NAME: &str = "consul";
const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// HTTP access to the agent, shared with the polling tasks
#[derive(Debug)]
struct ConsulApi {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulApi {
    fn request(
        &self,
        method: Method,
        url: Url,
    ) -> RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.datacenter {
            builder = builder.query(&[("dc", dc)]);
        }
        builder
    }

    /// Entries at `wire_key` (or under it with `recurse`) plus the index
    /// of the response. A missing key is an empty result.
    async fn entries(
        &self,
        wire_key: &str,
        recurse: bool,
        blocking: Option<(u64, Duration)>,
    ) -> Result<(Vec<KvEntry>, u64)> {
        let mut builder = self.request(Method::GET, kv_url(&self.base_url, wire_key)?);
        if recurse {
            builder = builder.query(&[("recurse", "true")]);
        }
        if let Some((index, wait)) = blocking {
            builder = builder
                .query(&[("index", index.to_string()), ("wait", format!("{}ms", wait.as_millis()))])
                .timeout(wait * 2);
        }
        let resp = builder.send().await?;
        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), index));
        }
        let entries = check(resp).await?.json::<Vec<KvEntry>>().await?;
        Ok((entries, index))
    }

    async fn put(
        &self,
        wire_key: &str,
        value: &[u8],
        session: Option<&str>,
    ) -> Result<bool> {
        let mut builder = self.request(Method::PUT, kv_url(&self.base_url, wire_key)?).body(value.to_vec());
        if let Some(session) = session {
            builder = builder.query(&[("acquire", session)]);
        }
        let resp = check(builder.send().await?).await?;
        Ok(resp.json::<bool>().await?)
    }

    async fn delete(
        &self,
        wire_key: &str,
        recurse: bool,
    ) -> Result<()> {
        let mut builder = self.request(Method::DELETE, kv_url(&self.base_url, wire_key)?);
        if recurse {
            builder = builder.query(&[("recurse", "true")]);
        }
        check(builder.send().await?).await?;
        Ok(())
    }

    /// Session whose expiry deletes the keys it holds
    async fn create_session(
        &self,
        ttl: Duration,
    ) -> Result<String> {
        let body = SessionRequest {
            name: format!("unikv-ttl-{}", nanoid::nanoid!(8)),
            ttl: session_ttl(ttl),
            behavior: "delete",
        };
        let url = endpoint(&self.base_url, ["v1", "session", "create"])?;
        let resp = check(self.request(Method::PUT, url).json(&body).send().await?).await?;
        Ok(resp.json::<SessionResponse>().await?.id)
    }

    async fn txn(
        &self,
        ops: &[TxnOp],
    ) -> Result<()> {
        let url = endpoint(&self.base_url, ["v1", "txn"])?;
        let resp = self.request(Method::PUT, url).json(&txn_body(ops)).send().await?;
        if resp.status() == StatusCode::CONFLICT {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Conflict(format!("consul transaction rolled back: {body}")));
        }
        check(resp).await?;
        Ok(())
    }
}

/// Maps HTTP failures onto error kinds.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
            Err(Error::invalid(format!("consul rejected request: {body}")))
        }
        _ => Err(Error::unavailable(format!("consul answered {status}: {body}"))),
    }
}

/// Driver over one Consul agent
#[derive(Debug)]
pub struct ConsulDriver {
    api: Arc<ConsulApi>,
    hub: Arc<WatchHub>,
    closed: AtomicBool,
    op_timeout: Duration,
    blocking_wait: Duration,
}

impl ConsulDriver {
    /// Builds the HTTP client; no request is made until the first operation.
    pub fn connect(
        config: &ConsulConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let op_timeout = Duration::from_millis(config.op_timeout);
        let http = http_client(&config.tls, op_timeout)?;
        let base_url = Url::parse(&config.address)
            .map_err(|e| Error::Config(ConfigError::Message(format!("consul address {}: {e}", config.address))))?;
        let delivery_timeout = watch.delivery_timeout.map(Duration::from_millis).unwrap_or(op_timeout);
        info!("[{}] using agent {}", NAME, config.address);

        Ok(Self {
            api: Arc::new(ConsulApi {
                http,
                base_url,
                token: config.token.clone(),
                datacenter: config.datacenter.clone(),
            }),
            hub: WatchHub::new(NAME, delivery_timeout, watch.filter_dup_notifs),
            closed: AtomicBool::new(false),
            op_timeout,
            blocking_wait: Duration::from_millis(config.blocking_wait),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("consul driver"));
        }
        Ok(())
    }

    /// Current content and index of every watched key. Only changes made
    /// after this point become events.
    async fn baselines(
        &self,
        subscription: &Subscription,
    ) -> Result<Vec<(WatchedKey, Snapshot, u64)>> {
        let mut baselines = Vec::new();
        for watched in subscription.watched_keys() {
            let (entries, index) = self.api.entries(to_wire(&watched.key), true, None).await?;
            let snapshot = snapshot_of(&watched.key, &entries);
            baselines.push((watched, snapshot, index));
        }
        Ok(baselines)
    }

    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KvPair>> {
        let (entries, _) = self.api.entries(to_wire(prefix), true, None).await?;
        let mut items = entries
            .iter()
            .map(|e| {
                Ok(KvPair {
                    key: from_wire(prefix, &e.key),
                    value: e.decode_value()?,
                    revision: e.modify_index,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }
}

/// Decodable entries of one query keyed the way the caller spelled them
fn snapshot_of(
    requested: &str,
    entries: &[KvEntry],
) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for entry in entries {
        match entry.decode_value() {
            Ok(value) => {
                snapshot.insert(from_wire(requested, &entry.key), (value, entry.modify_index));
            }
            Err(e) => warn!("[{}] skipping undecodable value of {}: {}", NAME, entry.key, e),
        }
    }
    snapshot
}

/// Blocking-query loop of one watched key, continuing from the baseline
/// taken when the subscription was registered.
async fn poll_key(
    api: Arc<ConsulApi>,
    subscription: Arc<Subscription>,
    watched: WatchedKey,
    mut snapshot: Snapshot,
    mut index: u64,
    wait: Duration,
) -> Result<()> {
    let WatchedKey { key, token } = watched;
    let wire = to_wire(&key).to_string();
    debug!("[{}] polling {} from index {}", NAME, key, index);

    loop {
        let fetched = tokio::select! {
            _ = token.cancelled() => break,
            fetched = api.entries(&wire, true, Some((index, wait))) => fetched,
        };
        let (entries, returned) = match fetched {
            Ok(result) => result,
            Err(e) => {
                warn!("[{}] blocking query for {} failed: {}", NAME, key, e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                }
            }
        };

        let current = snapshot_of(&key, &entries);
        for event in diff_snapshots(&snapshot, &current, returned) {
            subscription.deliver_from(&key, event);
        }
        snapshot = current;
        index = next_index(index, returned);
    }
    debug!("[{}] stopped polling {}", NAME, key);
    Ok(())
}

#[async_trait]
impl KvDriver for ConsulDriver {
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
            let session = match opts.ttl {
                Some(ttl) => Some(self.api.create_session(ttl).await?),
                None => None,
            };
            if !self.api.put(to_wire(key), value, session.as_deref()).await? {
                return Err(Error::Conflict(format!("{key} is held by another session")));
            }
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
        with_timeout(NAME, "get", self.op_timeout, async {
            let (entries, _) = self.api.entries(to_wire(key), false, None).await?;
            match entries.first() {
                Some(entry) => Ok(Some(Versioned {
                    value: entry.decode_value()?,
                    revision: entry.modify_index,
                })),
                None => Ok(None),
            }
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
            let wire = to_wire(key);
            let (existing, _) = self.api.entries(wire, opts.prefix, None).await?;
            if existing.is_empty() {
                return Ok(false);
            }
            self.api.delete(wire, opts.prefix).await?;
            Ok(true)
        })
        .await
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.ensure_open()?;
        let items = with_timeout(NAME, "list_keys", self.op_timeout, self.list(prefix)).await?;
        Ok(KeyIterator::from_vec(
            items
                .into_iter()
                .map(|kv| KeyVal {
                    key: kv.key,
                    revision: kv.revision,
                })
                .collect(),
        ))
    }

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator> {
        self.ensure_open()?;
        let items = with_timeout(NAME, "list_values", self.op_timeout, self.list(prefix)).await?;
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
        with_timeout(NAME, "commit", self.op_timeout, self.api.txn(&ops)).await
    }

    async fn watch(
        &self,
        request: WatchRequest,
    ) -> Result<()> {
        self.ensure_open()?;
        let subscription = self.hub.subscribe(request)?;
        let baselines = match with_timeout(NAME, "watch", self.op_timeout, self.baselines(&subscription)).await {
            Ok(baselines) => baselines,
            Err(e) => {
                subscription.cancel("consul baseline query failed");
                return Err(e);
            }
        };
        for (watched, snapshot, index) in baselines {
            let name = format!("consul-poll-{}-{}", subscription.id(), watched.key);
            self.hub.spawn(
                &name,
                poll_key(
                    self.api.clone(),
                    subscription.clone(),
                    watched,
                    snapshot,
                    index,
                    self.blocking_wait,
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

fn http_client(
    tls: &TlsConfig,
    op_timeout: Duration,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(op_timeout);
    if tls.enabled() {
        if let Some(ca) = &tls.ca_file {
            let pem = std::fs::read(ca)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem).map_err(tls_error)?);
        }
        if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
            let mut pem = std::fs::read(cert)?;
            pem.extend(std::fs::read(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem).map_err(tls_error)?);
        }
    }
    if tls.insecure_skip_tls_verify {
        warn!("[{}] server certificate verification is disabled", NAME);
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder.build()?)
}

fn tls_error(e: reqwest::Error) -> Error {
    Error::Config(ConfigError::Message(format!("consul TLS material is invalid: {e}")))
}
