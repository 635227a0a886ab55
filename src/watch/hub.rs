use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::DedupFilter;
use super::EventSink;
use crate::metrics::WATCH_EVENTS_DELIVERED_TOTAL;
use crate::metrics::WATCH_EVENTS_DROPPED_TOTAL;
use crate::metrics::WATCH_SUBSCRIPTIONS;
use crate::utils::async_task::spawn_task;
use crate::utils::has_prefix;
use crate::ChangeEvent;
use crate::Error;
use crate::Result;

/// Everything a driver needs to register one subscription
pub struct WatchRequest {
    /// Absolute keys or key prefixes
    pub keys: Vec<String>,
    pub sink: Arc<dyn EventSink<ChangeEvent>>,
    /// `""` cancels the subscription, any other string cancels that key,
    /// a closed channel cancels everything
    pub close_rx: mpsc::Receiver<String>,
    /// Prefix stripped from event keys and prepended to cancelled keys
    pub trimmer: Option<String>,
    /// Cancelled when the watcher that made the request is closed
    pub owner: Option<CancellationToken>,
}

impl WatchRequest {
    pub fn new(
        keys: Vec<String>,
        sink: Arc<dyn EventSink<ChangeEvent>>,
        close_rx: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            keys,
            sink,
            close_rx,
            trimmer: None,
            owner: None,
        }
    }
}

impl fmt::Debug for WatchRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WatchRequest")
            .field("keys", &self.keys)
            .field("trimmer", &self.trimmer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    Registering = 0,
    Active = 1,
    Cancelling = 2,
    Closed = 3,
}

impl SubscriptionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SubscriptionState::Registering,
            1 => SubscriptionState::Active,
            2 => SubscriptionState::Cancelling,
            _ => SubscriptionState::Closed,
        }
    }
}

/// One subscribed key or prefix with its own cancellation
#[derive(Debug, Clone)]
pub struct WatchedKey {
    pub key: String,
    pub token: CancellationToken,
}

/// Registered subscription.
///
/// Events are queued without blocking the caller and handed to the sink in
/// queue order by a dedicated delivery task.
pub struct Subscription {
    id: u64,
    backend: &'static str,
    keys: RwLock<Vec<WatchedKey>>,
    queue: mpsc::UnboundedSender<ChangeEvent>,
    state: AtomicU8,
    token: CancellationToken,
    trimmer: Option<String>,
    dedup: Option<DedupFilter>,
}

impl fmt::Debug for Subscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("keys", &self.keys.read())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Cancelled once the whole subscription ends
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Keys still being watched
    pub fn watched_keys(&self) -> Vec<WatchedKey> {
        self.keys
            .read()
            .iter()
            .filter(|k| !k.token.is_cancelled())
            .cloned()
            .collect()
    }

    /// Queues `event` if it falls under any watched key.
    pub fn offer(
        &self,
        event: ChangeEvent,
    ) -> bool {
        let matched = self
            .keys
            .read()
            .iter()
            .any(|k| !k.token.is_cancelled() && has_prefix(&event.key, &k.key));
        matched && self.enqueue(event)
    }

    /// Queues an event produced by the native stream of `origin`.
    pub fn deliver_from(
        &self,
        origin: &str,
        event: ChangeEvent,
    ) -> bool {
        let active = self
            .keys
            .read()
            .iter()
            .any(|k| k.key == origin && !k.token.is_cancelled());
        active && self.enqueue(event)
    }

    fn enqueue(
        &self,
        mut event: ChangeEvent,
    ) -> bool {
        if !self.is_active() {
            return false;
        }
        if let Some(dedup) = &self.dedup {
            if !dedup.admit(&event) {
                trace!("[{}] duplicate {:?} for {} suppressed", self.backend, event.kind, event.key);
                return false;
            }
        }
        if let Some(prefix) = &self.trimmer {
            match event.key.strip_prefix(prefix.as_str()) {
                Some(rest) => event.key = rest.to_string(),
                None => return false,
            }
        }
        self.queue.send(event).is_ok()
    }

    fn set_state(
        &self,
        state: SubscriptionState,
    ) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Active -> Cancelling; the delivery task completes the transition.
    ///
    /// Drivers call this when a backend stream is lost for good.
    pub fn cancel(
        &self,
        reason: &str,
    ) {
        if self
            .state
            .compare_exchange(
                SubscriptionState::Active as u8,
                SubscriptionState::Cancelling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!("[{}] cancelling subscription {}: {}", self.backend, self.id, reason);
        }
        self.token.cancel();
    }

    /// Cancels one key; returns how many keys remain.
    fn cancel_key(
        &self,
        key: &str,
    ) -> usize {
        let mut keys = self.keys.write();
        keys.retain(|k| {
            if k.key == key {
                k.token.cancel();
                false
            } else {
                true
            }
        });
        if let Some(dedup) = &self.dedup {
            dedup.forget(key);
        }
        debug!("[{}] subscription {} stopped watching {}", self.backend, self.id, key);
        keys.len()
    }
}

/// Subscription registry and task owner of one driver
pub struct WatchHub {
    backend: &'static str,
    subscriptions: DashMap<u64, Arc<Subscription>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    delivery_timeout: Duration,
    filter_dup: bool,
}

impl fmt::Debug for WatchHub {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WatchHub")
            .field("backend", &self.backend)
            .field("subscriptions", &self.subscriptions.len())
            .field("delivery_timeout", &self.delivery_timeout)
            .field("filter_dup", &self.filter_dup)
            .finish_non_exhaustive()
    }
}

impl WatchHub {
    pub fn new(
        backend: &'static str,
        delivery_timeout: Duration,
        filter_dup: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            delivery_timeout,
            filter_dup,
        })
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancelled when the hub closes; long-running driver loops select on it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Registers a subscription and starts its delivery and control tasks.
    ///
    /// A key listed twice is registered once; the later entry wins.
    pub fn subscribe(
        self: &Arc<Self>,
        request: WatchRequest,
    ) -> Result<Arc<Subscription>> {
        if self.is_closed() {
            return Err(Error::Closed("watch hub"));
        }
        if request.keys.is_empty() {
            return Err(Error::invalid("watch needs at least one key"));
        }

        let WatchRequest {
            keys,
            sink,
            close_rx,
            trimmer,
            owner,
        } = request;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let mut watched: Vec<WatchedKey> = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(pos) = watched.iter().position(|w| w.key == key) {
                watched.remove(pos).token.cancel();
            }
            watched.push(WatchedKey {
                key,
                token: token.child_token(),
            });
        }

        let (queue, rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(Subscription {
            id,
            backend: self.backend,
            keys: RwLock::new(watched),
            queue,
            state: AtomicU8::new(SubscriptionState::Registering as u8),
            token,
            trimmer: trimmer.filter(|p| !p.is_empty()),
            dedup: self.filter_dup.then(DedupFilter::new),
        });
        self.subscriptions.insert(id, subscription.clone());

        self.tracker.spawn(delivery_loop(
            Arc::downgrade(self),
            subscription.clone(),
            rx,
            sink,
            self.delivery_timeout,
        ));
        self.tracker.spawn(control_loop(
            subscription.clone(),
            close_rx,
            owner.unwrap_or_default(),
        ));

        subscription.set_state(SubscriptionState::Active);
        WATCH_SUBSCRIPTIONS.with_label_values(&[self.backend]).inc();
        debug!(
            "[{}] subscription {} watching {:?}",
            self.backend,
            id,
            subscription.watched_keys().iter().map(|k| &k.key).collect::<Vec<_>>()
        );
        Ok(subscription)
    }

    /// Offers `event` to every subscription watching its key. Never blocks.
    pub fn publish(
        &self,
        event: ChangeEvent,
    ) {
        for entry in self.subscriptions.iter() {
            entry.value().offer(event.clone());
        }
    }

    /// Spawns a driver background task owned by this hub.
    pub fn spawn<Fut>(
        &self,
        name: &str,
        fut: Fut,
    ) where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_closed() {
            warn!("[{}] hub closed, task {} not started", self.backend, name);
            return;
        }
        spawn_task(name, &self.tracker, fut);
    }

    /// Cancels every subscription and waits for all owned tasks.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.subscriptions.clear();
        debug!("[{}] watch hub closed", self.backend);
    }
}

/// Hands one event to the sink; false when the sink did not take it in time.
async fn deliver(
    backend: &'static str,
    sink: &Arc<dyn EventSink<ChangeEvent>>,
    event: ChangeEvent,
    delivery_timeout: Duration,
) -> bool {
    let key = event.key.clone();
    let delivery = AssertUnwindSafe(sink.deliver(event)).catch_unwind();
    match timeout(delivery_timeout, delivery).await {
        Ok(Ok(Ok(()))) => {
            WATCH_EVENTS_DELIVERED_TOTAL.with_label_values(&[backend]).inc();
        }
        Ok(Ok(Err(e))) => {
            warn!("[{}] sink rejected event for {}: {}", backend, key, e);
            WATCH_EVENTS_DROPPED_TOTAL.with_label_values(&[backend, "rejected"]).inc();
        }
        Ok(Err(_)) => {
            error!("[{}] sink panicked on event for {}", backend, key);
            WATCH_EVENTS_DROPPED_TOTAL.with_label_values(&[backend, "panic"]).inc();
        }
        Err(_) => {
            warn!(
                "[{}] sink did not take event for {} within {:?}, dropped",
                backend, key, delivery_timeout
            );
            WATCH_EVENTS_DROPPED_TOTAL.with_label_values(&[backend, "timeout"]).inc();
            return false;
        }
    }
    true
}

/// Delivers queued events in order until the subscription ends.
///
/// Events queued before the cancellation are still handed over. Draining
/// stops at the first event the sink does not take in time, the rest are
/// counted as dropped.
async fn delivery_loop(
    hub: Weak<WatchHub>,
    subscription: Arc<Subscription>,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    sink: Arc<dyn EventSink<ChangeEvent>>,
    delivery_timeout: Duration,
) {
    let backend = subscription.backend;
    loop {
        let event = tokio::select! {
            biased;
            _ = subscription.token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        deliver(backend, &sink, event, delivery_timeout).await;
    }

    subscription.token.cancel();
    rx.close();
    let mut stalled = false;
    while let Ok(event) = rx.try_recv() {
        if stalled {
            WATCH_EVENTS_DROPPED_TOTAL.with_label_values(&[backend, "closed"]).inc();
            continue;
        }
        stalled = !deliver(backend, &sink, event, delivery_timeout).await;
    }

    subscription.set_state(SubscriptionState::Closed);
    if let Some(hub) = hub.upgrade() {
        hub.subscriptions.remove(&subscription.id);
    }
    WATCH_SUBSCRIPTIONS.with_label_values(&[backend]).dec();
    debug!("[{}] subscription {} closed", backend, subscription.id);
}

async fn control_loop(
    subscription: Arc<Subscription>,
    mut close_rx: mpsc::Receiver<String>,
    owner: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = subscription.token.cancelled() => break,
            _ = owner.cancelled() => {
                subscription.cancel("watcher closed");
                break;
            }
            msg = close_rx.recv() => match msg {
                None => {
                    subscription.cancel("close channel dropped");
                    break;
                }
                Some(key) if key.is_empty() => {
                    subscription.cancel("cancelled by caller");
                    break;
                }
                Some(key) => {
                    let full = match &subscription.trimmer {
                        Some(prefix) => format!("{prefix}{key}"),
                        None => key,
                    };
                    if subscription.cancel_key(&full) == 0 {
                        subscription.cancel("no keys left");
                        break;
                    }
                }
            },
        }
    }
}
