//! Unit tests for the watch hub: matching, trimming, cancellation
//! granularity, delivery timeout and shutdown.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::ChangeEvent;
use crate::ErrorKind;
use crate::EventKind;

const WAIT: Duration = Duration::from_millis(500);
const QUIET: Duration = Duration::from_millis(100);

fn setup_hub(filter_dup: bool) -> Arc<WatchHub> {
    WatchHub::new("test", Duration::from_millis(200), filter_dup)
}

fn subscribe(
    hub: &Arc<WatchHub>,
    keys: &[&str],
    trimmer: Option<&str>,
) -> (
    Arc<Subscription>,
    mpsc::Receiver<ChangeEvent>,
    mpsc::Sender<String>,
) {
    let (sink, rx) = channel_sink(16);
    let (close_tx, close_rx) = mpsc::channel(4);
    let mut request = WatchRequest::new(keys.iter().map(|k| k.to_string()).collect(), sink, close_rx);
    request.trimmer = trimmer.map(str::to_string);
    let subscription = hub.subscribe(request).unwrap();
    (subscription, rx, close_tx)
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_subscribe_registers_active_subscription() {
    let hub = setup_hub(false);
    let (subscription, _rx, _close) = subscribe(&hub, &["/a/", "/b/"], None);

    assert_eq!(subscription.state(), SubscriptionState::Active);
    assert_eq!(subscription.watched_keys().len(), 2);
    assert_eq!(hub.subscription_count(), 1);
}

#[tokio::test]
async fn test_subscribe_rejects_empty_key_list() {
    let hub = setup_hub(false);
    let (sink, _rx) = channel_sink(1);
    let (_tx, close_rx) = mpsc::channel(1);

    let err = hub.subscribe(WatchRequest::new(vec![], sink, close_rx)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn test_duplicate_key_is_registered_once() {
    let hub = setup_hub(false);
    let (subscription, mut rx, _close) = subscribe(&hub, &["k", "k"], None);

    assert_eq!(subscription.watched_keys().len(), 1);
    hub.publish(ChangeEvent::put("k", b"v".to_vec(), None, 1));
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_some());
    assert!(timeout(QUIET, rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_publish_delivers_only_matching_keys() {
    let hub = setup_hub(false);
    let (_subscription, mut rx, _close) = subscribe(&hub, &["/my/"], None);

    hub.publish(ChangeEvent::put("/something/else", b"x".to_vec(), None, 1));
    hub.publish(ChangeEvent::put("/my/key1", vec![1, 2, 3], None, 2));

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.key, "/my/key1");
    assert_eq!(event.value, Some(vec![1, 2, 3]));
    assert!(timeout(QUIET, rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_trimmer_strips_prefix_from_event_keys() {
    let hub = setup_hub(false);
    let (_subscription, mut rx, _close) = subscribe(&hub, &["/my/key1"], Some("/my/"));

    hub.publish(ChangeEvent::put("/my/key1", vec![1, 2, 3], None, 7));

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.key, "key1");
    assert_eq!(event.kind, EventKind::Put);
    assert_eq!(event.revision, 7);
}

#[tokio::test]
async fn test_events_keep_publish_order() {
    let hub = setup_hub(false);
    let (_subscription, mut rx, _close) = subscribe(&hub, &["k"], None);

    for rev in 1..=20u64 {
        hub.publish(ChangeEvent::put("k", rev.to_be_bytes().to_vec(), None, rev));
    }

    let mut last = 0;
    for _ in 0..20 {
        let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(event.revision > last);
        last = event.revision;
    }
}

#[tokio::test]
async fn test_cancel_single_key_keeps_the_others() {
    let hub = setup_hub(false);
    let (subscription, mut rx, close) = subscribe(&hub, &["/w/k1", "/w/k2"], Some("/w/"));

    close.send("k1".to_string()).await.unwrap();
    wait_until(|| subscription.watched_keys().len() == 1).await;

    hub.publish(ChangeEvent::put("/w/k1", b"1".to_vec(), None, 1));
    hub.publish(ChangeEvent::put("/w/k2", b"2".to_vec(), None, 2));

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.key, "k2");
    assert!(timeout(QUIET, rx.recv()).await.is_err());

    close.send(String::new()).await.unwrap();
    wait_until(|| subscription.state() == SubscriptionState::Closed).await;

    hub.publish(ChangeEvent::put("/w/k2", b"3".to_vec(), None, 3));
    assert!(timeout(QUIET, rx.recv()).await.map(|e| e.is_none()).unwrap_or(true));
    assert_eq!(hub.subscription_count(), 0);
}

#[tokio::test]
async fn test_dropping_close_channel_cancels_everything() {
    let hub = setup_hub(false);
    let (subscription, _rx, close) = subscribe(&hub, &["k"], None);

    drop(close);
    wait_until(|| subscription.state() == SubscriptionState::Closed).await;
    assert_eq!(hub.subscription_count(), 0);
}

#[tokio::test]
async fn test_events_queued_before_cancel_are_still_delivered() {
    let hub = setup_hub(false);
    let (subscription, mut rx, close) = subscribe(&hub, &["k"], None);

    for rev in 1..=5 {
        hub.publish(ChangeEvent::put("k", rev.to_string().into_bytes(), None, rev));
    }
    close.send(String::new()).await.unwrap();
    wait_until(|| subscription.state() == SubscriptionState::Closed).await;

    let mut revisions = Vec::new();
    while let Some(event) = timeout(WAIT, rx.recv()).await.unwrap() {
        revisions.push(event.revision);
    }
    assert_eq!(revisions, vec![1, 2, 3, 4, 5]);
    assert!(!subscription.offer(ChangeEvent::put("k", vec![], None, 6)));
}

#[tokio::test]
async fn test_lost_backend_stream_ends_the_subscription_visibly() {
    let hub = setup_hub(false);
    let (subscription, mut rx, _close) = subscribe(&hub, &["k"], None);

    subscription.cancel("backend stream lost");
    wait_until(|| subscription.state() == SubscriptionState::Closed).await;

    assert_eq!(hub.subscription_count(), 0);
    assert!(subscription.token().is_cancelled());
    // the sink is released, so the receiving side sees the end
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_owner_cancellation_ends_subscription() {
    let hub = setup_hub(false);
    let owner = CancellationToken::new();
    let (sink, _rx) = channel_sink(1);
    let (_close_tx, close_rx) = mpsc::channel(1);
    let mut request = WatchRequest::new(vec!["k".into()], sink, close_rx);
    request.owner = Some(owner.clone());
    let subscription = hub.subscribe(request).unwrap();

    owner.cancel();
    wait_until(|| subscription.state() == SubscriptionState::Closed).await;
}

#[tokio::test]
async fn test_deliver_from_only_accepts_watched_origin() {
    let hub = setup_hub(false);
    let (subscription, mut rx, _close) = subscribe(&hub, &["/a"], None);

    assert!(!subscription.deliver_from("/b", ChangeEvent::put("/b", vec![], None, 1)));
    assert!(subscription.deliver_from("/a", ChangeEvent::put("/a/x", vec![], None, 2)));

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.revision, 2);
}

#[tokio::test]
async fn test_duplicate_suppression_when_enabled() {
    let hub = setup_hub(true);
    let (_subscription, mut rx, _close) = subscribe(&hub, &["K"], None);

    for rev in 1..=10 {
        hub.publish(ChangeEvent::put("K", b"V".to_vec(), None, rev));
    }
    hub.publish(ChangeEvent::put("K", b"V2".to_vec(), Some(b"V".to_vec()), 11));
    hub.publish(ChangeEvent::delete("K", Some(b"V2".to_vec()), 12));
    hub.publish(ChangeEvent::delete("K", None, 13));

    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.value.as_deref(), Some(&b"V"[..]));
    let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.prev_value.as_deref(), Some(&b"V"[..]));
    let third = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(third.kind, EventKind::Delete);
    assert!(timeout(QUIET, rx.recv()).await.is_err());
}

#[tokio::test]
#[traced_test]
async fn test_slow_sink_events_are_dropped_after_timeout() {
    let hub = WatchHub::new("slow", Duration::from_millis(20), false);
    // capacity 1 and nobody reading: the second event cannot be delivered
    let (gate_tx, mut gate_rx) = mpsc::channel::<ChangeEvent>(1);
    let (_close_tx, close_rx) = mpsc::channel(1);
    let subscription = hub
        .subscribe(WatchRequest::new(vec!["k".into()], Arc::new(gate_tx), close_rx))
        .unwrap();

    hub.publish(ChangeEvent::put("k", b"1".to_vec(), None, 1));
    hub.publish(ChangeEvent::put("k", b"2".to_vec(), None, 2));
    hub.publish(ChangeEvent::put("k", b"3".to_vec(), None, 3));
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(subscription.is_active());
    assert!(logs_contain("dropped"));
    assert_eq!(gate_rx.recv().await.unwrap().revision, 1);

    hub.publish(ChangeEvent::put("k", b"4".to_vec(), None, 4));
    let next = timeout(WAIT, gate_rx.recv()).await.unwrap().unwrap();
    assert_eq!(next.revision, 4);
}

#[tokio::test]
#[traced_test]
async fn test_panicking_sink_does_not_end_subscription() {
    let hub = setup_hub(false);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let sink = fn_sink(move |event: ChangeEvent| {
        if event.revision == 1 {
            panic!("sink failure");
        }
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (_close_tx, close_rx) = mpsc::channel(1);
    let subscription = hub.subscribe(WatchRequest::new(vec!["k".into()], sink, close_rx)).unwrap();

    hub.publish(ChangeEvent::put("k", b"1".to_vec(), None, 1));
    hub.publish(ChangeEvent::put("k", b"2".to_vec(), None, 2));

    wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
    assert!(subscription.is_active());
    assert!(logs_contain("sink panicked"));
}

#[tokio::test]
async fn test_close_cancels_subscriptions_and_refuses_new_ones() {
    let hub = setup_hub(false);
    let (subscription, _rx, _close) = subscribe(&hub, &["k"], None);

    hub.close().await;

    assert_eq!(subscription.state(), SubscriptionState::Closed);
    assert!(hub.is_closed());
    let (sink, _rx) = channel_sink(1);
    let (_tx, close_rx) = mpsc::channel(1);
    let err = hub.subscribe(WatchRequest::new(vec!["k".into()], sink, close_rx)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
}

#[tokio::test]
async fn test_close_waits_for_spawned_tasks() {
    let hub = setup_hub(false);
    let finished = Arc::new(AtomicUsize::new(0));
    let flag = finished.clone();
    let token = hub.shutdown_token().clone();
    hub.spawn("native-stream", async move {
        token.cancelled().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    hub.close().await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
