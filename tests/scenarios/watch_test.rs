use tokio::sync::mpsc;
use unikv::channel_sink;
use unikv::DeleteOptions;
use unikv::DriverExt;
use unikv::EventKind;
use unikv::KeyValWatcher;
use unikv::KvDriver;
use unikv::PutOptions;

use crate::commons::assert_silent;
use crate::commons::mem_driver;
use crate::commons::next_event;

#[tokio::test]
async fn prefix_watcher_trims_keys_and_ignores_other_prefixes() {
    let driver = mem_driver(false);
    let watcher = driver.new_watcher("/my/");
    let (sink, mut events) = channel_sink(8);
    let (_close_tx, close_rx) = mpsc::channel(1);
    watcher.watch(sink, close_rx, &["key1"]).await.unwrap();

    driver.put("/something/else", b"x", PutOptions::default()).await.unwrap();
    driver.put("/my/key1", &[1, 2, 3], PutOptions::default()).await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.kind, EventKind::Put);
    assert_eq!(event.key, "key1");
    assert_eq!(event.value.as_deref(), Some(&[1u8, 2, 3][..]));
    assert_silent(&mut events).await;
}

#[tokio::test]
async fn duplicate_notifications_are_filtered() {
    let driver = mem_driver(true);
    let watcher = driver.new_watcher("");
    let (sink, mut events) = channel_sink(32);
    let (_close_tx, close_rx) = mpsc::channel(1);
    watcher.watch(sink, close_rx, &["/k"]).await.unwrap();

    for _ in 0..10 {
        driver.put("/k", b"v", PutOptions::default()).await.unwrap();
    }
    driver.put("/k", b"v2", PutOptions::default()).await.unwrap();
    driver.delete("/k", DeleteOptions::default()).await.unwrap();
    driver.delete("/k", DeleteOptions::default()).await.unwrap();

    let first = next_event(&mut events).await;
    assert_eq!((first.kind, first.value.as_deref()), (EventKind::Put, Some(&b"v"[..])));
    let second = next_event(&mut events).await;
    assert_eq!(second.value.as_deref(), Some(&b"v2"[..]));
    assert_eq!(second.prev_value.as_deref(), Some(&b"v"[..]));
    let third = next_event(&mut events).await;
    assert_eq!(third.kind, EventKind::Delete);
    assert_silent(&mut events).await;
}

#[tokio::test]
async fn cancelling_one_key_keeps_the_others() {
    let driver = mem_driver(false);
    let watcher = driver.new_watcher("/w/");
    let (sink, mut events) = channel_sink(8);
    let (close_tx, close_rx) = mpsc::channel(4);
    watcher.watch(sink, close_rx, &["k1", "k2"]).await.unwrap();

    close_tx.send("k1".to_string()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    driver.put("/w/k1", b"a", PutOptions::default()).await.unwrap();
    driver.put("/w/k2", b"b", PutOptions::default()).await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.key, "k2");
    assert_silent(&mut events).await;

    close_tx.send(String::new()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    driver.put("/w/k1", b"c", PutOptions::default()).await.unwrap();
    driver.put("/w/k2", b"d", PutOptions::default()).await.unwrap();
    assert_silent(&mut events).await;
}
