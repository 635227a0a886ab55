use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use unikv::ChangeEvent;
use unikv::KvDriver;
use unikv::MemDriver;
use unikv::MemoryConfig;
use unikv::WatchConfig;

pub const EVENT_WAIT: Duration = Duration::from_secs(2);
pub const SILENCE: Duration = Duration::from_millis(300);

pub fn mem_driver(filter_dup_notifs: bool) -> Arc<dyn KvDriver> {
    let watch = WatchConfig {
        filter_dup_notifs,
        ..Default::default()
    };
    Arc::new(MemDriver::new(&MemoryConfig::default(), &watch))
}

pub async fn next_event(rx: &mut mpsc::Receiver<ChangeEvent>) -> ChangeEvent {
    timeout(EVENT_WAIT, rx.recv())
        .await
        .expect("event within deadline")
        .expect("subscription alive")
}

/// Asserts nothing arrives for a short while.
pub async fn assert_silent(rx: &mut mpsc::Receiver<ChangeEvent>) {
    if let Ok(Some(event)) = timeout(SILENCE, rx.recv()).await {
        panic!("unexpected event {event:?}");
    }
}
