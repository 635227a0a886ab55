use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Error;
use crate::Result;

/// Receiver side of a watch subscription.
///
/// The hub awaits `deliver` for at most the delivery timeout; an error, a
/// panic or a timeout drops the event and the subscription continues.
#[async_trait]
pub trait EventSink<E: Send + 'static>: Send + Sync {
    async fn deliver(
        &self,
        event: E,
    ) -> Result<()>;
}

#[async_trait]
impl<E: Send + 'static> EventSink<E> for mpsc::Sender<E> {
    async fn deliver(
        &self,
        event: E,
    ) -> Result<()> {
        self.send(event).await.map_err(|_| Error::Closed("event channel"))
    }
}

/// Sink invoking a closure per event
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<E, F> EventSink<E> for FnSink<F>
where
    E: Send + 'static,
    F: Fn(E) + Send + Sync,
{
    async fn deliver(
        &self,
        event: E,
    ) -> Result<()> {
        (self.f)(event);
        Ok(())
    }
}

/// Bounded channel sink and its receiver
pub fn channel_sink<E: Send + 'static>(
    capacity: usize
) -> (Arc<dyn EventSink<E>>, mpsc::Receiver<E>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Arc::new(tx), rx)
}

pub fn fn_sink<E, F>(f: F) -> Arc<dyn EventSink<E>>
where
    E: Send + 'static,
    F: Fn(E) + Send + Sync + 'static,
{
    Arc::new(FnSink::new(f))
}
