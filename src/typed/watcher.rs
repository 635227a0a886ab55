use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use super::MessageDecoder;
use crate::ChangeEvent;
use crate::EventKind;
use crate::EventSink;
use crate::KeyValWatcher;
use crate::KvMessage;
use crate::Result;
use crate::Revision;

/// Change event with decoded values
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEvent<M> {
    pub kind: EventKind,
    pub key: String,
    pub value: Option<M>,
    pub prev_value: Option<M>,
    pub revision: Revision,
}

/// Watcher delivering [`TypedEvent`]s
#[derive(Clone)]
pub struct TypedWatcher {
    inner: Arc<dyn KeyValWatcher>,
    decoder: MessageDecoder,
}

impl std::fmt::Debug for TypedWatcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TypedWatcher").field("decoder", &self.decoder).finish_non_exhaustive()
    }
}

impl TypedWatcher {
    pub fn new(
        inner: Arc<dyn KeyValWatcher>,
        decoder: MessageDecoder,
    ) -> Self {
        Self { inner, decoder }
    }

    pub fn bytes(&self) -> &Arc<dyn KeyValWatcher> {
        &self.inner
    }

    /// Events whose values fail to decode are dropped with a warning.
    pub async fn watch<M: KvMessage>(
        &self,
        sink: Arc<dyn EventSink<TypedEvent<M>>>,
        close_rx: mpsc::Receiver<String>,
        keys: &[&str],
    ) -> Result<()> {
        let sink = Arc::new(DecodingSink {
            decoder: self.decoder.clone(),
            sink,
            _message: PhantomData,
        });
        self.inner.watch(sink, close_rx, keys).await
    }

    pub fn new_watcher(
        &self,
        prefix: &str,
    ) -> Result<TypedWatcher> {
        Ok(TypedWatcher::new(self.inner.new_watcher(prefix)?, self.decoder.clone()))
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

struct DecodingSink<M> {
    decoder: MessageDecoder,
    sink: Arc<dyn EventSink<TypedEvent<M>>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: KvMessage> DecodingSink<M> {
    fn decode(
        &self,
        event: ChangeEvent,
    ) -> Result<TypedEvent<M>> {
        let value = event.value.map(|v| self.decoder.decode(&v)).transpose()?;
        let prev_value = event.prev_value.map(|v| self.decoder.decode(&v)).transpose()?;
        Ok(TypedEvent {
            kind: event.kind,
            key: event.key,
            value,
            prev_value,
            revision: event.revision,
        })
    }
}

#[async_trait]
impl<M: KvMessage> EventSink<ChangeEvent> for DecodingSink<M> {
    async fn deliver(
        &self,
        event: ChangeEvent,
    ) -> Result<()> {
        let key = event.key.clone();
        match self.decode(event) {
            Ok(typed) => self.sink.deliver(typed).await,
            Err(e) => {
                warn!("dropping undecodable {} event for {}: {}", M::label(), key, e);
                Err(e)
            }
        }
    }
}
