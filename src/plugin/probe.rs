use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::constants::probe_key;
use crate::KeyValBroker;
use crate::Result;

/// Health of the backend connection as seen by the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Ok,
    Error,
}

/// Host-side status registry the plugin reports into
#[cfg_attr(test, automock)]
pub trait StatusReporter: Send + Sync {
    /// Registers a probe the host may poll on its own schedule.
    fn register_probe(
        &self,
        name: &str,
        probe: Arc<HealthProbe>,
    );

    fn report(
        &self,
        name: &str,
        state: ProbeState,
        error: Option<String>,
    );
}

/// Reads the probe key through a root broker. Found or not, a read without
/// error means the connection is healthy.
pub struct HealthProbe {
    name: String,
    key: String,
    broker: Arc<dyn KeyValBroker>,
    last: Mutex<Option<ProbeState>>,
}

impl std::fmt::Debug for HealthProbe {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("HealthProbe")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("last", &*self.last.lock())
            .finish()
    }
}

impl HealthProbe {
    pub fn new(
        plugin_name: &str,
        backend: &str,
        broker: Arc<dyn KeyValBroker>,
    ) -> Self {
        Self {
            name: plugin_name.to_string(),
            key: probe_key(backend),
            broker,
            last: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn check(&self) -> (ProbeState, Option<String>) {
        match self.broker.get(&self.key).await {
            Ok(_) => (ProbeState::Ok, None),
            Err(e) => (ProbeState::Error, Some(e.to_string())),
        }
    }

    /// Checks and reports the outcome when it differs from the previous one.
    pub async fn check_and_report(
        &self,
        reporter: &dyn StatusReporter,
    ) -> ProbeState {
        let (state, error) = self.check().await;
        let previous = self.last.lock().replace(state);
        if previous != Some(state) {
            match &error {
                Some(e) => warn!("[{}] connection probe failed: {}", self.name, e),
                None => debug!("[{}] connection probe ok", self.name),
            }
            reporter.report(&self.name, state, error);
        }
        state
    }

    /// Probes every `interval` until `shutdown` fires.
    pub(crate) async fn run(
        self: Arc<Self>,
        reporter: Arc<dyn StatusReporter>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.check_and_report(reporter.as_ref()).await;
                }
            }
        }
    }
}
