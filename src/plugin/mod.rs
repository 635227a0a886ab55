//! Plugin façade: builds a driver from configuration and hands out typed and
//! byte-level brokers and watchers over it.
//!
//! Lifecycle: [`KvPlugin::init`] connects, [`KvPlugin::after_init`] starts
//! the health probe, [`KvPlugin::close`] releases everything. A plugin
//! without configuration stays disabled and every factory fails with
//! `Closed`.

mod label;
mod probe;

pub use label::*;
pub use probe::*;


use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::drivers;
use crate::Codec;
use crate::utils::async_task::spawn_task;
use crate::ConfigSource;
use crate::CryptoBroker;
use crate::CryptoPolicy;
use crate::CryptoWatcher;
use crate::DriverExt;
use crate::Error;
use crate::FieldCrypto;
use crate::KeyValBroker;
use crate::KeyValWatcher;
use crate::KvConfig;
use crate::KvDriver;
use crate::MessageCrypto;
use crate::MessageDecoder;
use crate::Result;
use crate::Serializer;
use crate::TypedBroker;
use crate::TypedWatcher;

/// Collaborators injected by the host
#[derive(Clone)]
pub struct Deps {
    pub plugin_name: String,
    pub config: Arc<dyn ConfigSource>,
    pub status: Option<Arc<dyn StatusReporter>>,
    pub service_label: Option<ServiceLabel>,
    /// Message fields decrypted on typed reads when crypto is configured
    pub crypto_policy: CryptoPolicy,
}

impl Deps {
    pub fn new(
        plugin_name: impl Into<String>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            config,
            status: None,
            service_label: None,
            crypto_policy: CryptoPolicy::default(),
        }
    }
}

/// State of an initialised plugin
struct Connected {
    config: KvConfig,
    driver: Arc<dyn KvDriver>,
    decoder: MessageDecoder,
    crypto: Option<Arc<FieldCrypto>>,
}

pub struct KvPlugin {
    deps: Deps,
    connected: ArcSwapOption<Connected>,
    disabled: AtomicBool,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for KvPlugin {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KvPlugin")
            .field("name", &self.deps.plugin_name)
            .field("connected", &self.connected.load().is_some())
            .field("disabled", &self.disabled.load(Ordering::Acquire))
            .finish()
    }
}

impl KvPlugin {
    pub fn new(deps: Deps) -> Self {
        Self {
            deps,
            connected: ArcSwapOption::empty(),
            disabled: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.deps.plugin_name
    }

    /// Loads the configuration and connects the backend.
    pub async fn init(&self) -> Result<()> {
        let name = &self.deps.plugin_name;
        let Some(config) = self.deps.config.load(name)? else {
            self.disabled.store(true, Ordering::Release);
            info!("[{}] no configuration found, plugin disabled", name);
            return Ok(());
        };
        let config = config.validate()?;

        let crypto = FieldCrypto::from_config(&config.crypto)?.map(Arc::new);
        let driver = drivers::connect(&config).await?;
        let message_crypto = crypto
            .as_ref()
            .map(|c| MessageCrypto::new(c.clone(), Arc::new(self.deps.crypto_policy.clone())));
        let decoder = MessageDecoder::new(Serializer::from_config(&config), message_crypto);
        info!(
            "[{}] initialised: backend {}, codec {}, crypto {}",
            name,
            driver.name(),
            decoder.codec().name(),
            crypto.is_some()
        );

        self.disabled.store(false, Ordering::Release);
        if let Some(previous) = self.connected.swap(Some(Arc::new(Connected {
            config,
            driver,
            decoder,
            crypto,
        }))) {
            warn!("[{}] init called twice, closing the previous driver", name);
            previous.driver.close().await?;
        }
        Ok(())
    }

    /// Registers and starts the connection probe when a status reporter is
    /// injected. Probe problems never fail the plugin.
    pub async fn after_init(&self) -> Result<()> {
        let (Some(reporter), Some(connected)) = (self.deps.status.clone(), self.connected.load_full()) else {
            return Ok(());
        };
        let root: Arc<dyn KeyValBroker> = Arc::new(connected.driver.new_broker(""));
        let probe = Arc::new(HealthProbe::new(
            &self.deps.plugin_name,
            connected.driver.name(),
            root,
        ));
        reporter.register_probe(&self.deps.plugin_name, probe.clone());
        debug!("[{}] probing {}", self.deps.plugin_name, probe.key());

        spawn_task(
            "kv-health-probe",
            &self.tasks,
            probe.run(reporter, connected.config.probe_interval(), self.shutdown.child_token()),
        );
        Ok(())
    }

    /// True when no configuration was found at init
    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    fn connected(&self) -> Result<Arc<Connected>> {
        match self.connected.load_full() {
            Some(connected) => Ok(connected),
            None if self.disabled() => Err(Error::Closed("key-value plugin is disabled")),
            None => Err(Error::Closed("key-value plugin is not initialised")),
        }
    }

    pub fn driver(&self) -> Result<Arc<dyn KvDriver>> {
        Ok(self.connected()?.driver.clone())
    }

    /// Configuration the plugin was initialised with
    pub fn config(&self) -> Result<KvConfig> {
        Ok(self.connected()?.config.clone())
    }

    /// Typed broker under `prefix`
    pub fn new_broker(
        &self,
        prefix: &str,
    ) -> Result<TypedBroker> {
        let connected = self.connected()?;
        Ok(TypedBroker::new(
            Self::bytes_broker(&connected, prefix),
            connected.decoder.clone(),
        ))
    }

    pub fn new_watcher(
        &self,
        prefix: &str,
    ) -> Result<TypedWatcher> {
        let connected = self.connected()?;
        Ok(TypedWatcher::new(
            Self::bytes_watcher(&connected, prefix),
            connected.decoder.clone(),
        ))
    }

    /// Byte broker under `prefix`; decrypts JSON envelopes when crypto is
    /// configured.
    pub fn new_broker_bytes(
        &self,
        prefix: &str,
    ) -> Result<Arc<dyn KeyValBroker>> {
        Ok(Self::bytes_broker(&*self.connected()?, prefix))
    }

    pub fn new_watcher_bytes(
        &self,
        prefix: &str,
    ) -> Result<Arc<dyn KeyValWatcher>> {
        Ok(Self::bytes_watcher(&*self.connected()?, prefix))
    }

    /// Typed broker under the prefix of the injected service label
    pub fn new_agent_broker(&self) -> Result<TypedBroker> {
        let label = self
            .deps
            .service_label
            .as_ref()
            .ok_or_else(|| Error::invalid("no service label injected"))?;
        self.new_broker(&label.agent_prefix())
    }

    fn bytes_broker(
        connected: &Connected,
        prefix: &str,
    ) -> Arc<dyn KeyValBroker> {
        let broker: Arc<dyn KeyValBroker> = Arc::new(connected.driver.new_broker(prefix));
        match &connected.crypto {
            Some(crypto) => Arc::new(CryptoBroker::new(broker, crypto.clone())),
            None => broker,
        }
    }

    fn bytes_watcher(
        connected: &Connected,
        prefix: &str,
    ) -> Arc<dyn KeyValWatcher> {
        let watcher: Arc<dyn KeyValWatcher> = Arc::new(connected.driver.new_watcher(prefix));
        match &connected.crypto {
            Some(crypto) => Arc::new(CryptoWatcher::new(watcher, crypto.clone())),
            None => watcher,
        }
    }

    /// Stops the probe and closes the driver; idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let mut errors = Vec::new();
        if let Some(connected) = self.connected.swap(None) {
            if let Err(e) = connected.driver.close().await {
                warn!("[{}] closing {} failed: {}", self.deps.plugin_name, connected.driver.name(), e);
                errors.push(e);
            }
            info!("[{}] closed", self.deps.plugin_name);
        }
        Error::aggregate(errors)
    }
}
