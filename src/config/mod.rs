//! Configuration of the key-value plugin.
//!
//! Settings are merged from several sources, later ones override earlier:
//! 1. Type defaults (every field has one)
//! 2. Configuration file (`UNIKV_CONFIG` environment variable or explicit path)
//! 3. Environment variables with the `UNIKV__` prefix, `__` as separator
//!
//! Keys are kebab-case (`op-timeout`). Environment variables cannot carry
//! dashes, so `UNIKV__ETCD__OP_TIMEOUT` is rewritten to `etcd.op-timeout`
//! before it is applied as an override. List options take comma-separated
//! values.

mod backends;
mod tls;
pub use backends::*;
pub use tls::*;

#[cfg(test)]
mod config_test;

use std::fmt::Debug;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::builder::DefaultState;
use config::ConfigBuilder;
use config::File;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::utils::async_task::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "UNIKV_CONFIG";

const ENV_PREFIX: &str = "UNIKV";
const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 30_000;
const RECONNECT_BASE_DELAY_MS: u64 = 100;

/// Backend a plugin instance connects to
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Etcd,
    Embedded,
    Consul,
    Redis,
    Filedb,
    #[default]
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Etcd => "etcd",
            BackendKind::Embedded => "embedded",
            BackendKind::Consul => "consul",
            BackendKind::Redis => "redis",
            BackendKind::Filedb => "filedb",
            BackendKind::Memory => "memory",
        }
    }
}

/// Content codec used by typed brokers
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Proto,
    Json,
}

/// Watch hub settings shared by every backend
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct WatchConfig {
    /// Drop an event a sink cannot take within this many milliseconds.
    /// Default: the backend op-timeout
    #[serde(default)]
    pub delivery_timeout: Option<u64>,

    /// Suppress identical consecutive Puts and repeated Deletes per key
    /// Default: false
    #[serde(default)]
    pub filter_dup_notifs: bool,

    /// How long a broken native watch stream (etcd, Redis) is re-opened
    /// before its subscription is cancelled, in milliseconds.
    /// Default: 30000
    #[serde(default)]
    pub reconnect_timeout: Option<u64>,
}

impl WatchConfig {
    /// Re-open schedule of native watch streams
    pub fn reconnect_policy(&self) -> BackoffPolicy {
        let total = self.reconnect_timeout.unwrap_or(DEFAULT_RECONNECT_TIMEOUT_MS);
        BackoffPolicy::spanning(Duration::from_millis(total), RECONNECT_BASE_DELAY_MS)
    }
}

/// Field encryption settings; empty `private-key-files` disables the crypto layer
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CryptoConfig {
    /// PEM-encoded RSA private keys tried in order when decrypting
    #[serde(default)]
    pub private_key_files: Vec<String>,

    /// PEM-encoded RSA public key used by write-side helpers
    #[serde(default)]
    pub public_key_file: Option<String>,
}

impl CryptoConfig {
    pub fn enabled(&self) -> bool {
        !self.private_key_files.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for path in self.private_key_files.iter().chain(self.public_key_file.iter()) {
            if !Path::new(path).is_file() {
                return Err(Error::Config(ConfigError::Message(format!(
                    "crypto key file {path} does not exist"
                ))));
            }
        }
        Ok(())
    }
}

/// Main configuration container of the key-value plugin
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct KvConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub codec: CodecKind,

    /// Expand `${NAME}` / `$NAME` in JSON values before decoding
    #[serde(default)]
    pub expand_env_vars: bool,

    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub embedded: EmbeddedConfig,
    #[serde(default)]
    pub consul: ConsulConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub filedb: FileDbConfig,
    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Interval of the connection health probe in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            codec: CodecKind::default(),
            expand_env_vars: false,
            etcd: EtcdConfig::default(),
            embedded: EmbeddedConfig::default(),
            consul: ConsulConfig::default(),
            redis: RedisConfig::default(),
            filedb: FileDbConfig::default(),
            memory: MemoryConfig::default(),
            watch: WatchConfig::default(),
            crypto: CryptoConfig::default(),
            probe_interval: default_probe_interval(),
        }
    }
}

fn default_probe_interval() -> u64 {
    10_000
}

impl KvConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` once every override is applied.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder();

        if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        let config: Self = env_overrides(builder)?.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Loads one file on top of the type defaults, environment still wins.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading key-value config from {:?}", path);

        let builder = Config::builder().add_source(File::from(path).required(true));
        let config: Self = env_overrides(builder)?.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validates the selected backend section and the shared sections.
    pub fn validate(self) -> Result<Self> {
        match self.backend {
            BackendKind::Etcd => self.etcd.validate()?,
            BackendKind::Embedded => self.embedded.validate()?,
            BackendKind::Consul => self.consul.validate()?,
            BackendKind::Redis => self.redis.validate()?,
            BackendKind::Filedb => self.filedb.validate()?,
            BackendKind::Memory => self.memory.validate()?,
        }
        if self.probe_interval == 0 {
            return Err(Error::Config(ConfigError::Message(
                "probe-interval must be at least 1ms".into(),
            )));
        }
        if let Some(0) = self.watch.delivery_timeout {
            return Err(Error::Config(ConfigError::Message(
                "watch.delivery-timeout must be at least 1ms".into(),
            )));
        }
        if let Some(0) = self.watch.reconnect_timeout {
            return Err(Error::Config(ConfigError::Message(
                "watch.reconnect-timeout must be at least 1ms".into(),
            )));
        }
        self.crypto.validate()?;
        Ok(self)
    }

    /// Op-timeout of the selected backend
    pub fn op_timeout(&self) -> Duration {
        let ms = match self.backend {
            BackendKind::Etcd => self.etcd.op_timeout,
            BackendKind::Embedded => self.embedded.op_timeout,
            BackendKind::Consul => self.consul.op_timeout,
            BackendKind::Redis => self.redis.op_timeout,
            BackendKind::Filedb => self.filedb.op_timeout,
            BackendKind::Memory => self.memory.op_timeout,
        };
        Duration::from_millis(ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval)
    }

    /// Delivery timeout of the watch hub, defaulting to the backend op-timeout
    pub fn delivery_timeout(&self) -> Duration {
        self.watch
            .delivery_timeout
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.op_timeout())
    }
}

const LIST_KEYS: &[&str] = &[
    "etcd.endpoints",
    "redis.endpoints",
    "filedb.paths",
    "crypto.private-key-files",
];

/// Applies `UNIKV__SECTION__SOME_KEY=value` as override `section.some-key`.
fn env_overrides(
    mut builder: ConfigBuilder<DefaultState>
) -> Result<ConfigBuilder<DefaultState>> {
    let prefix = format!("{ENV_PREFIX}__");
    for (name, value) in std::env::vars() {
        let Some(path) = name.strip_prefix(&prefix) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let key = env_key_to_path(path);
        builder = if LIST_KEYS.contains(&key.as_str()) {
            let items: Vec<String> = value.split(',').map(|s| s.trim().to_string()).collect();
            builder.set_override(key, items)?
        } else {
            builder.set_override(key, value)?
        };
    }
    Ok(builder)
}

fn env_key_to_path(name: &str) -> String {
    name.split("__")
        .map(|segment| segment.to_lowercase().replace('_', "-"))
        .collect::<Vec<_>>()
        .join(".")
}

/// Supplies the plugin configuration; `Ok(None)` means "not configured"
/// and leaves the plugin disabled.
#[cfg_attr(test, automock)]
pub trait ConfigSource: Send + Sync {
    fn load(
        &self,
        plugin_name: &str,
    ) -> Result<Option<KvConfig>>;
}

/// Reads the configuration from a file; the file path comes from the
/// constructor or, failing that, from `UNIKV_CONFIG`.
#[derive(Debug, Clone, Default)]
pub struct FileConfigSource {
    path: Option<PathBuf>,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn from_env() -> Self {
        Self {
            path: std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from),
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(
        &self,
        plugin_name: &str,
    ) -> Result<Option<KvConfig>> {
        match &self.path {
            Some(path) if path.is_file() => {
                debug!("[{}] configuration file {:?}", plugin_name, path);
                KvConfig::from_file(path).map(Some)
            }
            Some(path) => {
                debug!("[{}] configuration file {:?} not found", plugin_name, path);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Static configuration handed over by the host
impl ConfigSource for KvConfig {
    fn load(
        &self,
        _plugin_name: &str,
    ) -> Result<Option<KvConfig>> {
        Ok(Some(self.clone()))
    }
}
