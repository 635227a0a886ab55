use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::TlsConfig;
use crate::Error;
use crate::Result;

fn config_error(msg: impl Into<String>) -> Error {
    Error::Config(ConfigError::Message(msg.into()))
}

fn validate_op_timeout(
    backend: &str,
    op_timeout_ms: u64,
) -> Result<()> {
    if op_timeout_ms == 0 {
        return Err(config_error(format!("{backend}.op-timeout must be at least 1ms")));
    }
    Ok(())
}

//---------------------------------------------------------------------------
// etcd

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct EtcdConfig {
    /// Cluster members, `host:port` or full URLs
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,

    /// Default per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Interval between revision compactions in milliseconds, 0 disables
    #[serde(default)]
    pub auto_compact: u64,

    #[serde(flatten, default)]
    pub tls: TlsConfig,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            dial_timeout: default_dial_timeout(),
            op_timeout: default_op_timeout(),
            username: None,
            password: None,
            auto_compact: 0,
            tls: TlsConfig::default(),
        }
    }
}

impl EtcdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(config_error("etcd.endpoints must not be empty"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(config_error("etcd.username and etcd.password go together"));
        }
        validate_op_timeout("etcd", self.op_timeout)?;
        self.tls.validate()
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout)
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".into()]
}

//---------------------------------------------------------------------------
// embedded single-file store

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct EmbeddedConfig {
    /// Database location
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Store every non-final key segment as a nested bucket
    #[serde(default)]
    pub split_key_to_buckets: bool,

    /// Segment separator used when `split-key-to-buckets` is on
    #[serde(default = "default_bucket_separator")]
    pub bucket_separator: String,

    /// How long to keep retrying while another process holds the database lock (ms)
    #[serde(default)]
    pub lock_timeout: u64,

    /// Default per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout: u64,

    /// Page cache budget in bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            split_key_to_buckets: false,
            bucket_separator: default_bucket_separator(),
            lock_timeout: 0,
            op_timeout: default_op_timeout(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl EmbeddedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(config_error("embedded.db-path must not be empty"));
        }
        if self.split_key_to_buckets && self.bucket_separator.is_empty() {
            return Err(config_error(
                "embedded.bucket-separator must not be empty in bucket tree mode",
            ));
        }
        validate_op_timeout("embedded", self.op_timeout)
    }
}

fn default_db_path() -> String {
    "./db/unikv".into()
}
fn default_bucket_separator() -> String {
    "/".into()
}
fn default_cache_capacity() -> u64 {
    10 * 1024 * 1024 //10MB
}

//---------------------------------------------------------------------------
// Consul

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ConsulConfig {
    /// Agent HTTP address, e.g. `http://127.0.0.1:8500`
    #[serde(default = "default_consul_address")]
    pub address: String,

    /// ACL token sent as `X-Consul-Token`
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub datacenter: Option<String>,

    /// Default per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout: u64,

    /// Server-side wait of one blocking query in milliseconds
    #[serde(default = "default_blocking_wait")]
    pub blocking_wait: u64,

    #[serde(flatten, default)]
    pub tls: TlsConfig,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            token: None,
            datacenter: None,
            op_timeout: default_op_timeout(),
            blocking_wait: default_blocking_wait(),
            tls: TlsConfig::default(),
        }
    }
}

impl ConsulConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.address.starts_with("http://") && !self.address.starts_with("https://") {
            return Err(config_error(format!(
                "consul.address must be an http(s) URL, got {}",
                self.address
            )));
        }
        if self.blocking_wait == 0 {
            return Err(config_error("consul.blocking-wait must be at least 1ms"));
        }
        validate_op_timeout("consul", self.op_timeout)?;
        self.tls.validate()
    }
}

fn default_consul_address() -> String {
    "http://127.0.0.1:8500".into()
}
fn default_blocking_wait() -> u64 {
    30_000
}

//---------------------------------------------------------------------------
// Redis

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RedisConfig {
    /// Node URLs (`redis://host:port`); several endpoints imply cluster mode
    #[serde(default = "default_redis_endpoints")]
    pub endpoints: Vec<String>,

    /// Force cluster mode even with a single seed endpoint
    #[serde(default)]
    pub cluster: bool,

    /// Logical database index, single-node mode only
    #[serde(default)]
    pub db: i64,

    #[serde(default)]
    pub password: Option<String>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,

    /// Default per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            endpoints: default_redis_endpoints(),
            cluster: false,
            db: 0,
            password: None,
            dial_timeout: default_dial_timeout(),
            op_timeout: default_op_timeout(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(config_error("redis.endpoints must not be empty"));
        }
        if self.is_cluster() && self.db != 0 {
            return Err(config_error("redis.db is not supported in cluster mode"));
        }
        validate_op_timeout("redis", self.op_timeout)
    }

    pub fn is_cluster(&self) -> bool {
        self.cluster || self.endpoints.len() > 1
    }
}

fn default_redis_endpoints() -> Vec<String> {
    vec!["redis://127.0.0.1:6379".into()]
}

//---------------------------------------------------------------------------
// filesystem

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct FileDbConfig {
    /// JSON files and directories of JSON files
    #[serde(default)]
    pub paths: Vec<String>,

    /// Default per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout: u64,
}

impl Default for FileDbConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            op_timeout: default_op_timeout(),
        }
    }
}

impl FileDbConfig {
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(config_error("filedb.paths must list at least one file or directory"));
        }
        validate_op_timeout("filedb", self.op_timeout)
    }
}

//---------------------------------------------------------------------------
// in-process memory store

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct MemoryConfig {
    /// Default per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout: u64,

    /// Interval of the expired-key sweeper in milliseconds
    #[serde(default = "default_ttl_sweep_interval")]
    pub ttl_sweep_interval: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            op_timeout: default_op_timeout(),
            ttl_sweep_interval: default_ttl_sweep_interval(),
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ttl_sweep_interval == 0 {
            return Err(config_error("memory.ttl-sweep-interval must be at least 1ms"));
        }
        validate_op_timeout("memory", self.op_timeout)
    }
}

fn default_ttl_sweep_interval() -> u64 {
    500
}

//---------------------------------------------------------------------------

// in ms
fn default_dial_timeout() -> u64 {
    1_000
}
// in ms
pub(crate) fn default_op_timeout() -> u64 {
    3_000
}
