//! Backend drivers.
//!
//! Networked backends sit behind cargo features; selecting a backend whose
//! feature is off fails with `Unsupported` at connect time.

mod embedded;
mod mem;

#[cfg(feature = "consul")]
mod consul;
#[cfg(feature = "etcd")]
mod etcd;
#[cfg(feature = "filedb")]
mod filedb;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "consul")]
pub use consul::ConsulDriver;
pub use embedded::EmbeddedDriver;
#[cfg(feature = "etcd")]
pub use etcd::EtcdDriver;
#[cfg(feature = "filedb")]
pub use filedb::FileDbDriver;
pub use mem::MemDriver;
#[cfg(feature = "redis")]
pub use self::redis::RedisDriver;

#[cfg(all(test, feature = "etcd"))]
mod etcd_test;

use std::sync::Arc;

use tracing::info;

use crate::BackendKind;
use crate::Error;
use crate::KvConfig;
use crate::KvDriver;
use crate::Result;

/// Connects the backend selected by `config.backend`.
pub async fn connect(config: &KvConfig) -> Result<Arc<dyn KvDriver>> {
    let driver: Arc<dyn KvDriver> = match config.backend {
        BackendKind::Memory => Arc::new(MemDriver::new(&config.memory, &config.watch)),
        BackendKind::Embedded => Arc::new(EmbeddedDriver::open(&config.embedded, &config.watch).await?),
        #[cfg(feature = "etcd")]
        BackendKind::Etcd => Arc::new(EtcdDriver::connect(&config.etcd, &config.watch).await?),
        #[cfg(feature = "consul")]
        BackendKind::Consul => Arc::new(ConsulDriver::connect(&config.consul, &config.watch)?),
        #[cfg(feature = "redis")]
        BackendKind::Redis => Arc::new(RedisDriver::connect(&config.redis, &config.watch).await?),
        #[cfg(feature = "filedb")]
        BackendKind::Filedb => Arc::new(FileDbDriver::open(&config.filedb, &config.watch).await?),
        #[allow(unreachable_patterns)]
        other => {
            return Err(Error::Unsupported {
                backend: other.as_str(),
                op: "connect",
            })
        }
    };
    info!("[{}] backend connected", driver.name());
    Ok(driver)
}
