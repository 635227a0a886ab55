use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use super::FieldCrypto;
use crate::KvMessage;
use crate::Result;

/// Encrypted field paths per message type
#[derive(Debug, Clone, Default)]
pub struct CryptoPolicy {
    paths: HashMap<TypeId, Vec<String>>,
}

impl CryptoPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the dotted field paths of `M` that hold encrypted values.
    pub fn with<M: KvMessage>(
        mut self,
        paths: &[&str],
    ) -> Self {
        self.register::<M>(paths);
        self
    }

    pub fn register<M: KvMessage>(
        &mut self,
        paths: &[&str],
    ) {
        self.paths
            .entry(TypeId::of::<M>())
            .or_default()
            .extend(paths.iter().map(|p| p.to_string()));
    }

    pub fn paths_for<M: KvMessage>(&self) -> &[String] {
        self.paths.get(&TypeId::of::<M>()).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Field crypto plus the policy saying where it applies; shared by typed
/// brokers and watchers.
#[derive(Debug, Clone)]
pub struct MessageCrypto {
    crypto: Arc<FieldCrypto>,
    policy: Arc<CryptoPolicy>,
}

impl MessageCrypto {
    pub fn new(
        crypto: Arc<FieldCrypto>,
        policy: Arc<CryptoPolicy>,
    ) -> Self {
        Self { crypto, policy }
    }

    pub fn crypto(&self) -> &Arc<FieldCrypto> {
        &self.crypto
    }

    pub fn policy(&self) -> &CryptoPolicy {
        &self.policy
    }

    /// Decrypts the policy fields of a freshly decoded message.
    pub fn decrypt<M: KvMessage>(
        &self,
        msg: &mut M,
    ) -> Result<()> {
        self.crypto.wrap_message(msg, self.policy.paths_for::<M>())
    }

    pub fn encrypt<M: KvMessage>(
        &self,
        msg: &mut M,
    ) -> Result<()> {
        self.crypto.encrypt_message(msg, self.policy.paths_for::<M>())
    }
}
