use std::time::Duration;

/// Backend-assigned modification counter; 0 where the backend has none
pub type Revision = u64;

/// Value plus the revision it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: Revision,
}

/// Key, value and revision of one listed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: Revision,
}

/// Entry of a keys-only listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVal {
    pub key: String,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change observed by a watcher.
///
/// `value` is set for `Put` only. `prev_value` is whatever the backend could
/// supply; `None` means unknown or absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub prev_value: Option<Vec<u8>>,
    pub revision: Revision,
}

impl ChangeEvent {
    pub fn put(
        key: impl Into<String>,
        value: Vec<u8>,
        prev_value: Option<Vec<u8>>,
        revision: Revision,
    ) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: Some(value),
            prev_value,
            revision,
        }
    }

    pub fn delete(
        key: impl Into<String>,
        prev_value: Option<Vec<u8>>,
        revision: Revision,
    ) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: None,
            prev_value,
            revision,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Expire the key after this long; backends without TTL reject it
    pub ttl: Option<Duration>,
}

impl PutOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Treat the key as a prefix and delete everything under it
    pub prefix: bool,
}

impl DeleteOptions {
    pub fn with_prefix() -> Self {
        Self { prefix: true }
    }
}

/// One step of a transaction, keys are already absolute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl TxnOp {
    pub fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } | TxnOp::Delete { key } => key,
        }
    }
}

/// What a driver supports natively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub txn: bool,
    pub ttl: bool,
    pub revisions: bool,
    pub writable: bool,
}
