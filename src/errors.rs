//! Error hierarchy of the key-value layer
//!
//! Every public operation fails with one of the contract kinds listed in
//! [`ErrorKind`]. Backend library errors are folded into those kinds while the
//! original cause is kept as the error source for diagnostics.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Contract-level classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Closed,
    Invalid,
    Unsupported,
    Unavailable,
    Timeout,
    Conflict,
    DecryptFailed,
    CrossSlot,
    Config,
    Codec,
    Multi,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key does not exist
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Driver, broker, watcher, iterator or transaction already closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Caller-supplied argument violates the contract
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// Operation not implemented by this backend
    #[error("Operation `{op}` is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        op: &'static str,
    },

    /// Backend connectivity lost or backend-side failure; may be transient
    #[error("Backend unavailable: {0}")]
    Unavailable(#[source] BackendError),

    /// Operation exceeded its deadline
    #[error("Operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Transactional precondition failed
    #[error("Precondition failed: {0}")]
    Conflict(String),

    /// None of the configured private keys decrypted the payload
    #[error("Decryption failed with every configured private key")]
    DecryptFailed(#[source] Option<rsa::Error>),

    /// Batched operation spans more than one cluster hash slot
    #[error("Batched operation spans hash slots {0:?}")]
    CrossSlot(Vec<u16>),

    /// Configuration loading or validation failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Message (de)serialization failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Aggregated failures from a best-effort close
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multi(Vec<Error>),
}

/// Original cause of an [`Error::Unavailable`]
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Embedded database error: {0}")]
    Sled(#[from] sled::Error),

    #[cfg(feature = "etcd")]
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "consul")]
    #[error("consul http error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "filedb")]
    #[error("filesystem watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("`{0}` was cancelled by the caller")]
    Cancelled(&'static str),

    #[error("{0}")]
    Message(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Protobuf encode failed: {0}")]
    ProtoEncode(#[from] prost::EncodeError),

    #[error("Protobuf decode failed: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode (de)serialization failed: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Closed(_) => ErrorKind::Closed,
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::DecryptFailed(_) => ErrorKind::DecryptFailed,
            Error::CrossSlot(_) => ErrorKind::CrossSlot,
            Error::Config(_) => ErrorKind::Config,
            Error::Codec(_) => ErrorKind::Codec,
            Error::Multi(_) => ErrorKind::Multi,
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable | ErrorKind::Timeout)
    }

    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(BackendError::Message(msg.into()))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    /// Folds close results into `Ok` or a single error.
    pub(crate) fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multi(errors)),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

// ============== Conversion Implementations ============== //

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Unavailable(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Unavailable(BackendError::Io(e))
    }
}

impl From<JoinError> for Error {
    fn from(e: JoinError) -> Self {
        Error::Unavailable(BackendError::TaskFailed(e))
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Unsupported(msg) => Error::Invalid(msg),
            sled::Error::CollectionNotFound(name) => Error::Invalid(format!(
                "bucket {} does not exist",
                String::from_utf8_lossy(&name)
            )),
            other => Error::Unavailable(BackendError::Sled(other)),
        }
    }
}

impl<E: Into<Error>> From<sled::transaction::TransactionError<E>> for Error {
    fn from(err: sled::transaction::TransactionError<E>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e.into(),
            sled::transaction::TransactionError::Storage(e) => e.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(CodecError::Json(e))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Codec(CodecError::ProtoDecode(e))
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::Codec(CodecError::ProtoEncode(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(CodecError::Bincode(e))
    }
}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Error::DecryptFailed(Some(e))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Codec(CodecError::Base64(e))
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        use etcd_client::Error as E;
        match err {
            E::InvalidArgs(msg) => Error::Invalid(msg),
            E::GRPCStatus(status) => match status.code() {
                tonic::Code::InvalidArgument | tonic::Code::OutOfRange => {
                    Error::Invalid(status.message().to_string())
                }
                tonic::Code::FailedPrecondition => Error::Conflict(status.message().to_string()),
                tonic::Code::DeadlineExceeded => Error::Timeout {
                    op: "etcd",
                    after: std::time::Duration::ZERO,
                },
                _ => Error::Unavailable(BackendError::Etcd(E::GRPCStatus(status))),
            },
            other => Error::Unavailable(BackendError::Etcd(other)),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::CrossSlot => Error::CrossSlot(Vec::new()),
            redis::ErrorKind::TypeError | redis::ErrorKind::InvalidClientConfig => {
                Error::Invalid(err.to_string())
            }
            redis::ErrorKind::ExecAbortError => Error::Conflict(err.to_string()),
            _ => Error::Unavailable(BackendError::Redis(err)),
        }
    }
}

#[cfg(feature = "consul")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Unavailable(BackendError::Http(err))
    }
}

#[cfg(feature = "filedb")]
impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Unavailable(BackendError::Notify(err))
    }
}
