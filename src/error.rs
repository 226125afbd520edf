//! # Error Taxonomy
//!
//! Crate-wide status codes shared by the cache dataplane and the
//! point-to-point engine. Numeric codes are stable: they cross the wire
//! in `Status` control messages and in response slots, so renumbering is
//! a protocol break.

use thiserror::Error;

/// Stable numeric code carried on the wire for each error kind.
///
/// `0` is reserved for success and never appears inside a [`KvError`].
pub mod code {
    /// Operation completed.
    pub const SUCCESS: u32 = 0;
    /// Unclassified failure.
    pub const FAILED: u32 = 1;
    /// Rejected at the entry boundary; no side effects occurred.
    pub const PARAM_INVALID: u32 = 2;
    /// A deadline elapsed; the operation was aborted.
    pub const TIMEOUT: u32 = 3;
    /// A pool or allocator could not satisfy the request.
    pub const OUT_OF_MEMORY: u32 = 4;
    /// The target cluster is not linked yet.
    pub const NOT_YET_LINK: u32 = 5;
    /// The target cluster is already linked.
    pub const ALREADY_LINK: u32 = 6;
    /// Link establishment failed.
    pub const LINK_FAILED: u32 = 7;
    /// Link teardown failed.
    pub const UNLINK_FAILED: u32 = 8;
    /// No cache matches the given id or key.
    pub const CACHE_NOT_EXIST: u32 = 9;
    /// The operation requires a feature that was not enabled.
    pub const FEATURE_NOT_ENABLED: u32 = 10;
    /// A bounded resource (channels, buffers) is exhausted.
    pub const RESOURCE_EXHAUSTED: u32 = 11;
    /// The link is busy with a conflicting operation.
    pub const LINK_BUSY: u32 = 12;
    /// The endpoint is already connected.
    pub const ALREADY_CONNECTED: u32 = 13;
    /// The endpoint is not connected.
    pub const NOT_CONNECTED: u32 = 14;
}

/// Errors surfaced by kvlink operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Unclassified failure
    #[error("Operation failed: {0}")]
    Failed(String),

    /// Invalid parameter, rejected before any side effect
    #[error("Invalid parameter: {0}")]
    ParamInvalid(String),

    /// Deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Allocation failure
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Cluster not linked
    #[error("Not linked yet: {0}")]
    NotYetLink(String),

    /// Cluster already linked
    #[error("Already linked: {0}")]
    AlreadyLink(String),

    /// Link establishment failure
    #[error("Link failed: {0}")]
    LinkFailed(String),

    /// Link teardown failure
    #[error("Unlink failed: {0}")]
    UnlinkFailed(String),

    /// Unknown cache id or key
    #[error("Cache does not exist: {0}")]
    CacheNotExist(String),

    /// Feature gate is closed
    #[error("Feature not enabled: {0}")]
    FeatureNotEnabled(String),

    /// Bounded resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Conflicting link operation in flight
    #[error("Link busy: {0}")]
    LinkBusy(String),

    /// Endpoint already connected
    #[error("Already connected: {0}")]
    AlreadyConnected(String),

    /// Endpoint not connected
    #[error("Not connected: {0}")]
    NotConnected(String),
}

impl KvError {
    /// Stable numeric code for this error, as carried on the wire.
    pub fn code(&self) -> u32 {
        match self {
            KvError::Failed(_) => code::FAILED,
            KvError::ParamInvalid(_) => code::PARAM_INVALID,
            KvError::Timeout(_) => code::TIMEOUT,
            KvError::OutOfMemory(_) => code::OUT_OF_MEMORY,
            KvError::NotYetLink(_) => code::NOT_YET_LINK,
            KvError::AlreadyLink(_) => code::ALREADY_LINK,
            KvError::LinkFailed(_) => code::LINK_FAILED,
            KvError::UnlinkFailed(_) => code::UNLINK_FAILED,
            KvError::CacheNotExist(_) => code::CACHE_NOT_EXIST,
            KvError::FeatureNotEnabled(_) => code::FEATURE_NOT_ENABLED,
            KvError::ResourceExhausted(_) => code::RESOURCE_EXHAUSTED,
            KvError::LinkBusy(_) => code::LINK_BUSY,
            KvError::AlreadyConnected(_) => code::ALREADY_CONNECTED,
            KvError::NotConnected(_) => code::NOT_CONNECTED,
        }
    }

    /// Rebuild an error from a wire code and message.
    ///
    /// Unknown codes (including 0, which peers must never send inside an
    /// error status) collapse to [`KvError::Failed`] with the code noted.
    pub fn from_code(error_code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        match error_code {
            code::PARAM_INVALID => KvError::ParamInvalid(message),
            code::TIMEOUT => KvError::Timeout(message),
            code::OUT_OF_MEMORY => KvError::OutOfMemory(message),
            code::NOT_YET_LINK => KvError::NotYetLink(message),
            code::ALREADY_LINK => KvError::AlreadyLink(message),
            code::LINK_FAILED => KvError::LinkFailed(message),
            code::UNLINK_FAILED => KvError::UnlinkFailed(message),
            code::CACHE_NOT_EXIST => KvError::CacheNotExist(message),
            code::FEATURE_NOT_ENABLED => KvError::FeatureNotEnabled(message),
            code::RESOURCE_EXHAUSTED => KvError::ResourceExhausted(message),
            code::LINK_BUSY => KvError::LinkBusy(message),
            code::ALREADY_CONNECTED => KvError::AlreadyConnected(message),
            code::NOT_CONNECTED => KvError::NotConnected(message),
            code::FAILED => KvError::Failed(message),
            other => KvError::Failed(format!("peer code {}: {}", other, message)),
        }
    }
}

impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Failed(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for KvError {
    fn from(err: serde_json::Error) -> Self {
        KvError::Failed(format!("JSON error: {}", err))
    }
}

/// Result alias used throughout the crate.
pub type KvResult<T> = Result<T, KvError>;
