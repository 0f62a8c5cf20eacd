//! Infrastructure error types with retry/fatal classification.
//!
//! [`InfraError`] is the central error type for the crate. Each variant maps
//! to a numeric error code and to one of three propagation classes:
//! retryable (the caller may try again), fatal (a broken invariant or a
//! configuration problem) or plain (a per-request failure such as a missing
//! record).

use uuid::Uuid;

/// Coarse propagation class for an [`InfraError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: the same call may succeed later.
    Retryable,
    /// Broken invariant or configuration: escalate to the process owner.
    Fatal,
    /// Ordinary request failure.
    Request,
}

/// Crate-wide error enum.
///
/// # Error Code Ranges
///
/// | Range     | Category             |
/// |-----------|----------------------|
/// | 1000–1999 | Connection pool      |
/// | 2000–2999 | Cache                |
/// | 3000–3999 | Worker pool          |
/// | 4000–4999 | Storage / data       |
/// | 5000–5999 | Startup / config     |
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    /// No pooled handle is free and the caller asked not to wait.
    #[error("connection pool exhausted ({max_size} handles in use)")]
    ConnectionExhausted {
        /// Configured maximum pool size.
        max_size: usize,
    },

    /// No pooled handle became free within the connect timeout.
    #[error("timed out after {timeout_ms} ms waiting for a pooled connection")]
    ConnectionTimeout {
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The pool was closed while the caller was waiting or holding a lease.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The external cache service could not be reached.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// A worker task did not complete before its deadline.
    #[error("worker task {task_id} timed out after {timeout_ms} ms")]
    WorkerTimeout {
        /// Correlation id of the rejected task.
        task_id: Uuid,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The worker executing a task terminated abnormally.
    #[error("worker crashed while running task {task_id}")]
    WorkerCrash {
        /// Correlation id of the task that was running.
        task_id: Uuid,
    },

    /// Every worker is busy and the wait queue is full.
    #[error("worker queue full ({capacity} tasks waiting)")]
    WorkerQueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The worker pool has been shut down.
    #[error("worker pool is closed")]
    WorkerPoolClosed,

    /// Startup probe or backend construction failed.
    #[error("initialization failed: {0}")]
    InitializationFailure(String),

    /// Backing store rejected or failed a query.
    #[error("storage error: {0}")]
    Storage(String),

    /// A value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A compressed payload could not be decoded.
    #[error("compression error: {0}")]
    Compression(String),

    /// Filesystem failure (audit segments, backups).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl InfraError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::ConnectionExhausted { .. } => 1001,
            Self::ConnectionTimeout { .. } => 1002,
            Self::PoolClosed => 1003,
            Self::CacheUnavailable(_) => 2001,
            Self::WorkerTimeout { .. } => 3001,
            Self::WorkerCrash { .. } => 3002,
            Self::WorkerQueueFull { .. } => 3003,
            Self::WorkerPoolClosed => 3004,
            Self::Storage(_) => 4001,
            Self::Serialization(_) => 4002,
            Self::Compression(_) => 4003,
            Self::Io(_) => 4004,
            Self::NotFound(_) => 4040,
            Self::InitializationFailure(_) => 5001,
            Self::Configuration(_) => 5002,
            Self::Internal(_) => 5000,
        }
    }

    /// Returns the propagation class for this variant.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectionExhausted { .. }
            | Self::ConnectionTimeout { .. }
            | Self::CacheUnavailable(_)
            | Self::WorkerTimeout { .. }
            | Self::WorkerCrash { .. }
            | Self::WorkerQueueFull { .. }
            | Self::Storage(_) => ErrorClass::Retryable,
            Self::InitializationFailure(_)
            | Self::Configuration(_)
            | Self::PoolClosed
            | Self::WorkerPoolClosed
            | Self::Internal(_) => ErrorClass::Fatal,
            Self::Serialization(_) | Self::Compression(_) | Self::Io(_) | Self::NotFound(_) => {
                ErrorClass::Request
            }
        }
    }

    /// Returns `true` if the caller may retry the failed operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Retryable)
    }

    /// Returns `true` if the error indicates a broken invariant or a
    /// configuration problem that must reach the process owner.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Fatal)
    }
}

impl From<sqlx::Error> for InfraError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::ConnectionTimeout { timeout_ms: 0 },
            sqlx::Error::PoolClosed => Self::PoolClosed,
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for InfraError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::InitializationFailure(format!("schema migration failed: {err}"))
    }
}

impl From<redis::RedisError> for InfraError {
    fn from(err: redis::RedisError) -> Self {
        Self::CacheUnavailable(err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, InfraError>;
