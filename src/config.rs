//! Service configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Every section implements [`Default`]
//! so components can be built directly in tests.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::InfraError;

/// Top-level configuration.
///
/// Loaded once at startup via [`AppConfig::from_env`].
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Relational store and connection pool settings.
    pub database: DatabaseConfig,
    /// Cache service settings.
    pub cache: CacheConfig,
    /// Analysis worker pool settings.
    pub workers: WorkerConfig,
    /// Signed audit log settings.
    pub audit: AuditConfig,
    /// Background compression and backup sweeps.
    pub maintenance: MaintenanceConfig,
}

/// Which storage backend implementation to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    /// PostgreSQL through `sqlx`.
    Postgres,
    /// In-process store; data lives as long as the process.
    Memory,
}

/// Which cache store implementation to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    /// Redis (or a RESP-compatible service).
    Redis,
    /// In-process LRU store.
    Memory,
}

/// Relational store connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Backend implementation.
    pub backend: StorageBackendKind,
    /// Database host name.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Require TLS to the database.
    pub ssl: bool,
    /// Maximum number of simultaneously checked-out handles.
    pub max_pool_size: u32,
    /// Minimum idle connections kept open.
    pub min_pool_size: u32,
    /// Idle connections are closed after this long.
    pub idle_timeout: Duration,
    /// Maximum wait for a handle before `ConnectionTimeout`.
    pub connection_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Postgres,
            host: "localhost".to_string(),
            port: 5432,
            database: "veritas".to_string(),
            user: "veritas".to_string(),
            password: "veritas".to_string(),
            ssl: false,
            max_pool_size: 10,
            min_pool_size: 2,
            idle_timeout: Duration::from_millis(30_000),
            connection_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Cache service settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache store implementation.
    pub backend: CacheBackendKind,
    /// Connection URL for the Redis backend.
    pub redis_url: String,
    /// `maxmemory` pushed to the cache service, in bytes (0 = unlimited).
    pub max_memory_bytes: u64,
    /// `maxmemory-policy` pushed to the cache service.
    pub eviction_policy: String,
    /// Interval between memory usage polls.
    pub memory_check_interval: Duration,
    /// used/max ratio at which alerts fire, in `0.0..=1.0`.
    pub memory_alert_threshold: f64,
    /// Serialized values strictly larger than this are compressed.
    pub compression_threshold: usize,
    /// TTL applied when the caller does not pass one.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_memory_bytes: 256 * 1024 * 1024,
            eviction_policy: "allkeys-lru".to_string(),
            memory_check_interval: Duration::from_millis(60_000),
            memory_alert_threshold: 0.8,
            compression_threshold: 10_000,
            default_ttl: Duration::from_secs(3_600),
        }
    }
}

/// Analysis worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Fixed number of worker slots.
    pub max_workers: usize,
    /// Default per-task deadline (queue wait plus execution).
    pub task_timeout: Duration,
    /// Maximum number of dispatches waiting for a free worker.
    pub queue_capacity: usize,
    /// Payloads shorter than this run inline when every worker is busy.
    /// `0` disables the inline path.
    pub inline_threshold: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            task_timeout: Duration::from_secs(30),
            queue_capacity: 64,
            inline_threshold: 1_024,
        }
    }
}

/// Signed audit log settings.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Directory holding the live segments and the `archive/` folder.
    pub log_dir: PathBuf,
    /// Rotate the live segment once it reaches this many bytes.
    pub max_segment_bytes: u64,
    /// Number of rotated segments kept besides the live one.
    pub max_segments: usize,
    /// Default horizon for [`crate::audit::AuditTrail::archive`].
    pub retention_days: u32,
    /// HMAC key; a random key is generated when unset.
    pub signing_key: Option<String>,
    /// Value written to each entry's `source` field.
    pub source: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs/audit"),
            max_segment_bytes: 10 * 1024 * 1024,
            max_segments: 5,
            retention_days: 90,
            signing_key: None,
            source: "veritas-infra".to_string(),
        }
    }
}

/// Background sweep settings.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval of the compression sweep.
    pub compression_interval: Duration,
    /// A record must be idle at least this many days to be compressed.
    pub compression_min_idle_days: u32,
    /// A record must have fewer accesses than this to be compressed.
    pub compression_max_access_count: u64,
    /// Interval of the backup sweep.
    pub backup_interval: Duration,
    /// Directory receiving backup snapshots.
    pub backup_dir: PathBuf,
    /// Backups older than this many days are pruned.
    pub backup_retention_days: u32,
    /// Records processed per scan batch.
    pub batch_size: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            compression_interval: Duration::from_secs(24 * 3_600),
            compression_min_idle_days: 7,
            compression_max_access_count: 5,
            backup_interval: Duration::from_secs(6 * 3_600),
            backup_dir: PathBuf::from("backups"),
            backup_retention_days: 7,
            batch_size: 200,
        }
    }
}

impl AppConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set or cannot be
    /// parsed. Calls `dotenvy::dotenv().ok()` to optionally load a `.env`
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Configuration`] if `STORAGE_BACKEND`,
    /// `CACHE_BACKEND` or `CACHE_MAX_MEMORY` is set to an unrecognized value.
    pub fn from_env() -> Result<Self, InfraError> {
        dotenvy::dotenv().ok();

        let db_defaults = DatabaseConfig::default();
        let backend = match std::env::var("STORAGE_BACKEND").ok().as_deref() {
            None | Some("postgres") | Some("postgresql") => StorageBackendKind::Postgres,
            Some("memory") => StorageBackendKind::Memory,
            Some(other) => {
                return Err(InfraError::Configuration(format!(
                    "unknown STORAGE_BACKEND `{other}`"
                )));
            }
        };
        let database = DatabaseConfig {
            backend,
            host: env_or("DATABASE_HOST", db_defaults.host),
            port: parse_env("DATABASE_PORT", db_defaults.port),
            database: env_or("DATABASE_NAME", db_defaults.database),
            user: env_or("DATABASE_USER", db_defaults.user),
            password: env_or("DATABASE_PASSWORD", db_defaults.password),
            ssl: parse_env_bool("DATABASE_SSL", db_defaults.ssl),
            max_pool_size: parse_env("DATABASE_MAX_POOL_SIZE", db_defaults.max_pool_size),
            min_pool_size: parse_env("DATABASE_MIN_POOL_SIZE", db_defaults.min_pool_size),
            idle_timeout: parse_env_millis("DATABASE_IDLE_TIMEOUT_MS", db_defaults.idle_timeout),
            connection_timeout: parse_env_millis(
                "DATABASE_CONNECTION_TIMEOUT_MS",
                db_defaults.connection_timeout,
            ),
        };

        let cache_defaults = CacheConfig::default();
        let cache_backend = match std::env::var("CACHE_BACKEND").ok().as_deref() {
            None | Some("redis") => CacheBackendKind::Redis,
            Some("memory") => CacheBackendKind::Memory,
            Some(other) => {
                return Err(InfraError::Configuration(format!(
                    "unknown CACHE_BACKEND `{other}`"
                )));
            }
        };
        let max_memory_bytes = match std::env::var("CACHE_MAX_MEMORY") {
            Ok(raw) => parse_memory_size(&raw)?,
            Err(_) => cache_defaults.max_memory_bytes,
        };
        let cache = CacheConfig {
            backend: cache_backend,
            redis_url: env_or("REDIS_URL", cache_defaults.redis_url),
            max_memory_bytes,
            eviction_policy: env_or("CACHE_EVICTION_POLICY", cache_defaults.eviction_policy),
            memory_check_interval: parse_env_millis(
                "CACHE_MEMORY_CHECK_INTERVAL",
                cache_defaults.memory_check_interval,
            ),
            memory_alert_threshold: normalize_ratio(parse_env(
                "CACHE_MEMORY_ALERT_THRESHOLD",
                cache_defaults.memory_alert_threshold,
            )),
            compression_threshold: parse_env(
                "CACHE_COMPRESSION_THRESHOLD",
                cache_defaults.compression_threshold,
            ),
            default_ttl: Duration::from_secs(parse_env(
                "CACHE_DEFAULT_TTL",
                cache_defaults.default_ttl.as_secs(),
            )),
        };

        let worker_defaults = WorkerConfig::default();
        let workers = WorkerConfig {
            max_workers: parse_env("MAX_WORKERS", worker_defaults.max_workers).max(1),
            task_timeout: parse_env_millis("WORKER_TASK_TIMEOUT_MS", worker_defaults.task_timeout),
            queue_capacity: parse_env("WORKER_QUEUE_CAPACITY", worker_defaults.queue_capacity),
            inline_threshold: parse_env(
                "WORKER_INLINE_THRESHOLD",
                worker_defaults.inline_threshold,
            ),
        };

        let audit_defaults = AuditConfig::default();
        let audit = AuditConfig {
            log_dir: std::env::var("AUDIT_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(audit_defaults.log_dir),
            max_segment_bytes: parse_env("AUDIT_LOG_MAX_SIZE", audit_defaults.max_segment_bytes),
            max_segments: parse_env("AUDIT_LOG_MAX_FILES", audit_defaults.max_segments),
            retention_days: parse_env("AUDIT_LOG_RETENTION_DAYS", audit_defaults.retention_days),
            signing_key: std::env::var("AUDIT_SIGNING_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            source: env_or("AUDIT_SOURCE", audit_defaults.source),
        };

        let maint_defaults = MaintenanceConfig::default();
        let maintenance = MaintenanceConfig {
            compression_interval: Duration::from_secs(parse_env(
                "COMPRESSION_INTERVAL_SECS",
                maint_defaults.compression_interval.as_secs(),
            )),
            compression_min_idle_days: parse_env(
                "COMPRESSION_MIN_IDLE_DAYS",
                maint_defaults.compression_min_idle_days,
            ),
            compression_max_access_count: parse_env(
                "COMPRESSION_MAX_ACCESS_COUNT",
                maint_defaults.compression_max_access_count,
            ),
            backup_interval: Duration::from_secs(parse_env(
                "BACKUP_INTERVAL_SECS",
                maint_defaults.backup_interval.as_secs(),
            )),
            backup_dir: std::env::var("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(maint_defaults.backup_dir),
            backup_retention_days: parse_env(
                "BACKUP_RETENTION_DAYS",
                maint_defaults.backup_retention_days,
            ),
            batch_size: parse_env("MAINTENANCE_BATCH_SIZE", maint_defaults.batch_size).max(1),
        };

        Ok(Self {
            database,
            cache,
            workers,
            audit,
            maintenance,
        })
    }
}

/// Parses a memory size such as `"256mb"`, `"1gb"`, `"512k"` or `"1048576"`
/// into bytes.
///
/// # Errors
///
/// Returns [`InfraError::Configuration`] if the number or unit is invalid.
pub fn parse_memory_size(raw: &str) -> Result<u64, InfraError> {
    let normalized = raw.trim().to_ascii_lowercase();
    let split = normalized
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(normalized.len());
    let (digits, unit) = normalized.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| InfraError::Configuration(format!("invalid memory size `{raw}`")))?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => {
            return Err(InfraError::Configuration(format!(
                "invalid memory unit in `{raw}`"
            )));
        }
    };
    Ok(value.saturating_mul(multiplier))
}

/// Accepts a ratio either as a fraction (`0.8`) or as a percent (`80`).
fn normalize_ratio(value: f64) -> f64 {
    let ratio = if value > 1.0 { value / 100.0 } else { value };
    ratio.clamp(0.0, 1.0)
}

/// Reads an environment variable, returning `default` when unset.
fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable holding milliseconds.
fn parse_env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("true") | Some("TRUE") | Some("1") => true,
        Some("false") | Some("FALSE") | Some("0") => false,
        _ => default,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn memory_sizes_parse_with_units() {
        let Ok(mb) = parse_memory_size("256mb") else {
            panic!("256mb should parse");
        };
        assert_eq!(mb, 256 * 1024 * 1024);
        assert_eq!(parse_memory_size("1GB").ok(), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_size("4096").ok(), Some(4096));
        assert_eq!(parse_memory_size("512k").ok(), Some(512 * 1024));
    }

    #[test]
    fn memory_size_rejects_garbage() {
        assert!(parse_memory_size("lots").is_err());
        assert!(parse_memory_size("10tb").is_err());
    }

    #[test]
    fn ratio_accepts_percent_or_fraction() {
        assert!((normalize_ratio(80.0) - 0.8).abs() < f64::EPSILON);
        assert!((normalize_ratio(0.75) - 0.75).abs() < f64::EPSILON);
        assert!((normalize_ratio(250.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.workers.task_timeout, Duration::from_secs(30));
        assert_eq!(config.cache.compression_threshold, 10_000);
        assert_eq!(config.audit.retention_days, 90);
        assert_eq!(config.database.backend, StorageBackendKind::Postgres);
    }
}
