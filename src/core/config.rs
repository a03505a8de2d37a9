use crate::core::errors::ConfigError;
use crate::core::types::StageName;
use crate::middleware::circuit_breaker::CircuitBreakerConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Stage cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub preprocess_ttl: Duration,
    pub recognize_ttl: Duration,
    pub translate_ttl: Duration,
    pub export_ttl: Duration,
    /// Lifetime of the `job:{id}:result` envelope
    pub job_result_ttl: Duration,
    /// Capacity of the in-memory store before LRU eviction
    pub max_entries: usize,
    /// Enable the whole-result lookup ahead of the per-stage chain
    pub result_cache_enabled: bool,
}

impl CacheConfig {
    pub fn ttl_for(&self, stage: StageName) -> Duration {
        match stage {
            StageName::Preprocess => self.preprocess_ttl,
            StageName::Recognize => self.recognize_ttl,
            StageName::Translate => self.translate_ttl,
            StageName::Export => self.export_ttl,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            preprocess_ttl: Duration::from_secs(DAY),
            recognize_ttl: Duration::from_secs(7 * DAY),
            translate_ttl: Duration::from_secs(7 * DAY),
            export_ttl: Duration::from_secs(7 * DAY),
            job_result_ttl: Duration::from_secs(HOUR),
            max_entries: 10_000,
            result_cache_enabled: false,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// N: number of jobs processed concurrently
    pub concurrency: usize,
    /// Maximum job starts per `limiter_window`, independent of `concurrency`
    pub limiter_max_starts: usize,
    pub limiter_window: Duration,
    /// Total delivery attempts before a job is marked failed
    pub max_attempts: u32,
    /// Fixed delay before a failed attempt is re-delivered
    pub retry_delay: Duration,
    /// How long finished job records stay queryable
    pub job_retention: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            limiter_max_starts: 10,
            limiter_window: Duration::from_millis(1000),
            max_attempts: 3,
            retry_delay: Duration::from_millis(5000),
            job_retention: Duration::from_secs(3600),
        }
    }
}

/// Fallbacks for missing job inputs
#[derive(Debug, Clone)]
pub struct DefaultsConfig {
    pub ocr_lang: String,
    pub title: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            ocr_lang: "eng+vie".to_string(),
            title: "Document".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: Level,
    pub breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    pub workers: WorkerConfig,
    pub defaults: DefaultsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            workers: WorkerConfig::default(),
            defaults: DefaultsConfig::default(),
        }
    }
}

impl Config {
    /// Load `.env` (if present), then the process environment, then validate.
    pub fn new() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let base = Self::default();

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(base.log_level);

        Ok(Self {
            log_level,
            breaker: CircuitBreakerConfig {
                timeout: env_millis("BREAKER_TIMEOUT_MS", base.breaker.timeout)?,
                error_threshold_percentage: env_parse(
                    "BREAKER_ERROR_THRESHOLD",
                    base.breaker.error_threshold_percentage,
                )?,
                reset_timeout: env_millis("BREAKER_RESET_TIMEOUT_MS", base.breaker.reset_timeout)?,
                rolling_window: env_millis(
                    "BREAKER_ROLLING_WINDOW_MS",
                    base.breaker.rolling_window,
                )?,
                rolling_buckets: env_parse("BREAKER_ROLLING_BUCKETS", base.breaker.rolling_buckets)?,
                volume_threshold: env_parse(
                    "BREAKER_VOLUME_THRESHOLD",
                    base.breaker.volume_threshold,
                )?,
            },
            cache: CacheConfig {
                preprocess_ttl: env_secs("CACHE_PRE_TTL", base.cache.preprocess_ttl)?,
                recognize_ttl: env_secs("CACHE_OCR_TTL", base.cache.recognize_ttl)?,
                translate_ttl: env_secs("CACHE_TRANSLATE_TTL", base.cache.translate_ttl)?,
                export_ttl: env_secs("CACHE_EXPORT_TTL", base.cache.export_ttl)?,
                job_result_ttl: env_secs("JOB_RESULT_TTL", base.cache.job_result_ttl)?,
                max_entries: env_parse("CACHE_MAX_ENTRIES", base.cache.max_entries)?,
                result_cache_enabled: env_parse(
                    "RESULT_CACHE_ENABLED",
                    base.cache.result_cache_enabled,
                )?,
            },
            workers: WorkerConfig {
                concurrency: env_parse("WORKER_CONCURRENCY", base.workers.concurrency)?,
                limiter_max_starts: env_parse("LIMITER_MAX", base.workers.limiter_max_starts)?,
                limiter_window: env_millis("LIMITER_DURATION_MS", base.workers.limiter_window)?,
                max_attempts: env_parse("JOB_ATTEMPTS", base.workers.max_attempts)?,
                retry_delay: env_millis("JOB_RETRY_DELAY_MS", base.workers.retry_delay)?,
                job_retention: env_secs("JOB_RETENTION", base.workers.job_retention)?,
            },
            defaults: DefaultsConfig {
                ocr_lang: env::var("OCR_LANG").unwrap_or(base.defaults.ocr_lang),
                title: env::var("DEFAULT_TITLE").unwrap_or(base.defaults.title),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.breaker.error_threshold_percentage;
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(ConfigError::InvalidErrorThreshold(threshold));
        }

        if self.breaker.timeout.is_zero() {
            return Err(ConfigError::InvalidBreakerConfig(
                "per-call timeout must be > 0".to_string(),
            ));
        }

        if self.breaker.rolling_buckets == 0 || self.breaker.rolling_window.is_zero() {
            return Err(ConfigError::InvalidBreakerConfig(format!(
                "rolling window must be non-empty, got {:?} in {} buckets",
                self.breaker.rolling_window, self.breaker.rolling_buckets
            )));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidCacheConfig(
                "max_entries must be > 0".to_string(),
            ));
        }

        if self.workers.concurrency == 0 {
            return Err(ConfigError::InvalidWorkerConfig(
                "concurrency must be > 0".to_string(),
            ));
        }

        if self.workers.limiter_max_starts == 0 || self.workers.limiter_window.is_zero() {
            return Err(ConfigError::InvalidWorkerConfig(format!(
                "limiter must allow at least one start per window, got {} per {:?}",
                self.workers.limiter_max_starts, self.workers.limiter_window
            )));
        }

        if self.workers.max_attempts == 0 {
            return Err(ConfigError::InvalidWorkerConfig(
                "max_attempts must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::EnvVarError {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}
