//! Configuration management for the sync runtime.
//!
//! Every setting has a default except the container. Values come from
//! `TRELLIS_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use trellis_engine::{DetectionStrategy, DEFAULT_MAX_HISTORY, DEFAULT_SIMULTANEOUS_WINDOW_MS};

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub resilience: ResilienceConfig,
    pub detector: DetectorConfig,
    pub resolver: ResolverConfig,
}

/// State file location and retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the state file and its `backups/` subdirectory
    pub state_dir: PathBuf,
    /// Remote container (`owner/repo`)
    pub container: String,
    pub max_history: usize,
    pub backups_enabled: bool,
    pub max_backups: usize,
    pub max_backup_age: Duration,
    /// Age after which history entries are dropped by maintenance
    pub cleanup_age_days: u32,
}

impl StoreConfig {
    pub fn new(state_dir: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            container: container.into(),
            max_history: DEFAULT_MAX_HISTORY,
            backups_enabled: true,
            max_backups: 10,
            max_backup_age: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_age_days: 30,
        }
    }

    /// File stem derived from the container, e.g. `acme-app-sync`.
    pub fn file_stem(&self) -> String {
        let slug: String = self
            .container
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{}-sync", slug.trim_matches('-'))
    }

    /// Path of the state file.
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.file_stem()))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }
}

/// Retry, circuit breaker and rate-limit settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilienceConfig {
    /// Attempts per call, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub min_rate_limit_wait: Duration,
    pub max_rate_limit_wait: Duration,
    /// Cap on cumulative rate-limit waiting within one call
    pub max_total_rate_limit_wait: Duration,
    /// Remaining-call count at or below which callers should back off
    pub rate_limit_buffer: u32,
    pub circuit_threshold: u32,
    pub circuit_cooldown: Duration,
    pub batch_concurrency: usize,
    pub batch_delay: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            min_rate_limit_wait: Duration::from_millis(1_000),
            max_rate_limit_wait: Duration::from_millis(900_000),
            max_total_rate_limit_wait: Duration::from_millis(3_600_000),
            rate_limit_buffer: 10,
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_millis(60_000),
            batch_concurrency: 5,
            batch_delay: Duration::from_millis(1_000),
        }
    }
}

/// Change detector settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    pub batch_size: usize,
    pub strategy: DetectionStrategy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            strategy: DetectionStrategy::Hybrid,
        }
    }
}

/// Conflict resolver settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Edits closer together than this are treated as simultaneous
    pub simultaneous_window: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            simultaneous_window: Duration::from_millis(DEFAULT_SIMULTANEOUS_WINDOW_MS),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let container = lookup("TRELLIS_CONTAINER")
            .filter(|c| !c.trim().is_empty())
            .ok_or(ConfigError::MissingContainer)?;
        let state_dir = lookup("TRELLIS_STATE_DIR").unwrap_or_else(|| ".trellis".to_string());

        let mut store = StoreConfig::new(state_dir, container);
        store.max_history = parse(&lookup, "TRELLIS_MAX_HISTORY", store.max_history)?;
        store.backups_enabled = parse(&lookup, "TRELLIS_BACKUPS", store.backups_enabled)?;
        store.max_backups = parse(&lookup, "TRELLIS_MAX_BACKUPS", store.max_backups)?;
        let backup_age_days: u64 = parse(&lookup, "TRELLIS_BACKUP_MAX_AGE_DAYS", 7)?;
        store.max_backup_age = backup_age_days
            .checked_mul(24 * 60 * 60)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::Invalid {
                key: "TRELLIS_BACKUP_MAX_AGE_DAYS",
                value: backup_age_days.to_string(),
            })?;
        store.cleanup_age_days =
            parse(&lookup, "TRELLIS_CLEANUP_AGE_DAYS", store.cleanup_age_days)?;
        if store.max_history == 0 {
            return Err(ConfigError::Invalid {
                key: "TRELLIS_MAX_HISTORY",
                value: "0".into(),
            });
        }

        let defaults = ResilienceConfig::default();
        let resilience = ResilienceConfig {
            max_attempts: parse(&lookup, "TRELLIS_RETRY_ATTEMPTS", defaults.max_attempts)?.max(1),
            base_delay: millis(&lookup, "TRELLIS_RETRY_BASE_MS", defaults.base_delay)?,
            max_delay: millis(&lookup, "TRELLIS_RETRY_MAX_MS", defaults.max_delay)?,
            min_rate_limit_wait: millis(
                &lookup,
                "TRELLIS_RATE_LIMIT_MIN_WAIT_MS",
                defaults.min_rate_limit_wait,
            )?,
            max_rate_limit_wait: millis(
                &lookup,
                "TRELLIS_RATE_LIMIT_MAX_WAIT_MS",
                defaults.max_rate_limit_wait,
            )?,
            max_total_rate_limit_wait: millis(
                &lookup,
                "TRELLIS_RATE_LIMIT_TOTAL_WAIT_MS",
                defaults.max_total_rate_limit_wait,
            )?,
            rate_limit_buffer: parse(&lookup, "TRELLIS_RATE_LIMIT_BUFFER", defaults.rate_limit_buffer)?,
            circuit_threshold: parse(&lookup, "TRELLIS_CIRCUIT_THRESHOLD", defaults.circuit_threshold)?
                .max(1),
            circuit_cooldown: millis(&lookup, "TRELLIS_CIRCUIT_COOLDOWN_MS", defaults.circuit_cooldown)?,
            batch_concurrency: parse(&lookup, "TRELLIS_BATCH_CONCURRENCY", defaults.batch_concurrency)?
                .max(1),
            batch_delay: millis(&lookup, "TRELLIS_BATCH_DELAY_MS", defaults.batch_delay)?,
        };

        let detector_defaults = DetectorConfig::default();
        let detector = DetectorConfig {
            batch_size: parse(&lookup, "TRELLIS_DETECT_BATCH_SIZE", detector_defaults.batch_size)?
                .max(1),
            strategy: parse(&lookup, "TRELLIS_DETECT_STRATEGY", detector_defaults.strategy)?,
        };

        let resolver = ResolverConfig {
            simultaneous_window: millis(
                &lookup,
                "TRELLIS_SIMULTANEOUS_WINDOW_MS",
                ResolverConfig::default().simultaneous_window,
            )?,
        };

        Ok(Self {
            store,
            resilience,
            detector,
            resolver,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse(lookup, key, default_ms).map(Duration::from_millis)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TRELLIS_CONTAINER environment variable is required")]
    MissingContainer,

    #[error("Invalid {key} value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = SyncConfig::from_lookup(lookup(&[("TRELLIS_CONTAINER", "acme/app")])).unwrap();

        assert_eq!(config.store.max_history, 1000);
        assert!(config.store.backups_enabled);
        assert_eq!(config.store.max_backups, 10);
        assert_eq!(config.resilience, ResilienceConfig::default());
        assert_eq!(config.detector.batch_size, 10);
        assert_eq!(config.detector.strategy, DetectionStrategy::Hybrid);
        assert_eq!(config.resolver.simultaneous_window, Duration::from_secs(5));
        assert_eq!(
            config.store.state_path(),
            PathBuf::from(".trellis/acme-app-sync.json")
        );
    }

    #[test]
    fn container_is_required() {
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingContainer)
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("TRELLIS_CONTAINER", "acme/app"),
            ("TRELLIS_STATE_DIR", "/var/lib/trellis"),
            ("TRELLIS_BACKUPS", "false"),
            ("TRELLIS_RETRY_ATTEMPTS", "5"),
            ("TRELLIS_RETRY_BASE_MS", "250"),
            ("TRELLIS_DETECT_STRATEGY", "content-hash"),
        ]))
        .unwrap();

        assert_eq!(config.store.state_dir, PathBuf::from("/var/lib/trellis"));
        assert!(!config.store.backups_enabled);
        assert_eq!(config.resilience.max_attempts, 5);
        assert_eq!(config.resilience.base_delay, Duration::from_millis(250));
        assert_eq!(config.detector.strategy, DetectionStrategy::ContentHash);
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("TRELLIS_CONTAINER", "acme/app"),
            ("TRELLIS_MAX_BACKUPS", "many"),
        ]))
        .unwrap_err();

        assert_eq!(err.to_string(), "Invalid TRELLIS_MAX_BACKUPS value: many");
    }

    #[test]
    fn backup_age_overflow_is_rejected() {
        let huge = u64::MAX.to_string();
        let err = SyncConfig::from_lookup(lookup(&[
            ("TRELLIS_CONTAINER", "acme/app"),
            ("TRELLIS_BACKUP_MAX_AGE_DAYS", huge.as_str()),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TRELLIS_BACKUP_MAX_AGE_DAYS",
                ..
            }
        ));

        let config = SyncConfig::from_lookup(lookup(&[
            ("TRELLIS_CONTAINER", "acme/app"),
            ("TRELLIS_BACKUP_MAX_AGE_DAYS", "30"),
        ]))
        .unwrap();
        assert_eq!(config.store.max_backup_age, Duration::from_secs(30 * 24 * 60 * 60));
    }
}
