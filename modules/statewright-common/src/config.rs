use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment-supplied settings. Connection strings stay out of the TOML file.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Postgres connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Optional path to the TOML tunables file.
    pub config_path: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            config_path: std::env::var("STATEWRIGHT_CONFIG").ok(),
        };

        tracing::info!(
            database = if config.database_url.is_some() { "postgres" } else { "memory" },
            config_path = config.config_path.as_deref().unwrap_or("<defaults>"),
            "Config loaded"
        );
        config
    }
}

/// TOML-backed tunables. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Lanes allowed to apply transitions at the same time.
    pub max_workers: usize,
    /// Signals one lane applies per worker permit before yielding.
    pub lane_batch_size: usize,
    /// Externally submitted signals allowed in memory before `signal` waits.
    pub max_pending_signals: usize,
    /// Buffer of the outcome broadcast channel.
    pub subscriber_capacity: usize,
    /// How often the timer task promotes due delayed signals. 0 disables it.
    pub timer_poll_interval_ms: u64,
    /// How often queued signals are swept back into lanes. 0 disables it.
    pub recovery_interval_ms: u64,
    pub replay_page_size: usize,
    /// Fail replay on a rejected event instead of reporting it.
    pub replay_strict: bool,
    /// Idle lanes (and their cached machines) kept in memory.
    pub lane_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            lane_batch_size: 32,
            max_pending_signals: 10_000,
            subscriber_capacity: 1024,
            timer_poll_interval_ms: 1000,
            recovery_interval_ms: 0,
            replay_page_size: 256,
            replay_strict: false,
            lane_cache_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("max_workers", self.max_workers),
            ("lane_batch_size", self.lane_batch_size),
            ("max_pending_signals", self.max_pending_signals),
            ("subscriber_capacity", self.subscriber_capacity),
            ("replay_page_size", self.replay_page_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("engine.{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    pub fn timer_poll_interval(&self) -> Option<Duration> {
        (self.timer_poll_interval_ms > 0)
            .then(|| Duration::from_millis(self.timer_poll_interval_ms))
    }

    pub fn recovery_interval(&self) -> Option<Duration> {
        (self.recovery_interval_ms > 0).then(|| Duration::from_millis(self.recovery_interval_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            run_migrations: true,
        }
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    parse_config(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
    config.engine.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.engine.max_workers, 16);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(
            config.engine.timer_poll_interval(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(config.engine.recovery_interval(), None);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse_config(
            r#"
            [engine]
            max_workers = 2
            replay_strict = true
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.max_workers, 2);
        assert!(config.engine.replay_strict);
        assert_eq!(config.engine.lane_batch_size, 32);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse_config("[engine]\nworkers = 3\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_sizes_fail_validation() {
        let err = parse_config("[engine]\nlane_batch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("lane_batch_size"));
    }
}
