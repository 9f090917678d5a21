use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::ConfigError;
use crate::logfile::{DEFERRED_SUFFIX, MERGE_SUFFIX, OPEN_EXT, UPLOADED_SUFFIX};

pub const DEFAULT_CONFIG_PATH: &str = "./binlog-spool.json";

/// Process configuration.
///
/// Loaded from a JSON file where every field is optional; anything left out
/// keeps the value from [`Config::default`]. A handful of fields can be
/// overridden from the environment, see [`crate::env`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    /// Route that accepts records.
    pub ingest_path: String,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub log_ansi: bool,
    /// Log the effective config and the reloaded stream state at startup.
    pub use_test: bool,
    pub rotate: RotateConfig,
    pub delay_rotate: DelayRotateConfig,
    pub history: HistoryConfig,
    pub ingest: IngestConfig,
    pub upload: UploadConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8470".to_string(),
            ingest_path: "/".to_string(),
            log_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            log_ansi: true,
            use_test: false,
            rotate: RotateConfig::default(),
            delay_rotate: DelayRotateConfig::default(),
            history: HistoryConfig::default(),
            ingest: IngestConfig::default(),
            upload: UploadConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Hard rotation caps applied by the logger manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RotateConfig {
    pub max_size_bytes: u64,
    /// Maximum age of an open file.
    pub cycle_secs: u64,
    /// How often the force-rotate timer looks for files older than the cycle.
    pub timer_interval_secs: u64,
}

impl Default for RotateConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024,
            cycle_secs: 300,
            timer_interval_secs: 10,
        }
    }
}

impl RotateConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_secs(self.cycle_secs)
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_secs(self.timer_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayRotateConfig {
    pub enable: bool,
    pub min_files: usize,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    pub tick_ms: u64,
}

impl Default for DelayRotateConfig {
    fn default() -> Self {
        Self {
            enable: false,
            min_files: 3,
            min_delay_secs: 1,
            max_delay_secs: 10,
            tick_ms: 1000,
        }
    }
}

impl DelayRotateConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Recovery of files left behind by previous runs and the re-upload loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub recoup_interval_secs: u64,
    /// Suffix that marks a file as completed and ready for upload.
    pub valid_suffix: String,
    /// Keep appending to files that were open when the last run stopped.
    pub resume_open: bool,
    /// Delete files after upload instead of renaming them to `*.uploaded`.
    pub remove_uploaded: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            recoup_interval_secs: 30,
            valid_suffix: ".done".to_string(),
            resume_open: true,
            remove_uploaded: false,
        }
    }
}

impl HistoryConfig {
    pub fn recoup_interval(&self) -> Duration {
        Duration::from_secs(self.recoup_interval_secs)
    }
}

/// What `enqueue` does when the buffer is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullPolicy {
    /// Wait for the consumer to free a slot.
    Block,
    /// Fail the request immediately.
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub buffer_capacity: usize,
    pub full_policy: FullPolicy,
    /// Answer ingest requests only after the record reached the file.
    pub wait_for_write: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 65_536,
            full_policy: FullPolicy::Block,
            wait_for_write: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub target: String,
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            target: "noop".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Soft limit per shutdown step; exceeding it only logs a warning.
    pub deadline_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { deadline_secs: 5 }
    }
}

impl ShutdownConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Config {
    /// Load from the path in `BINLOG_SPOOL_CONFIG` (or the default path),
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::env_opt(env::BINLOG_SPOOL_CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(addr) = env::env_opt(env::BINLOG_SPOOL_HTTP_ADDR_ENV) {
            self.http_addr = addr;
        }
        if let Some(dir) = env::env_opt(env::BINLOG_SPOOL_LOG_DIR_ENV) {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(target) = env::env_opt(env::BINLOG_SPOOL_UPLOAD_TARGET_ENV) {
            self.upload.target = target;
        }
        if let Some(level) = env::env_opt(env::BINLOG_SPOOL_LOG_LEVEL_ENV) {
            self.log_level = level;
        }
        if let Some(flag) = env::env_opt(env::BINLOG_SPOOL_DELAY_ROTATE_ENV) {
            self.delay_rotate.enable = match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Env {
                        key: env::BINLOG_SPOOL_DELAY_ROTATE_ENV,
                        value: flag,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if self.rotate.max_size_bytes == 0 {
            return invalid("rotate.max_size_bytes must be > 0");
        }
        if self.rotate.cycle_secs == 0 || self.rotate.timer_interval_secs == 0 {
            return invalid("rotate.cycle_secs and rotate.timer_interval_secs must be > 0");
        }
        if self.history.recoup_interval_secs == 0 {
            return invalid("history.recoup_interval_secs must be > 0");
        }
        if self.ingest.buffer_capacity == 0 {
            return invalid("ingest.buffer_capacity must be > 0");
        }
        if !self.ingest_path.starts_with('/') {
            return invalid("ingest_path must start with '/'");
        }
        if matches!(self.ingest_path.as_str(), "/healthz" | "/stats") {
            return invalid(format!("ingest_path {:?} is reserved", self.ingest_path));
        }

        let suffix = &self.history.valid_suffix;
        if suffix.len() < 2 || !suffix.starts_with('.') {
            return invalid("history.valid_suffix must start with '.' and name an extension");
        }
        for reserved in [OPEN_EXT, DEFERRED_SUFFIX, MERGE_SUFFIX, ".tmp", UPLOADED_SUFFIX] {
            if suffix.ends_with(reserved) {
                return invalid(format!(
                    "history.valid_suffix {suffix:?} collides with reserved suffix {reserved:?}"
                ));
            }
        }

        let delay = &self.delay_rotate;
        if delay.enable {
            if delay.min_files == 0 {
                return invalid("delay_rotate.min_files must be > 0");
            }
            if delay.min_delay_secs > delay.max_delay_secs {
                return invalid("delay_rotate.min_delay_secs must not exceed max_delay_secs");
            }
            if delay.tick_ms == 0 {
                return invalid("delay_rotate.tick_ms must be > 0");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"log_dir": "/var/spool/binlog",
                "delay_rotate": {"enable": true, "min_files": 5},
                "ingest": {"full_policy": "reject"}}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/var/spool/binlog"));
        assert!(config.delay_rotate.enable);
        assert_eq!(config.delay_rotate.min_files, 5);
        assert_eq!(config.delay_rotate.max_delay_secs, 10);
        assert_eq!(config.ingest.full_policy, FullPolicy::Reject);
        assert_eq!(config.history.valid_suffix, ".done");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_colliding_suffix() {
        for suffix in [".log", ".deferred", "done", ".x.tmp", ".uploaded", "."] {
            let mut config = Config::default();
            config.history.valid_suffix = suffix.to_string();
            assert!(config.validate().is_err(), "{suffix} accepted");
        }
    }

    #[test]
    fn rejects_inverted_delays() {
        let mut config = Config::default();
        config.delay_rotate.enable = true;
        config.delay_rotate.min_delay_secs = 20;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_reserved_ingest_path() {
        let mut config = Config::default();
        config.ingest_path = "/stats".to_string();
        assert!(config.validate().is_err());
        config.ingest_path = "ingest".to_string();
        assert!(config.validate().is_err());
        config.ingest_path = "/ingest".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }
}
