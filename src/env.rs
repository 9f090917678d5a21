//! Environment variable names understood by the binary.
//!
//! Each one overrides the matching field of the JSON config file, so a
//! deployment can keep a shared file and tweak a single instance.

/// Path of the JSON config file.
pub const BINLOG_SPOOL_CONFIG_ENV: &str = "BINLOG_SPOOL_CONFIG";

/// Listen address of the ingest endpoint, e.g. `127.0.0.1:8470`.
pub const BINLOG_SPOOL_HTTP_ADDR_ENV: &str = "BINLOG_SPOOL_HTTP_ADDR";

/// Output directory for stream files.
pub const BINLOG_SPOOL_LOG_DIR_ENV: &str = "BINLOG_SPOOL_LOG_DIR";

/// Upload target DSN (`noop`, `file:///dir`, `http://host/prefix`).
pub const BINLOG_SPOOL_UPLOAD_TARGET_ENV: &str = "BINLOG_SPOOL_UPLOAD_TARGET";

/// Default log filter, e.g. `info` or `binlog_spool=debug`.
pub const BINLOG_SPOOL_LOG_LEVEL_ENV: &str = "BINLOG_SPOOL_LOG_LEVEL";

/// Enable (`true`) or disable (`false`) delayed rotation.
pub const BINLOG_SPOOL_DELAY_ROTATE_ENV: &str = "BINLOG_SPOOL_DELAY_ROTATE";

/// Read an environment variable, treating unset and empty the same.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
