use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dir_upload::DirUploader;
use crate::noop_upload::NoopUploader;
use crate::upload::Uploader;

/// Supported upload targets that can be selected via DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Noop,
    Dir(PathBuf),
    Http,
}

/// Upload target configuration built from a DSN.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Selected uploader implementation.
    pub kind: TargetKind,
    /// Raw DSN that was used to construct this config.
    pub dsn: String,
}

/// Parse a DSN string and infer the target kind from its scheme.
///
/// Examples:
/// - "noop"
/// - "file:///mnt/archive/binlog"
/// - "http://127.0.0.1:9000/binlog"
/// - "https://archive.internal/binlog"
pub fn parse_target(dsn: &str) -> Result<TargetConfig, TargetError> {
    let lower = dsn.to_ascii_lowercase();

    let kind = if lower == "noop" {
        TargetKind::Noop
    } else if lower.starts_with("file://") {
        let path = &dsn["file://".len()..];
        if path.is_empty() {
            return Err(TargetError::EmptyPath);
        }
        TargetKind::Dir(PathBuf::from(path))
    } else if lower.starts_with("http://") || lower.starts_with("https://") {
        TargetKind::Http
    } else {
        return Err(TargetError::UnknownScheme(dsn.to_string()));
    };
    Ok(TargetConfig {
        kind,
        dsn: dsn.to_string(),
    })
}

/// Error type returned when parsing a DSN or building an uploader from it.
#[derive(thiserror::Error, Debug)]
pub enum TargetError {
    #[error("unknown or unsupported upload target {0:?}")]
    UnknownScheme(String),

    #[error("file:// target needs a directory path")]
    EmptyPath,

    #[error("http-upload feature is not enabled")]
    HttpFeatureDisabled,

    #[error("failed to build uploader: {0}")]
    Build(String),
}

/// Create a concrete [`Uploader`] from a [`TargetConfig`].
pub fn make_uploader(
    cfg: &TargetConfig,
    timeout: Duration,
) -> Result<Arc<dyn Uploader>, TargetError> {
    match &cfg.kind {
        TargetKind::Noop => Ok(Arc::new(NoopUploader) as Arc<dyn Uploader>),
        TargetKind::Dir(path) => Ok(Arc::new(DirUploader::new(path.clone())) as Arc<dyn Uploader>),
        TargetKind::Http => {
            #[cfg(feature = "http-upload")]
            {
                use crate::http_upload::{HttpUploadConfig, HttpUploader};

                let uploader = HttpUploader::new(HttpUploadConfig {
                    base_url: cfg.dsn.clone(),
                    timeout,
                })
                .map_err(|e| TargetError::Build(e.to_string()))?;
                Ok(Arc::new(uploader) as Arc<dyn Uploader>)
            }

            #[cfg(not(feature = "http-upload"))]
            {
                let _ = timeout; // silence unused warning when feature is disabled
                Err(TargetError::HttpFeatureDisabled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_schemes() {
        assert_eq!(parse_target("noop").unwrap().kind, TargetKind::Noop);
        assert_eq!(
            parse_target("file:///mnt/archive").unwrap().kind,
            TargetKind::Dir(PathBuf::from("/mnt/archive"))
        );
        assert_eq!(
            parse_target("HTTPS://archive/binlog").unwrap().kind,
            TargetKind::Http
        );
    }

    #[test]
    fn rejects_unknown_and_empty() {
        assert!(matches!(
            parse_target("s3://bucket"),
            Err(TargetError::UnknownScheme(_))
        ));
        assert!(matches!(parse_target("file://"), Err(TargetError::EmptyPath)));
    }

    #[test]
    fn builds_local_uploaders() {
        let timeout = Duration::from_secs(1);
        assert!(make_uploader(&parse_target("noop").unwrap(), timeout).is_ok());
        assert!(make_uploader(&parse_target("file:///tmp/x").unwrap(), timeout).is_ok());
    }
}
