use crate::error::UploadError;
use crate::upload::{CompletedFile, Uploader};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Configuration for [`HttpUploader`].
#[derive(Clone, Debug)]
pub struct HttpUploadConfig {
    /// Base URL without trailing slash, e.g. "http://127.0.0.1:9000/binlog"
    pub base_url: String,
    pub timeout: Duration,
}

/// Uploader that `PUT`s each file to `<base_url>/<stream>/<file name>`.
///
/// The object key is derived from the file name only, so a repeated upload
/// of the same file replaces the object instead of duplicating it. A `409
/// Conflict` answer is taken to mean the object already exists.
#[derive(Clone)]
pub struct HttpUploader {
    client: Client,
    config: HttpUploadConfig,
}

impl HttpUploader {
    /// Construct a new uploader; fails only if the TLS backend can't be set up.
    pub fn new(config: HttpUploadConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, file: &CompletedFile) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(&file.stream),
            urlencoding::encode(&file.name)
        )
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, file: &CompletedFile) -> Result<(), UploadError> {
        let body = tokio::fs::read(&file.path)
            .await
            .map_err(|source| UploadError::Io {
                path: file.path.clone(),
                source,
            })?;
        let resp = self
            .client
            .put(self.endpoint(file))
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            Ok(())
        } else {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            Err(UploadError::Rejected {
                file: file.name.clone(),
                reason: format!("status {}: {}", status, text),
            })
        }
    }
}
