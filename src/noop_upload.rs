use crate::error::UploadError;
use crate::upload::{CompletedFile, Uploader};
use async_trait::async_trait;

/// An uploader that accepts every file without sending it anywhere.
///
/// Useful for running the spool without a remote target and for measuring
/// the ingest path on its own.
#[derive(Clone, Default)]
pub struct NoopUploader;

#[async_trait]
impl Uploader for NoopUploader {
    async fn upload(&self, _file: &CompletedFile) -> Result<(), UploadError> {
        Ok(())
    }
}
