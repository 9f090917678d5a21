use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::UploadError;

/// A completed file handed to an [`Uploader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub path: PathBuf,
    /// File name, used as the object key on the remote side.
    pub name: String,
    pub stream: String,
}

/// Asynchronous destination for completed log files.
///
/// Implementations transport a file to a concrete backend (HTTP object
/// store, another directory, etc). The recoup scanner calls `upload` from its
/// background task, once per completed file per scan, until it succeeds.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Ship a single file.
    ///
    /// **Returns**
    /// - `Ok(())` once the backend durably accepted the whole file. The
    ///   scanner then marks the file uploaded.
    /// - `Err(..)` on any failure. The file is left in place and offered
    ///   again on the next scan, with no limit on attempts.
    ///
    /// The same file may be offered again after a crash between a successful
    /// upload and the local rename, so uploading a file twice must be
    /// harmless, e.g. by keying the remote object on `file.name`.
    async fn upload(&self, file: &CompletedFile) -> Result<(), UploadError>;
}
