use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::UploadError;
use crate::upload::{CompletedFile, Uploader};

/// Uploader that copies files into another directory, e.g. a mounted share.
///
/// Files are copied under a temporary name and renamed into place, so the
/// destination never shows a partial file. Uploading the same file again
/// overwrites it with identical content.
#[derive(Clone, Debug)]
pub struct DirUploader {
    dest: PathBuf,
}

impl DirUploader {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        DirUploader { dest: dest.into() }
    }
}

#[async_trait]
impl Uploader for DirUploader {
    async fn upload(&self, file: &CompletedFile) -> Result<(), UploadError> {
        fs::create_dir_all(&self.dest)
            .await
            .map_err(|source| io_err(&self.dest, source))?;
        let partial = self.dest.join(format!(".{}.partial", file.name));
        let target = self.dest.join(&file.name);

        fs::copy(&file.path, &partial)
            .await
            .map_err(|source| io_err(&file.path, source))?;
        fs::rename(&partial, &target)
            .await
            .map_err(|source| io_err(&target, source))?;
        Ok(())
    }
}

fn io_err(path: &Path, source: io::Error) -> UploadError {
    UploadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_and_overwrites() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let path = src.path().join("s_20240501120000000000.log.done");
        std::fs::write(&path, "a\nb\n").unwrap();
        let file = CompletedFile {
            path: path.clone(),
            name: "s_20240501120000000000.log.done".to_string(),
            stream: "s".to_string(),
        };

        let uploader = DirUploader::new(dst.path().join("remote"));
        uploader.upload(&file).await.unwrap();
        uploader.upload(&file).await.unwrap();

        let copied = dst.path().join("remote").join(&file.name);
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "a\nb\n");
        assert_eq!(std::fs::read_dir(dst.path().join("remote")).unwrap().count(), 1);
        // source is untouched; marking it uploaded is the scanner's job
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dst = tempfile::tempdir().unwrap();
        let file = CompletedFile {
            path: dst.path().join("gone.log.done"),
            name: "gone.log.done".to_string(),
            stream: "gone".to_string(),
        };
        let err = DirUploader::new(dst.path()).upload(&file).await.unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
    }
}
