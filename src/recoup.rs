//! Periodic re-upload of completed files.
//!
//! The directory itself is the ledger: a file ending in the completed suffix
//! has not been confirmed by the remote side yet. Every scan offers each such
//! file to the [`Uploader`]; on success it is renamed to `*.uploaded` (or
//! removed), on failure it stays put for the next scan. The same walk runs
//! right after startup, which is how files from a previous run get shipped.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::logfile::{self, FileKind, UPLOADED_SUFFIX};
use crate::upload::{CompletedFile, Uploader};

/// Counts from one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
}

pub struct RecoupUpload {
    dir: PathBuf,
    valid_suffix: String,
    remove_uploaded: bool,
    uploader: Arc<dyn Uploader>,
}

impl RecoupUpload {
    pub fn new(config: &Config, uploader: Arc<dyn Uploader>) -> Self {
        RecoupUpload {
            dir: config.log_dir.clone(),
            valid_suffix: config.history.valid_suffix.clone(),
            remove_uploaded: config.history.remove_uploaded,
            uploader,
        }
    }

    /// Completed files currently in the directory, oldest first by the
    /// creation time in their names. Files whose name cannot be parsed come
    /// last.
    pub async fn pending_files(&self) -> io::Result<Vec<CompletedFile>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = logfile::file_name(&path) else {
                continue;
            };
            if logfile::classify(name, &self.valid_suffix) != FileKind::Completed {
                continue;
            }
            let (stream, created) = match logfile::parse_name(name, &self.valid_suffix) {
                Some((stream, created)) => (stream, Some(created)),
                None => {
                    // still shipped; the key just can't be grouped by stream
                    debug!(path = %path.display(), "completed file with unexpected name");
                    ("unknown".to_string(), None)
                }
            };
            let file = CompletedFile {
                name: name.to_string(),
                path,
                stream,
            };
            files.push((created, file));
        }
        files.sort_by(|(a_time, a), (b_time, b)| {
            let a_key = (a_time.is_none(), a_time, &a.name);
            let b_key = (b_time.is_none(), b_time, &b.name);
            a_key.cmp(&b_key)
        });
        Ok(files.into_iter().map(|(_, file)| file).collect())
    }

    /// Offer every completed file to the uploader once.
    ///
    /// Stops early, between files, when `cancel` fires. Only a failure to
    /// list the directory is returned as an error.
    pub async fn scan_once(&self, cancel: &CancellationToken) -> io::Result<ScanReport> {
        let mut report = ScanReport::default();
        for file in self.pending_files().await? {
            if cancel.is_cancelled() {
                debug!("scan interrupted by shutdown");
                break;
            }
            report.attempted += 1;
            match self.uploader.upload(&file).await {
                Ok(()) => {
                    self.mark_uploaded(&file).await;
                    report.uploaded += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(path = %file.path.display(), "upload failed, will retry: {e}");
                }
            }
        }
        Ok(report)
    }

    async fn mark_uploaded(&self, file: &CompletedFile) {
        let result = if self.remove_uploaded {
            fs::remove_file(&file.path).await
        } else {
            fs::rename(&file.path, logfile::with_suffix(&file.path, UPLOADED_SUFFIX)).await
        };
        match result {
            Ok(()) => info!(stream = %file.stream, file = %file.name, "uploaded"),
            // the next scan uploads it again, which the target tolerates
            Err(e) => error!(path = %file.path.display(), "uploaded but failed to mark: {e}"),
        }
    }

    /// Scan every `interval`, starting immediately, until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(dir = %self.dir.display(), ?interval, "recoup upload loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.scan_once(&cancel).await {
                    Ok(report) if report.attempted > 0 => info!(?report, "recoup scan finished"),
                    Ok(_) => debug!("recoup scan found nothing to upload"),
                    Err(e) => error!(dir = %self.dir.display(), "recoup scan failed: {e}"),
                },
            }
        }
        info!("recoup upload loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then records every upload.
    struct Flaky {
        failures: Mutex<usize>,
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Uploader for Flaky {
        async fn upload(&self, file: &CompletedFile) -> Result<(), UploadError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(UploadError::Transport("connection refused".into()));
                }
            }
            let body = std::fs::read(&file.path).unwrap();
            self.seen.lock().unwrap().push((file.name.clone(), body));
            Ok(())
        }
    }

    fn setup(failures: usize) -> (tempfile::TempDir, Arc<Flaky>, RecoupUpload) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.log_dir = dir.path().to_path_buf();
        let flaky = Arc::new(Flaky {
            failures: Mutex::new(failures),
            seen: Mutex::new(Vec::new()),
        });
        let recoup = RecoupUpload::new(&config, Arc::clone(&flaky) as Arc<dyn Uploader>);
        (dir, flaky, recoup)
    }

    #[tokio::test]
    async fn files_are_offered_oldest_first_across_streams() {
        let (dir, _, recoup) = setup(0);
        let p = dir.path();
        for name in [
            "zeta_20240501100000000000.log.done",
            "alpha_20240501120000000000.log.done",
            "notes.log.done",
            "alpha_20240501080000000000.log.done",
            "zeta_20240501110000000000.log.done",
        ] {
            std::fs::write(p.join(name), "x\n").unwrap();
        }

        let names: Vec<String> = recoup
            .pending_files()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "alpha_20240501080000000000.log.done",
                "zeta_20240501100000000000.log.done",
                "zeta_20240501110000000000.log.done",
                "alpha_20240501120000000000.log.done",
                "notes.log.done",
            ]
        );
    }

    #[tokio::test]
    async fn only_completed_files_are_offered() {
        let (dir, flaky, recoup) = setup(0);
        let p = dir.path();
        std::fs::write(p.join("s_20240501120000000000.log"), "open\n").unwrap();
        std::fs::write(p.join("s_20240501110000000000.log.deferred"), "d\n").unwrap();
        std::fs::write(p.join("s_20240501100000000000.log.done"), "done\n").unwrap();
        std::fs::write(p.join("s_20240501090000000000.log.done.uploaded"), "u\n").unwrap();

        let report = recoup.scan_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, ScanReport { attempted: 1, uploaded: 1, failed: 0 });
        assert_eq!(
            flaky.seen.lock().unwrap()[0],
            ("s_20240501100000000000.log.done".to_string(), b"done\n".to_vec())
        );
        assert!(p.join("s_20240501100000000000.log.done.uploaded").exists());
        assert!(p.join("s_20240501120000000000.log").exists());
    }

    #[tokio::test]
    async fn retries_until_success_then_idles() {
        let (dir, flaky, recoup) = setup(3);
        std::fs::write(dir.path().join("s_20240501100000000000.log.done"), "x\n").unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let report = recoup.scan_once(&cancel).await.unwrap();
            assert_eq!(report.failed, 1);
        }
        let report = recoup.scan_once(&cancel).await.unwrap();
        assert_eq!(report.uploaded, 1);

        // already uploaded: nothing to do
        assert_eq!(recoup.scan_once(&cancel).await.unwrap(), ScanReport::default());
        assert_eq!(flaky.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_uploaded_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.log_dir = dir.path().to_path_buf();
        config.history.remove_uploaded = true;
        let recoup = RecoupUpload::new(&config, Arc::new(crate::noop_upload::NoopUploader));
        std::fs::write(dir.path().join("s_20240501100000000000.log.done"), "x\n").unwrap();

        recoup.scan_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_directory_is_reported() {
        let (dir, _flaky, recoup) = setup(0);
        std::fs::remove_dir(dir.path()).unwrap();
        assert!(recoup.scan_once(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn loop_uploads_and_stops_on_cancel() {
        let (dir, flaky, recoup) = setup(0);
        let recoup = Arc::new(recoup);
        let cancel = CancellationToken::new();
        std::fs::write(dir.path().join("s_20240501100000000000.log.done"), "x\n").unwrap();

        let handle = tokio::spawn(Arc::clone(&recoup).run(Duration::from_millis(10), cancel.clone()));
        for _ in 0..100 {
            if !flaky.seen.lock().unwrap().is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(flaky.seen.lock().unwrap().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
