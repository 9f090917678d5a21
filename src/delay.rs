//! Delayed rotation: hold small closed files back and ship them in batches.
//!
//! Files rotated because of their age (or by hand) are renamed to
//! `*.log.deferred` and handed to [`DelayRotate`]. A stream's batch is
//! released once it holds `min_files` parts, or once its oldest part waited
//! `max_delay`, but never before the oldest part waited `min_delay`.
//! Releasing concatenates the parts into the completed name of the first
//! one. Size-triggered and shutdown rotations bypass this entirely.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DelayRotateConfig;
use crate::logfile::{self, DEFERRED_SUFFIX, MERGE_SUFFIX};

#[derive(Debug, Clone)]
struct DeferredFile {
    path: PathBuf,
    eligible_at: Instant,
}

/// Parts of one stream released together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub stream: String,
    pub parts: Vec<PathBuf>,
    first_eligible: Instant,
}

/// Where a stream's pending batch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    /// Fewer than `min_files` parts, waiting for more or for `max_delay`.
    Deferred,
    /// Enough parts, waiting out `min_delay`.
    Batched,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingBatchView {
    pub stream: String,
    pub files: usize,
    pub oldest_wait_ms: u128,
    pub state: BatchState,
}

pub struct DelayRotate {
    valid_suffix: String,
    min_files: usize,
    min_delay: Duration,
    max_delay: Duration,
    tick: Duration,
    pending: Mutex<BTreeMap<String, Vec<DeferredFile>>>,
}

impl DelayRotate {
    pub fn new(config: &DelayRotateConfig, valid_suffix: impl Into<String>) -> Self {
        DelayRotate {
            valid_suffix: valid_suffix.into(),
            min_files: config.min_files.max(1),
            min_delay: config.min_delay(),
            max_delay: config.max_delay(),
            tick: config.tick(),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a closed `*.deferred` file as eligible from now on.
    pub fn defer(&self, stream: &str, path: PathBuf) {
        self.defer_at(stream, path, Instant::now());
    }

    pub fn defer_at(&self, stream: &str, path: PathBuf, now: Instant) {
        debug!(%stream, path = %path.display(), "deferring rotated file");
        self.lock()
            .entry(stream.to_string())
            .or_default()
            .push(DeferredFile {
                path,
                eligible_at: now,
            });
    }

    /// Remove and return every batch whose release condition holds at `now`.
    pub fn take_due(&self, now: Instant) -> Vec<Batch> {
        let mut pending = self.lock();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, files)| self.is_due(files, now))
            .map(|(stream, _)| stream.clone())
            .collect();
        due.into_iter()
            .filter_map(|stream| {
                let files = pending.remove(&stream)?;
                Some(into_batch(stream, files))
            })
            .collect()
    }

    fn is_due(&self, files: &[DeferredFile], now: Instant) -> bool {
        let Some(oldest) = files.first() else {
            return false;
        };
        let waited = now.saturating_duration_since(oldest.eligible_at);
        waited >= self.min_delay && (files.len() >= self.min_files || waited >= self.max_delay)
    }

    /// Remove and return every pending batch regardless of timing.
    pub fn take_all(&self) -> Vec<Batch> {
        std::mem::take(&mut *self.lock())
            .into_iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(stream, files)| into_batch(stream, files))
            .collect()
    }

    /// Put a batch back after a failed release; it keeps its original age.
    fn restore(&self, batch: Batch) {
        let mut pending = self.lock();
        let entry = pending.entry(batch.stream).or_default();
        let mut files: Vec<DeferredFile> = batch
            .parts
            .into_iter()
            .map(|path| DeferredFile {
                path,
                eligible_at: batch.first_eligible,
            })
            .collect();
        files.append(entry);
        *entry = files;
    }

    /// Merge a batch into one completed file and return its path.
    pub async fn release(&self, batch: &Batch) -> io::Result<PathBuf> {
        let first = batch
            .parts
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty batch"))?;
        let base = logfile::without_suffix(first, DEFERRED_SUFFIX).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a deferred file", first.display()),
            )
        })?;
        let target = logfile::with_suffix(&base, &self.valid_suffix);

        if batch.parts.len() == 1 {
            logfile::finalize(first, &target).await?;
            return Ok(target);
        }

        let tmp = logfile::with_suffix(&base, MERGE_SUFFIX);
        if let Err(e) = merge_parts(&batch.parts, &tmp).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                debug!(path = %tmp.display(), "failed to remove merge file: {cleanup}");
            }
            return Err(e);
        }
        logfile::finalize(&tmp, &target).await?;

        for part in &batch.parts {
            if let Err(e) = fs::remove_file(part).await {
                // a leftover part would be shipped twice after a restart
                warn!(path = %part.display(), "failed to remove merged part: {e}");
            }
        }
        Ok(target)
    }

    /// Release a set of batches, restoring the ones that fail.
    pub async fn release_batches(&self, batches: Vec<Batch>) -> usize {
        let mut released = 0;
        for batch in batches {
            match self.release(&batch).await {
                Ok(path) => {
                    released += 1;
                    info!(
                        stream = %batch.stream,
                        parts = batch.parts.len(),
                        path = %path.display(),
                        "released delayed batch"
                    );
                }
                Err(e) => {
                    error!(stream = %batch.stream, "failed to release delayed batch: {e}");
                    self.restore(batch);
                }
            }
        }
        released
    }

    /// Timer loop; on stop every pending batch is released.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            min_files = self.min_files,
            min_delay = ?self.min_delay,
            max_delay = ?self.max_delay,
            "delay rotate loop started"
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let due = self.take_due(Instant::now());
                    if !due.is_empty() {
                        self.release_batches(due).await;
                    }
                }
            }
        }
        let released = self.release_batches(self.take_all()).await;
        info!(released, "delay rotate loop stopped");
    }

    pub fn pending(&self) -> Vec<PendingBatchView> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter_map(|(stream, files)| {
                let oldest = files.first()?;
                Some(PendingBatchView {
                    stream: stream.clone(),
                    files: files.len(),
                    oldest_wait_ms: now.saturating_duration_since(oldest.eligible_at).as_millis(),
                    state: if files.len() >= self.min_files {
                        BatchState::Batched
                    } else {
                        BatchState::Deferred
                    },
                })
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<DeferredFile>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn into_batch(stream: String, files: Vec<DeferredFile>) -> Batch {
    let first_eligible = files.first().map(|f| f.eligible_at).unwrap_or_else(Instant::now);
    Batch {
        stream,
        parts: files.into_iter().map(|f| f.path).collect(),
        first_eligible,
    }
}

async fn merge_parts(parts: &[PathBuf], tmp: &Path) -> io::Result<()> {
    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)
        .await?;
    for part in parts {
        let mut input = File::open(part).await?;
        tokio::io::copy(&mut input, &mut out).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min_files: usize, min_delay: u64, max_delay: u64) -> DelayRotate {
        DelayRotate::new(
            &DelayRotateConfig {
                enable: true,
                min_files,
                min_delay_secs: min_delay,
                max_delay_secs: max_delay,
                tick_ms: 100,
            },
            ".done",
        )
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn third_file_releases_before_max_delay() {
        let delay = policy(3, 1, 10);
        let t0 = Instant::now();

        delay.defer_at("s", PathBuf::from("a"), t0);
        assert!(delay.take_due(t0 + secs(1)).is_empty());
        delay.defer_at("s", PathBuf::from("b"), t0 + secs(2));
        assert!(delay.take_due(t0 + secs(3)).is_empty());
        delay.defer_at("s", PathBuf::from("c"), t0 + secs(4));

        let due = delay.take_due(t0 + secs(4));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].parts.len(), 3);
        assert!(delay.pending().is_empty());
    }

    #[test]
    fn slow_stream_releases_at_max_delay() {
        let delay = policy(3, 1, 10);
        let t0 = Instant::now();
        delay.defer_at("s", PathBuf::from("a"), t0);
        delay.defer_at("s", PathBuf::from("b"), t0 + secs(6));

        assert!(delay.take_due(t0 + secs(9)).is_empty());
        let due = delay.take_due(t0 + secs(10));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].parts, vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn min_delay_holds_back_bursts() {
        let delay = policy(2, 5, 10);
        let t0 = Instant::now();
        delay.defer_at("s", PathBuf::from("a"), t0);
        delay.defer_at("s", PathBuf::from("b"), t0);

        assert_eq!(delay.pending()[0].state, BatchState::Batched);
        assert!(delay.take_due(t0 + secs(4)).is_empty());
        assert_eq!(delay.take_due(t0 + secs(5)).len(), 1);
    }

    #[test]
    fn streams_are_independent() {
        let delay = policy(2, 0, 10);
        let t0 = Instant::now();
        delay.defer_at("a", PathBuf::from("a1"), t0);
        delay.defer_at("a", PathBuf::from("a2"), t0);
        delay.defer_at("b", PathBuf::from("b1"), t0);

        let due = delay.take_due(t0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].stream, "a");
        assert_eq!(delay.pending().len(), 1);
        assert_eq!(delay.take_all().len(), 1);
    }

    #[tokio::test]
    async fn release_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let delay = policy(3, 0, 10);
        let names = [
            "s_20240501120000000001.log.deferred",
            "s_20240501120002000000.log.deferred",
            "s_20240501120004000000.log.deferred",
        ];
        for (i, name) in names.iter().enumerate() {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("line {i}\n")).unwrap();
            delay.defer("s", path);
        }

        let batches = delay.take_all();
        let target = delay.release(&batches[0]).await.unwrap();
        assert_eq!(
            target,
            dir.path().join("s_20240501120000000001.log.done")
        );
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "line 0\nline 1\nline 2\n"
        );
        let left: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn failed_release_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let delay = policy(1, 0, 10);
        delay.defer("s", dir.path().join("s_20240501120000000001.log.deferred"));

        // the part does not exist, so the rename fails
        let released = delay.release_batches(delay.take_all()).await;
        assert_eq!(released, 0);
        assert_eq!(delay.pending()[0].files, 1);
    }

    #[tokio::test]
    async fn failed_merge_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let delay = policy(1, 0, 10);
        let first = dir.path().join("s_20240501120000000001.log.deferred");
        std::fs::write(&first, "a\n").unwrap();
        delay.defer("s", first.clone());
        // second part is missing, so the merge fails halfway
        delay.defer("s", dir.path().join("s_20240501120000000002.log.deferred"));

        let released = delay.release_batches(delay.take_all()).await;
        assert_eq!(released, 0);
        assert_eq!(delay.pending()[0].files, 2);
        assert!(!dir.path().join("s_20240501120000000001.log.merge.tmp").exists());
        assert!(first.exists());
    }
}
