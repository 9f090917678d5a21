//! Per-stream output files and the rotation rules applied to them.
//!
//! The manager owns every `Open` file. Each stream key maps to a slot behind
//! its own async mutex, so writes to one stream are strictly ordered and a
//! rotation never interleaves with a write in progress, while different
//! streams proceed independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::delay::DelayRotate;
use crate::error::{ReloadError, WriteError};
use crate::logfile::{self, FileKind, LogFile, DEFERRED_SUFFIX};
use crate::record::is_valid_stream_key;

/// Why a file is being rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateReason {
    /// Reached the size cap.
    Size,
    /// Older than the rotation cycle.
    Age,
    /// Explicit [`LoggerManager::rotate`] call.
    Manual,
    /// Process is stopping.
    Shutdown,
}

#[derive(Default)]
struct StreamSlot {
    current: Option<LogFile>,
    failed: bool,
}

impl StreamSlot {
    /// Nothing open and nothing to remember; safe to forget.
    fn is_idle(&self) -> bool {
        self.current.is_none() && !self.failed
    }
}

/// Snapshot of a stream's open file.
#[derive(Debug, Clone, Serialize)]
pub struct OpenFileView {
    pub stream: String,
    pub path: Option<PathBuf>,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub last_write: Option<DateTime<Utc>>,
    pub failed: bool,
}

/// Outcome of [`LoggerManager::reload_history_files`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// Open files that will keep receiving writes.
    pub resumed: usize,
    /// Open files closed and queued for upload.
    pub force_closed: usize,
    /// Completed files waiting for the upload scanner.
    pub completed: usize,
    /// Deferred files handed back to the delay policy (or completed).
    pub deferred: usize,
    pub uploaded: usize,
    /// Interrupted merges and empty leftovers that were deleted.
    pub removed: usize,
    pub unknown: usize,
}

pub struct LoggerManager {
    dir: PathBuf,
    max_size: u64,
    max_age: Duration,
    valid_suffix: String,
    resume_open: bool,
    streams: Mutex<HashMap<String, Arc<AsyncMutex<StreamSlot>>>>,
    delay: Option<Arc<DelayRotate>>,
    fatal: CancellationToken,
}

impl LoggerManager {
    /// `fatal` is cancelled when a stream can no longer be written durably.
    pub fn new(config: &Config, delay: Option<Arc<DelayRotate>>, fatal: CancellationToken) -> Self {
        LoggerManager {
            dir: config.log_dir.clone(),
            max_size: config.rotate.max_size_bytes,
            max_age: config.rotate.cycle(),
            valid_suffix: config.history.valid_suffix.clone(),
            resume_open: config.history.resume_open,
            streams: Mutex::new(HashMap::new()),
            delay,
            fatal,
        }
    }

    /// Append `payload` to the stream's current file.
    ///
    /// A file already over the size or age cap is rotated first; a file that
    /// reaches the size cap with this write is rotated right after it.
    pub async fn write(&self, stream: &str, payload: &[u8]) -> Result<(), WriteError> {
        if !is_valid_stream_key(stream) {
            return Err(WriteError::InvalidStream(stream.to_string()));
        }
        let slot = self.slot(stream);
        let mut slot = slot.lock().await;
        if slot.failed {
            return Err(WriteError::StreamFailed(stream.to_string()));
        }

        let now = Utc::now();
        let reason = slot.current.as_ref().and_then(|file| {
            if file.size() >= self.max_size || file.is_torn() {
                Some(RotateReason::Size)
            } else if file.age(now) >= self.max_age {
                Some(RotateReason::Age)
            } else {
                None
            }
        });
        if let Some(reason) = reason {
            self.rotate_slot(stream, &mut slot, reason).await?;
        }

        let file = match slot.current.take() {
            Some(file) => file,
            None => match LogFile::create(&self.dir, stream, now, &self.valid_suffix).await {
                Ok(file) => {
                    debug!(%stream, path = %file.path().display(), "opened log file");
                    file
                }
                Err(source) => {
                    let path = self.dir.clone();
                    return Err(self.fail(stream, &mut slot, path, source));
                }
            },
        };
        let file = slot.current.insert(file);
        if let Err(source) = file.append(payload).await {
            return Err(WriteError::Io {
                path: file.path().to_path_buf(),
                source,
            });
        }

        if file.size() >= self.max_size {
            // the record is on disk; a failed rotation here only disables the stream
            if let Err(e) = self.rotate_slot(stream, &mut slot, RotateReason::Size).await {
                debug!(%stream, "post-write rotation failed: {e}");
            }
        }
        Ok(())
    }

    /// Close the stream's current file; the next write opens a new one.
    pub async fn rotate(&self, stream: &str) -> Result<(), WriteError> {
        let slot = self.slot(stream);
        let mut slot = slot.lock().await;
        if slot.failed {
            return Err(WriteError::StreamFailed(stream.to_string()));
        }
        self.rotate_slot(stream, &mut slot, RotateReason::Manual).await
    }

    async fn rotate_slot(
        &self,
        stream: &str,
        slot: &mut StreamSlot,
        reason: RotateReason,
    ) -> Result<(), WriteError> {
        let Some(file) = slot.current.take() else {
            return Ok(());
        };
        let path = file.path().to_path_buf();
        let closed = match file.close().await {
            Ok(closed) => closed,
            Err(source) => return Err(self.fail(stream, slot, path, source)),
        };

        if closed.size == 0 {
            if let Err(e) = fs::remove_file(&closed.path).await {
                warn!(%stream, path = %closed.path.display(), "failed to remove empty file: {e}");
            }
            return Ok(());
        }

        let defer = matches!(reason, RotateReason::Age | RotateReason::Manual);
        let delay = self.delay.as_ref().filter(|_| defer);
        let suffix = match delay {
            Some(_) => DEFERRED_SUFFIX,
            None => self.valid_suffix.as_str(),
        };
        let target = logfile::with_suffix(&closed.path, suffix);
        if let Err(source) = logfile::finalize(&closed.path, &target).await {
            return Err(self.fail(stream, slot, closed.path, source));
        }
        if let Some(delay) = delay {
            delay.defer(stream, target.clone());
        }
        info!(
            %stream,
            path = %target.display(),
            size = closed.size,
            ?reason,
            "rotated log file"
        );
        Ok(())
    }

    fn fail(
        &self,
        stream: &str,
        slot: &mut StreamSlot,
        path: PathBuf,
        source: std::io::Error,
    ) -> WriteError {
        slot.failed = true;
        error!(
            %stream,
            path = %path.display(),
            "rotation failed, stream can no longer be written: {source}"
        );
        self.fatal.cancel();
        WriteError::Rotation {
            stream: stream.to_string(),
            path,
            source,
        }
    }

    /// Rotate every open file older than `cycle`, then forget streams with
    /// nothing open; returns how many rotated.
    pub async fn force_rotate_expired(&self, cycle: Duration) -> usize {
        let mut rotated = 0;
        for (stream, slot) in self.slots() {
            let mut slot = slot.lock().await;
            let now = Utc::now();
            let expired = slot
                .current
                .as_ref()
                .is_some_and(|file| file.age(now) >= cycle);
            if expired && self.rotate_slot(&stream, &mut slot, RotateReason::Age).await.is_ok() {
                rotated += 1;
            }
        }
        let pruned = self.prune_idle();
        if pruned > 0 {
            debug!(pruned, "dropped idle streams");
        }
        rotated
    }

    /// Drop slots with no open file that nobody else holds; returns how many.
    ///
    /// A failed slot is kept so the stream stays disabled. The next write to a
    /// pruned stream starts a fresh slot, and file creation skips any name
    /// still used by a closed file.
    pub fn prune_idle(&self) -> usize {
        let mut streams = self.lock_streams();
        let before = streams.len();
        streams.retain(|_, slot| {
            // the map's own reference is the only one, so no task can be
            // waiting on this slot and the lock below cannot be contended
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |slot| !slot.is_idle())
        });
        before - streams.len()
    }

    /// Periodically force-rotate files older than `cycle`, independent of
    /// write volume.
    pub async fn run_force_rotate(
        self: Arc<Self>,
        interval: Duration,
        cycle: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        info!(?interval, ?cycle, "force rotate loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let rotated = self.force_rotate_expired(cycle).await;
                    if rotated > 0 {
                        debug!(rotated, "force rotated expired files");
                    }
                }
            }
        }
        info!("force rotate loop stopped");
    }

    /// Flush and complete every open file; returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for (stream, slot) in self.slots() {
            let mut slot = slot.lock().await;
            if slot.current.is_some()
                && self
                    .rotate_slot(&stream, &mut slot, RotateReason::Shutdown)
                    .await
                    .is_ok()
            {
                closed += 1;
            }
        }
        closed
    }

    /// Reconcile files left in the log directory by a previous run.
    ///
    /// Completed and uploaded files stay as they are. Files that were open
    /// are resumed (the newest one per stream, when `resume_open` is set and
    /// it ends on a record boundary) or completed. Deferred files go back to
    /// the delay policy, or are completed when it is disabled. Interrupted
    /// merges are deleted since their parts are still present.
    pub async fn reload_history_files(&self) -> Result<ReloadReport, ReloadError> {
        let dir_err = |source| ReloadError::Directory {
            path: self.dir.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).await.map_err(dir_err)?;
        let mut entries = fs::read_dir(&self.dir).await.map_err(dir_err)?;

        let mut report = ReloadReport::default();
        let mut open: HashMap<String, Vec<(DateTime<Utc>, PathBuf)>> = HashMap::new();
        let mut deferred: Vec<(String, DateTime<Utc>, PathBuf)> = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(dir_err)? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|source| ReloadError::File {
                path: path.clone(),
                source,
            })?;
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = logfile::file_name(&path).map(str::to_string) else {
                warn!(path = %path.display(), "ignoring file with non UTF-8 name");
                report.unknown += 1;
                continue;
            };

            match logfile::classify(&name, &self.valid_suffix) {
                FileKind::Completed => report.completed += 1,
                FileKind::Uploaded => report.uploaded += 1,
                FileKind::Merging => {
                    remove(&path).await?;
                    report.removed += 1;
                }
                FileKind::Open => match logfile::parse_name(&name, "") {
                    Some((stream, created)) => {
                        open.entry(stream).or_default().push((created, path));
                    }
                    None => {
                        warn!(path = %path.display(), "ignoring unrecognized .log file");
                        report.unknown += 1;
                    }
                },
                FileKind::Deferred => match logfile::parse_name(&name, DEFERRED_SUFFIX) {
                    Some((stream, created)) => deferred.push((stream, created, path)),
                    None => {
                        warn!(path = %path.display(), "ignoring unrecognized deferred file");
                        report.unknown += 1;
                    }
                },
                FileKind::Unknown => {
                    debug!(path = %path.display(), "ignoring unrelated file");
                    report.unknown += 1;
                }
            }
        }

        for (stream, mut files) in open {
            files.sort();
            let newest = files.pop();
            for (_, path) in files {
                self.complete_leftover(&path, &mut report).await?;
            }
            let Some((created, path)) = newest else {
                continue;
            };
            let resumable = self.resume_open
                && logfile::ends_on_record_boundary(&path)
                    .await
                    .map_err(|source| ReloadError::File {
                        path: path.clone(),
                        source,
                    })?;
            if !resumable {
                self.complete_leftover(&path, &mut report).await?;
                continue;
            }
            let file = LogFile::resume(path.clone(), created)
                .await
                .map_err(|source| ReloadError::File { path, source })?;
            info!(%stream, path = %file.path().display(), size = file.size(), "resuming log file");
            let slot = self.slot(&stream);
            let mut slot = slot.lock().await;
            slot.current = Some(file);
            report.resumed += 1;
        }

        deferred.sort_by(|a, b| (a.1, &a.2).cmp(&(b.1, &b.2)));
        for (stream, _, path) in deferred {
            report.deferred += 1;
            match &self.delay {
                Some(delay) => delay.defer(&stream, path),
                None => {
                    let Some(base) = logfile::without_suffix(&path, DEFERRED_SUFFIX) else {
                        continue;
                    };
                    let target = logfile::with_suffix(&base, &self.valid_suffix);
                    logfile::finalize(&path, &target)
                        .await
                        .map_err(|source| ReloadError::File { path, source })?;
                }
            }
        }

        info!(dir = %self.dir.display(), ?report, "reloaded history files");
        Ok(report)
    }

    /// Complete a file that was open when the last run stopped.
    async fn complete_leftover(
        &self,
        path: &Path,
        report: &mut ReloadReport,
    ) -> Result<(), ReloadError> {
        let file_err = |source| ReloadError::File {
            path: path.to_path_buf(),
            source,
        };
        let size = fs::metadata(path).await.map_err(file_err)?.len();
        if size == 0 {
            remove(path).await?;
            report.removed += 1;
            return Ok(());
        }
        let target = logfile::with_suffix(path, &self.valid_suffix);
        logfile::finalize(path, &target).await.map_err(file_err)?;
        info!(path = %target.display(), size, "completed leftover open file");
        report.force_closed += 1;
        Ok(())
    }

    /// Current open file of every known stream, sorted by stream key.
    pub async fn snapshot(&self) -> Vec<OpenFileView> {
        let mut views = Vec::new();
        for (stream, slot) in self.slots() {
            let slot = slot.lock().await;
            let file = slot.current.as_ref();
            views.push(OpenFileView {
                stream,
                path: file.map(|f| f.path().to_path_buf()),
                size: file.map_or(0, LogFile::size),
                created: file.map(LogFile::created),
                last_write: file.map(LogFile::last_write),
                failed: slot.failed,
            });
        }
        views.sort_by(|a, b| a.stream.cmp(&b.stream));
        views
    }

    /// Log the state of every stream.
    pub async fn dump(&self) {
        for view in self.snapshot().await {
            info!(
                stream = %view.stream,
                path = ?view.path,
                size = view.size,
                failed = view.failed,
                "stream state"
            );
        }
    }

    fn slot(&self, stream: &str) -> Arc<AsyncMutex<StreamSlot>> {
        Arc::clone(self.lock_streams().entry(stream.to_string()).or_default())
    }

    fn slots(&self) -> Vec<(String, Arc<AsyncMutex<StreamSlot>>)> {
        self.lock_streams()
            .iter()
            .map(|(stream, slot)| (stream.clone(), Arc::clone(slot)))
            .collect()
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<StreamSlot>>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn remove(path: &Path) -> Result<(), ReloadError> {
    fs::remove_file(path)
        .await
        .map_err(|source| ReloadError::File {
            path: path.to_path_buf(),
            source,
        })
}
