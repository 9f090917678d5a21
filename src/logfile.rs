//! On-disk naming and the handle for a stream's active output file.
//!
//! Every file in the log directory is named after the stream that produced it
//! and the UTC time it was created:
//!
//! ```text
//! orders_20240501120000123456.log                 open, being written
//! orders_20240501120000123456.log.deferred        closed, held by delay-rotate
//! orders_20240501120000123456.log.merge.tmp       batch merge in progress
//! orders_20240501120000123456.log.done            completed, waiting for upload
//! orders_20240501120000123456.log.done.uploaded   shipped
//! ```
//!
//! The completed suffix (`.done` above) is configurable. Moving between
//! states is always a single `rename`, so a restarted process can classify
//! every file from its name alone.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

pub const OPEN_EXT: &str = ".log";
pub const DEFERRED_SUFFIX: &str = ".deferred";
pub const MERGE_SUFFIX: &str = ".merge.tmp";
pub const UPLOADED_SUFFIX: &str = ".uploaded";

const TS_SECONDS_FORMAT: &str = "%Y%m%d%H%M%S";
const TS_LEN: usize = 20;

/// Lifecycle state of a file, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Open,
    Deferred,
    Merging,
    Completed,
    Uploaded,
    Unknown,
}

/// Classify a directory entry by name.
pub fn classify(name: &str, valid_suffix: &str) -> FileKind {
    if name.ends_with(UPLOADED_SUFFIX) {
        FileKind::Uploaded
    } else if name.ends_with(valid_suffix) {
        FileKind::Completed
    } else if name.ends_with(MERGE_SUFFIX) {
        FileKind::Merging
    } else if name.ends_with(DEFERRED_SUFFIX) {
        FileKind::Deferred
    } else if name.ends_with(OPEN_EXT) {
        FileKind::Open
    } else {
        FileKind::Unknown
    }
}

/// Name of an open file for `stream` created at `created`.
pub fn base_name(stream: &str, created: DateTime<Utc>) -> String {
    format!(
        "{}_{}{:06}{}",
        stream,
        created.format(TS_SECONDS_FORMAT),
        created.timestamp_subsec_micros(),
        OPEN_EXT
    )
}

/// Recover stream key and creation time from a name of any known kind.
///
/// `suffix` is whatever follows the `.log` base (`""` for open files).
pub fn parse_name(name: &str, suffix: &str) -> Option<(String, DateTime<Utc>)> {
    let base = name.strip_suffix(suffix)?.strip_suffix(OPEN_EXT)?;
    let (stream, ts) = base.rsplit_once('_')?;
    if stream.is_empty() || ts.len() != TS_LEN || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds = NaiveDateTime::parse_from_str(&ts[..14], TS_SECONDS_FORMAT).ok()?;
    let micros: i64 = ts[14..].parse().ok()?;
    let created = seconds.and_utc() + chrono::Duration::microseconds(micros);
    Some((stream.to_string(), created))
}

/// Path with `suffix` appended to the file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Path with `suffix` removed from the file name, if it ends with it.
pub fn without_suffix(path: &Path, suffix: &str) -> Option<PathBuf> {
    path.to_str()
        .and_then(|p| p.strip_suffix(suffix))
        .map(PathBuf::from)
}

/// File name as UTF-8, if it has one.
pub fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Handle to the single `Open` file of a stream.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    created: DateTime<Utc>,
    /// Bytes of complete records in the file.
    size: u64,
    last_write: DateTime<Utc>,
    /// A failed append left bytes that could not be cut off.
    torn: bool,
    file: File,
}

impl LogFile {
    /// Create a fresh file in `dir`. If the name is already taken, by an open
    /// file or by any later state of one, the timestamp is bumped by a
    /// microsecond until it is not.
    pub async fn create(
        dir: &Path,
        stream: &str,
        now: DateTime<Utc>,
        valid_suffix: &str,
    ) -> io::Result<Self> {
        let mut created = now;
        loop {
            let path = dir.join(base_name(stream, created));
            if base_in_use(&path, valid_suffix).await? {
                created += chrono::Duration::microseconds(1);
                continue;
            }
            match OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    return Ok(LogFile {
                        path,
                        created,
                        size: 0,
                        last_write: created,
                        torn: false,
                        file,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    created += chrono::Duration::microseconds(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reopen a file left open by a previous run for further appends.
    pub async fn resume(path: PathBuf, created: DateTime<Utc>) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(&path).await?;
        let meta = file.metadata().await?;
        let last_write = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(created);
        Ok(LogFile {
            path,
            created,
            size: meta.len(),
            last_write,
            torn: false,
            file,
        })
    }

    /// Append one record. On failure the partial write is cut off again, so
    /// the file still ends on a record boundary.
    pub async fn append(&mut self, payload: &[u8]) -> io::Result<()> {
        let written = async {
            self.file.write_all(payload).await?;
            self.file.flush().await
        }
        .await;
        if let Err(e) = written {
            self.discard_tail().await;
            return Err(e);
        }
        self.size += payload.len() as u64;
        self.last_write = Utc::now();
        Ok(())
    }

    async fn discard_tail(&mut self) {
        if let Err(e) = self.file.set_len(self.size).await {
            warn!(path = %self.path.display(), "cannot cut off partial record: {e}");
            if let Ok(meta) = self.file.metadata().await {
                self.size = meta.len();
            }
            self.torn = true;
        }
    }

    /// Flush to durable storage and release the handle.
    pub async fn close(mut self) -> io::Result<ClosedFile> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(ClosedFile {
            path: self.path,
            size: self.size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_write(&self) -> DateTime<Utc> {
        self.last_write
    }

    /// True when a partial record could not be removed; the file must not
    /// receive more records.
    pub fn is_torn(&self) -> bool {
        self.torn
    }

    /// Time since creation; zero if the clock went backwards.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A file that has been flushed and closed but not yet renamed.
#[derive(Debug, Clone)]
pub struct ClosedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// True when a closed file derived from `base` is still in the directory.
async fn base_in_use(base: &Path, valid_suffix: &str) -> io::Result<bool> {
    let uploaded = format!("{valid_suffix}{UPLOADED_SUFFIX}");
    for suffix in [DEFERRED_SUFFIX, MERGE_SUFFIX, valid_suffix, uploaded.as_str()] {
        if fs::try_exists(with_suffix(base, suffix)).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// True when the file is empty or its last byte is a newline.
///
/// A file cut off mid-record by a crash should not receive further appends.
pub async fn ends_on_record_boundary(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

/// Atomically move `from` to `to`.
pub async fn finalize(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to).await
}
