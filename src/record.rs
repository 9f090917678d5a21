use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::error::WriteError;

/// Upper bound for a stream key; keys end up in file names.
pub const MAX_STREAM_KEY_LEN: usize = 128;

/// One ingested payload addressed to a stream.
///
/// Records only live while queued in the [`crate::buffer::IngestBuffer`]
/// or while the consumer appends them to the stream's current file.
#[derive(Debug)]
pub struct Record {
    pub stream: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
    /// Optional channel notified once the payload hit the file (or failed to).
    pub ack: Option<oneshot::Sender<Result<(), WriteError>>>,
}

impl Record {
    pub fn new(stream: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Record {
            stream: stream.into(),
            payload: payload.into(),
            received_at: Utc::now(),
            ack: None,
        }
    }

    /// Attach an acknowledgement channel and return its receiving half.
    pub fn with_ack(mut self) -> (Self, oneshot::Receiver<Result<(), WriteError>>) {
        let (tx, rx) = oneshot::channel();
        self.ack = Some(tx);
        (self, rx)
    }

    /// Report the write outcome to whoever is waiting on the ack, if anyone.
    pub fn complete(self, result: Result<(), WriteError>) -> Option<WriteError> {
        match self.ack {
            Some(ack) => {
                // the caller may have gone away; nothing to do then
                let _ = ack.send(result);
                None
            }
            None => result.err(),
        }
    }
}

/// Check that `stream` is usable as a file name prefix.
///
/// Allowed characters are ASCII alphanumerics, `.`, `_` and `-`; the key
/// must not be empty, must not start with `.` and must fit in
/// [`MAX_STREAM_KEY_LEN`] bytes.
pub fn is_valid_stream_key(stream: &str) -> bool {
    !stream.is_empty()
        && stream.len() <= MAX_STREAM_KEY_LEN
        && !stream.starts_with('.')
        && stream
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
