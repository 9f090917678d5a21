use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::FullPolicy;
use crate::error::BufferError;
use crate::manager::LoggerManager;
use crate::record::Record;

/// FIFO queue between the ingest handlers and the single consumer task.
///
/// Cloning the buffer is cheap; every clone feeds the same queue. Closing it
/// rejects further enqueues while the consumer keeps draining what is
/// already queued.
#[derive(Clone)]
pub struct IngestBuffer {
    sender: mpsc::Sender<Record>,
    full_policy: FullPolicy,
    closed: CancellationToken,
    counters: Arc<BufferCounters>,
}

/// Receiving half of an [`IngestBuffer`]; owned by the consumer task.
pub struct BufferReceiver {
    receiver: mpsc::Receiver<Record>,
    closed: CancellationToken,
    receiver_closed: bool,
    counters: Arc<BufferCounters>,
}

#[derive(Default)]
struct BufferCounters {
    /// Records accepted or in the middle of being accepted, not yet dequeued.
    depth: AtomicUsize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of the buffer for `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub depth: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub closed: bool,
}

impl IngestBuffer {
    pub fn new(capacity: usize, full_policy: FullPolicy) -> (Self, BufferReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let counters = Arc::new(BufferCounters::default());
        (
            IngestBuffer {
                sender,
                full_policy,
                closed: closed.clone(),
                counters: Arc::clone(&counters),
            },
            BufferReceiver {
                receiver,
                closed,
                receiver_closed: false,
                counters,
            },
        )
    }

    /// Queue a record for the consumer.
    ///
    /// With [`FullPolicy::Block`] this waits for a free slot; with
    /// [`FullPolicy::Reject`] a full queue fails with [`BufferError::Full`].
    pub async fn enqueue(&self, record: Record) -> Result<(), BufferError> {
        if self.closed.is_cancelled() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(BufferError::Closed);
        }

        self.counters.depth.fetch_add(1, Ordering::AcqRel);
        let result = match self.full_policy {
            FullPolicy::Block => self
                .sender
                .send(record)
                .await
                .map_err(|_| BufferError::Closed),
            FullPolicy::Reject => self.sender.try_send(record).map_err(|e| match e {
                TrySendError::Full(_) => BufferError::Full,
                TrySendError::Closed(_) => BufferError::Closed,
            }),
        };

        match result {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.depth.fetch_sub(1, Ordering::AcqRel);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Records queued but not yet handed to the consumer.
    pub fn len(&self) -> usize {
        self.counters.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting records. Already queued records are still delivered.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            depth: self.len(),
            capacity: self.sender.max_capacity(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }
}

impl BufferReceiver {
    /// Next record in FIFO order; `None` once the buffer is closed and empty.
    pub async fn dequeue(&mut self) -> Option<Record> {
        loop {
            tokio::select! {
                biased;
                record = self.receiver.recv() => {
                    if record.is_some() {
                        self.counters.depth.fetch_sub(1, Ordering::AcqRel);
                        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                    }
                    return record;
                }
                _ = self.closed.cancelled(), if !self.receiver_closed => {
                    // wakes blocked senders and lets recv() finish once empty
                    self.receiver.close();
                    self.receiver_closed = true;
                }
            }
        }
    }
}

/// Drain the buffer into the logger manager until it is closed and empty.
pub async fn consume_records(mut receiver: BufferReceiver, manager: Arc<LoggerManager>) {
    debug!("ingest consumer started");
    while let Some(record) = receiver.dequeue().await {
        let result = manager.write(&record.stream, &record.payload).await;
        let stream = record.stream.clone();
        trace!(
            %stream,
            queued_ms = (Utc::now() - record.received_at).num_milliseconds(),
            "record written"
        );
        if let Some(e) = record.complete(result) {
            error!(%stream, "dropping record after write failure: {e}");
        }
    }
    info!("ingest buffer drained, consumer exiting");
}
