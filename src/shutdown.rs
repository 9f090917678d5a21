//! Background task lifecycle and the ordered shutdown sequence.
//!
//! Shutdown runs, in order:
//! 1. stop the recoup scanner (an upload in flight finishes first),
//! 2. stop the force-rotate timer and close every open file,
//! 3. stop the delay-rotate loop, which releases its pending batches,
//! 4. close the ingest buffer and wait until the consumer drained it,
//! 5. close files opened by the drained records and stop the listener.
//!
//! The configured deadline is advisory: a step that takes longer logs a
//! warning and keeps waiting, so no queued record is dropped.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::IngestBuffer;
use crate::delay::DelayRotate;
use crate::manager::LoggerManager;

/// How often the drain step reports the remaining buffer depth.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A spawned long-lived loop with its own stop token.
pub struct Task {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Task {
    /// Spawn `f(stop_token)` on the runtime.
    pub fn spawn<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f(cancel.clone()));
        debug!(task = name, "spawned background task");
        Task {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop to stop and wait for it.
    pub async fn stop(self, deadline: Duration) {
        self.cancel.cancel();
        self.join(deadline).await;
    }

    /// Wait for the task to end on its own.
    pub async fn join(mut self, deadline: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match with_deadline(self.name, handle, deadline).await {
            Ok(()) => debug!(task = self.name, "task stopped"),
            Err(e) if e.is_panic() => error!(task = self.name, "task panicked: {e}"),
            Err(e) => warn!(task = self.name, "task aborted: {e}"),
        }
    }

    fn poll_exit(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), JoinError>> {
        let Some(handle) = self.handle.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(handle).poll(cx) {
            Poll::Ready(result) => {
                self.handle = None;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Await `fut`, warning (once) if it outlives `deadline`.
pub async fn with_deadline<F: Future>(step: &str, fut: F, deadline: Duration) -> F::Output {
    tokio::pin!(fut);
    let warn_at = time::sleep(deadline);
    tokio::pin!(warn_at);
    let mut warned = false;
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = &mut warn_at, if !warned => {
                warn!(step, ?deadline, "shutdown step is taking longer than the deadline");
                warned = true;
            }
        }
    }
}

/// Why the process is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// SIGINT or SIGTERM.
    Signal,
    /// A stream could no longer be written durably.
    Fatal,
    /// A background task ended while it should still be running.
    WorkerExited(&'static str),
}

impl ExitCause {
    /// Every shutdown exits non-zero; a clean one reports 255.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExitCause::Signal => 255,
            ExitCause::Fatal | ExitCause::WorkerExited(_) => 2,
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Every running piece of the pipeline, in the order shutdown needs them.
pub struct Running {
    pub(crate) deadline: Duration,
    pub(crate) buffer: IngestBuffer,
    pub(crate) manager: Arc<LoggerManager>,
    pub(crate) fatal: CancellationToken,
    pub(crate) recoup: Task,
    pub(crate) force_rotate: Task,
    pub(crate) delay: Option<(Arc<DelayRotate>, Task)>,
    pub(crate) consumer: Task,
    pub(crate) server: Option<Task>,
}

impl Running {
    pub fn buffer(&self) -> &IngestBuffer {
        &self.buffer
    }

    pub fn manager(&self) -> &Arc<LoggerManager> {
        &self.manager
    }

    pub fn delay(&self) -> Option<&Arc<DelayRotate>> {
        self.delay.as_ref().map(|(delay, _)| delay)
    }

    /// Resolve when the process should stop for a reason other than a
    /// signal: a fatal stream error or a task that exited early.
    pub async fn wait_for_exit(&mut self) -> ExitCause {
        let fatal = self.fatal.clone();
        let crashed = poll_fn(|cx| {
            let mut tasks: Vec<&mut Task> = vec![
                &mut self.recoup,
                &mut self.force_rotate,
                &mut self.consumer,
            ];
            if let Some((_, task)) = self.delay.as_mut() {
                tasks.push(task);
            }
            if let Some(task) = self.server.as_mut() {
                tasks.push(task);
            }
            for task in tasks {
                if let Poll::Ready(result) = task.poll_exit(cx) {
                    return Poll::Ready((task.name(), result));
                }
            }
            Poll::Pending
        });

        tokio::select! {
            _ = fatal.cancelled() => {
                error!("a stream failed to rotate, shutting down");
                ExitCause::Fatal
            }
            (name, result) = crashed => {
                match result {
                    Err(e) if e.is_panic() => error!(task = name, "background task panicked: {e}"),
                    Err(e) => error!(task = name, "background task aborted: {e}"),
                    Ok(()) => error!(task = name, "background task exited unexpectedly"),
                }
                ExitCause::WorkerExited(name)
            }
        }
    }

    /// Run the shutdown sequence. A panic inside it is logged and swallowed
    /// so the caller can always exit.
    pub async fn shutdown(self) {
        match tokio::spawn(self.run_shutdown()).await {
            Ok(()) => {}
            Err(e) => error!("shutdown sequence panicked: {e}"),
        }
    }

    async fn run_shutdown(self) {
        let Running {
            deadline,
            buffer,
            manager,
            fatal: _,
            recoup,
            force_rotate,
            delay,
            consumer,
            server,
        } = self;
        info!(pid = std::process::id(), "shutting down");

        recoup.stop(deadline).await;

        force_rotate.stop(deadline).await;
        let closed = with_deadline("close open files", manager.close_all(), deadline).await;
        info!(closed, "closed open log files");

        if let Some((_, task)) = delay {
            task.stop(deadline).await;
        }

        buffer.close();
        drain(&buffer, &consumer, deadline).await;
        consumer.join(deadline).await;
        info!("ingest buffer drained");

        let late = manager.close_all().await;
        if late > 0 {
            info!(closed = late, "closed files opened while draining");
        }

        if let Some(server) = server {
            server.stop(deadline).await;
        }
        info!("shutdown complete");
    }
}

/// Poll the buffer until the consumer has taken every record.
async fn drain(buffer: &IngestBuffer, consumer: &Task, deadline: Duration) {
    let started = Instant::now();
    let mut warned = false;
    let mut poll = time::interval(DRAIN_POLL_INTERVAL);
    loop {
        let depth = buffer.len();
        if depth == 0 {
            return;
        }
        if consumer.handle.as_ref().map_or(true, JoinHandle::is_finished) {
            error!(depth, "consumer is gone, queued records cannot be written");
            return;
        }
        debug!(depth, "waiting for ingest buffer to drain");
        if !warned && started.elapsed() > deadline {
            warn!(depth, ?deadline, "buffer drain is taking longer than the deadline");
            warned = true;
        }
        poll.tick().await;
    }
}
