//! Wires the components together: built once at startup, then started.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::{consume_records, BufferReceiver, IngestBuffer};
use crate::config::Config;
use crate::delay::DelayRotate;
use crate::error::ReloadError;
use crate::manager::{LoggerManager, ReloadReport};
use crate::recoup::RecoupUpload;
use crate::server::{self, AppState};
use crate::shutdown::{Running, Task};
use crate::upload::Uploader;

pub struct Service {
    config: Config,
    buffer: IngestBuffer,
    receiver: BufferReceiver,
    manager: Arc<LoggerManager>,
    delay: Option<Arc<DelayRotate>>,
    recoup: Arc<RecoupUpload>,
    fatal: CancellationToken,
    reload: ReloadReport,
}

impl Service {
    /// Build every component and reconcile the log directory.
    pub async fn build(config: Config, uploader: Arc<dyn Uploader>) -> Result<Self, ReloadError> {
        let fatal = CancellationToken::new();
        let delay = config.delay_rotate.enable.then(|| {
            Arc::new(DelayRotate::new(
                &config.delay_rotate,
                config.history.valid_suffix.clone(),
            ))
        });
        let manager = Arc::new(LoggerManager::new(&config, delay.clone(), fatal.clone()));
        let (buffer, receiver) =
            IngestBuffer::new(config.ingest.buffer_capacity, config.ingest.full_policy);
        let recoup = Arc::new(RecoupUpload::new(&config, uploader));

        let reload = manager.reload_history_files().await?;
        info!(dir = %config.log_dir.display(), ?reload, "reloaded history files");

        Ok(Service {
            config,
            buffer,
            receiver,
            manager,
            delay,
            recoup,
            fatal,
            reload,
        })
    }

    pub fn manager(&self) -> &Arc<LoggerManager> {
        &self.manager
    }

    pub fn reload_report(&self) -> &ReloadReport {
        &self.reload
    }

    /// Spawn every background loop. Without a listener no HTTP server runs,
    /// records can still be pushed through [`Running::buffer`].
    pub fn start(self, listener: Option<TcpListener>) -> Running {
        let Service {
            config,
            buffer,
            receiver,
            manager,
            delay,
            recoup,
            fatal,
            reload: _,
        } = self;

        let consumer = {
            let manager = Arc::clone(&manager);
            Task::spawn("consumer", move |_| consume_records(receiver, manager))
        };

        let force_rotate = {
            let manager = Arc::clone(&manager);
            let interval = config.rotate.timer_interval();
            let cycle = config.rotate.cycle();
            Task::spawn("force_rotate", move |cancel| {
                manager.run_force_rotate(interval, cycle, cancel)
            })
        };

        let delay_task = delay.as_ref().map(|delay| {
            let task = Task::spawn("delay_rotate", {
                let delay = Arc::clone(delay);
                move |cancel| delay.run(cancel)
            });
            (Arc::clone(delay), task)
        });

        let recoup_task = {
            let interval = config.history.recoup_interval();
            Task::spawn("recoup", move |cancel| recoup.run(interval, cancel))
        };

        let server = listener.map(|listener| {
            let app = server::router(
                AppState {
                    buffer: buffer.clone(),
                    manager: Arc::clone(&manager),
                    delay: delay.clone(),
                    wait_for_write: config.ingest.wait_for_write,
                },
                &config.ingest_path,
            );
            Task::spawn("http", move |cancel| async move {
                if let Err(e) = server::serve(listener, app, cancel).await {
                    error!("http listener failed: {e}");
                }
            })
        });

        Running {
            deadline: config.shutdown.deadline(),
            buffer,
            manager,
            fatal,
            recoup: recoup_task,
            force_rotate,
            delay: delay_task,
            consumer,
            server,
        }
    }
}
