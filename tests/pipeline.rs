use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use binlog_spool::config::Config;
use binlog_spool::dir_upload::DirUploader;
use binlog_spool::error::UploadError;
use binlog_spool::logfile::{self, FileKind};
use binlog_spool::noop_upload::NoopUploader;
use binlog_spool::record::Record;
use binlog_spool::service::Service;
use binlog_spool::shutdown::ExitCause;
use binlog_spool::upload::{CompletedFile, Uploader};

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.log_dir = dir.to_path_buf();
    config.history.recoup_interval_secs = 1;
    config.shutdown.deadline_secs = 1;
    config
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

fn count_kind(dir: &Path, kind: FileKind) -> usize {
    names(dir)
        .iter()
        .filter(|n| logfile::classify(n, ".done") == kind)
        .count()
}

/// Every byte of `stream` on disk, in file-name (creation) order.
fn stream_contents(dir: &Path, stream: &str) -> String {
    let prefix = format!("{stream}_");
    names(dir)
        .iter()
        .filter(|n| n.starts_with(&prefix))
        .map(|n| std::fs::read_to_string(dir.join(n)).unwrap())
        .collect()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_every_queued_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.rotate.max_size_bytes = 200;
    cfg.history.recoup_interval_secs = 3600;

    let service = Service::build(cfg, Arc::new(NoopUploader)).await.unwrap();
    let running = service.start(None);
    let buffer = running.buffer().clone();

    let streams = ["orders", "users", "audit"];
    let mut expected = vec![String::new(); streams.len()];
    for i in 0..600 {
        let idx = i % streams.len();
        let line = format!("{}-{i}\n", streams[idx]);
        expected[idx].push_str(&line);
        buffer.enqueue(Record::new(streams[idx], line)).await.unwrap();
    }

    running.shutdown().await;

    assert_eq!(buffer.len(), 0);
    assert!(buffer.is_closed());
    assert_eq!(count_kind(dir.path(), FileKind::Open), 0);
    // size rotation produced several files per stream
    assert!(names(dir.path()).len() > streams.len());
    for (idx, stream) in streams.iter().enumerate() {
        assert_eq!(stream_contents(dir.path(), stream), expected[idx]);
    }
}

#[tokio::test]
async fn shutdown_with_empty_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::build(config(dir.path()), Arc::new(NoopUploader))
        .await
        .unwrap();
    let running = service.start(None);
    let buffer = running.buffer().clone();

    running.shutdown().await;

    assert_eq!(buffer.len(), 0);
    assert!(names(dir.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_leftovers_are_resumed_and_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let p = dir.path();

    std::fs::write(p.join("s_20240501120000000000.log"), "a\nb\n").unwrap();
    let completed = [
        ("s_20240501090000000000.log.done", "one\n"),
        ("s_20240501100000000000.log.done", "two\n"),
        ("t_20240501110000000000.log.done", "three\n"),
    ];
    for (name, body) in completed {
        std::fs::write(p.join(name), body).unwrap();
    }

    let mut cfg = config(p);
    cfg.rotate.cycle_secs = 100 * 365 * 24 * 3600;
    let service = Service::build(cfg, Arc::new(DirUploader::new(remote.path())))
        .await
        .unwrap();
    assert_eq!(service.reload_report().resumed, 1);
    assert_eq!(service.reload_report().completed, 3);

    let running = service.start(None);
    assert!(
        eventually(|| completed
            .iter()
            .all(|(name, _)| p.join(format!("{name}.uploaded")).exists()))
        .await
    );
    for (name, body) in completed {
        assert_eq!(std::fs::read_to_string(remote.path().join(name)).unwrap(), body);
    }

    let (record, ack) = Record::new("s", "c\n").with_ack();
    running.buffer().enqueue(record).await.unwrap();
    ack.await.unwrap().unwrap();
    running.shutdown().await;

    // the resumed file kept its name and gained the new record
    assert_eq!(
        std::fs::read_to_string(p.join("s_20240501120000000000.log.done")).unwrap(),
        "a\nb\nc\n"
    );
    assert_eq!(count_kind(p, FileKind::Open), 0);
}

/// Fails the first `failures` uploads.
struct Flaky {
    failures: Mutex<usize>,
    uploaded: Mutex<Vec<String>>,
}

#[async_trait]
impl Uploader for Flaky {
    async fn upload(&self, file: &CompletedFile) -> Result<(), UploadError> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(UploadError::Transport("503 from target".into()));
        }
        self.uploaded.lock().unwrap().push(file.name.clone());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_uploads_are_retried_on_later_scans() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("s_20240501100000000000.log.done"), "x\n").unwrap();
    let flaky = Arc::new(Flaky {
        failures: Mutex::new(1),
        uploaded: Mutex::new(Vec::new()),
    });

    let service = Service::build(config(dir.path()), Arc::clone(&flaky) as Arc<dyn Uploader>)
        .await
        .unwrap();
    let running = service.start(None);

    assert!(eventually(|| !flaky.uploaded.lock().unwrap().is_empty()).await);
    assert_eq!(*flaky.failures.lock().unwrap(), 0);
    running.shutdown().await;
    assert!(dir
        .path()
        .join("s_20240501100000000000.log.done.uploaded")
        .exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_files_are_released_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.history.recoup_interval_secs = 3600;
    cfg.delay_rotate.enable = true;
    cfg.delay_rotate.min_delay_secs = 60;
    cfg.delay_rotate.max_delay_secs = 60;

    let service = Service::build(cfg, Arc::new(NoopUploader)).await.unwrap();
    let running = service.start(None);
    let manager = Arc::clone(running.manager());

    for part in ["p1\n", "p2\n"] {
        manager.write("s", part.as_bytes()).await.unwrap();
        manager.rotate("s").await.unwrap();
    }
    assert_eq!(count_kind(dir.path(), FileKind::Deferred), 2);
    assert_eq!(running.delay().unwrap().pending().len(), 1);

    running.shutdown().await;

    assert_eq!(count_kind(dir.path(), FileKind::Deferred), 0);
    let done = names(dir.path());
    assert_eq!(done.len(), 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join(&done[0])).unwrap(),
        "p1\np2\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rotation_failure_stops_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("spool");
    let mut cfg = config(&log_dir);
    cfg.history.recoup_interval_secs = 3600;

    let service = Service::build(cfg, Arc::new(NoopUploader)).await.unwrap();
    let mut running = service.start(None);
    let manager = Arc::clone(running.manager());

    manager.write("s", b"x\n").await.unwrap();
    std::fs::remove_dir_all(&log_dir).unwrap();
    assert!(manager.rotate("s").await.unwrap_err().is_fatal());

    let cause = tokio::time::timeout(Duration::from_secs(5), running.wait_for_exit())
        .await
        .unwrap();
    assert_eq!(cause, ExitCause::Fatal);
    assert_eq!(cause.exit_code(), 2);
    running.shutdown().await;
}
