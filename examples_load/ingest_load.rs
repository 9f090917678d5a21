use std::sync::Arc;
use std::time::Instant;

use binlog_spool::config::Config;
use binlog_spool::init::init_tracing;
use binlog_spool::noop_upload::NoopUploader;
use binlog_spool::record::Record;
use binlog_spool::service::Service;

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("binlog-spool-load-{}", std::process::id()));

    let mut config = Config::default();
    config.log_dir = dir.clone();
    config.log_level = "warn".to_string();
    config.log_ansi = false;
    config.rotate.max_size_bytes = 4 * 1024 * 1024;
    config.ingest.buffer_capacity = 50_000;
    init_tracing(&config).ok();

    let service = match Service::build(config, Arc::new(NoopUploader)).await {
        Ok(service) => service,
        Err(e) => {
            eprintln!("cannot start: {e}");
            return;
        }
    };
    let running = service.start(None);
    let buffer = running.buffer().clone();

    let n: u64 = 200_000;
    let streams = ["orders", "users", "payments", "audit"];
    let start = Instant::now();

    for i in 0..n {
        let stream = streams[i as usize % streams.len()];
        let line = format!("{{\"seq\":{i},\"op\":\"insert\",\"table\":\"{stream}\"}}\n");
        if let Err(e) = buffer.enqueue(Record::new(stream, line)).await {
            eprintln!("enqueue failed at {i}: {e}");
            break;
        }
    }
    let queued = start.elapsed();

    running.shutdown().await;
    let total = start.elapsed();

    println!(
        "queued {} records in {:?}, written in {:?} (~{:.0} rec/s) to {}",
        n,
        queued,
        total,
        n as f64 / total.as_secs_f64(),
        dir.display()
    );
    let _ = std::fs::remove_dir_all(&dir);
}
