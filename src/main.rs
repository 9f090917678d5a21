use std::process::ExitCode;
use std::time::Duration;

use binlog_spool::backend::{make_uploader, parse_target};
use binlog_spool::config::Config;
use binlog_spool::init::init_tracing;
use binlog_spool::service::Service;
use binlog_spool::shutdown::{wait_for_signal, ExitCause};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("binlog-spool: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = init_tracing(&config) {
        eprintln!("binlog-spool: cannot install logger: {e}");
        return ExitCode::from(1);
    }
    info!(pid = std::process::id(), version = env!("CARGO_PKG_VERSION"), "starting");

    if config.use_test {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => info!("effective config:\n{json}"),
            Err(e) => error!("cannot render config: {e}"),
        }
    }

    let uploader = match parse_target(&config.upload.target).and_then(|target| {
        make_uploader(&target, Duration::from_secs(config.upload.timeout_secs))
    }) {
        Ok(uploader) => uploader,
        Err(e) => {
            error!(upload_target = %config.upload.target, "invalid upload target: {e}");
            return ExitCode::from(1);
        }
    };

    let listener = match TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.http_addr, "cannot bind http listener: {e}");
            return ExitCode::from(1);
        }
    };

    let use_test = config.use_test;
    let service = match Service::build(config, uploader).await {
        Ok(service) => service,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };
    if use_test {
        service.manager().dump().await;
    }

    let mut running = service.start(Some(listener));
    let cause = tokio::select! {
        _ = wait_for_signal() => ExitCause::Signal,
        cause = running.wait_for_exit() => cause,
    };
    info!(?cause, "stopping");
    running.shutdown().await;
    ExitCode::from(cause.exit_code())
}
