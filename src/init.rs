use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::Config;

/// Filter directives for the configured level, with chatty HTTP internals
/// turned down.
pub fn filter_directives(level: &str) -> String {
    format!("hyper=warn,h2=warn,reqwest=warn,rustls=off,{level}")
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when it is set and parses; a
/// level string that does not parse falls back to `info`.
pub fn init_tracing(config: &Config) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(&config.log_level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_ansi(config.log_ansi)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_parse() {
        for level in ["info", "debug", "binlog_spool=trace"] {
            EnvFilter::try_new(filter_directives(level)).unwrap();
        }
    }
}
