// src/utils/logging.rs
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// `RUST_LOG` wins over the configured level.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber: stdout always, plus a daily rolling file
/// when a log directory is configured. Keep the returned guard alive for
/// as long as file logging should work.
pub fn init(cfg: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let stdout_layer = fmt::layer().with_target(false).with_filter(filter(&cfg.level));

    match &cfg.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "trade_env.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter(&cfg.level));
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).try_init()?;
            Ok(None)
        }
    }
}
