//! Tracing setup: stderr plus an optional daily-rotated file.

use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use edgeom_config::LogConfig;

/// Install the global subscriber. `RUST_LOG` wins over `-v`, which wins
/// over `baseline`.
///
/// The returned guard flushes the file writer; keep it alive until exit.
pub fn init(verbosity: u8, baseline: &str, log: &LogConfig) -> Option<WorkerGuard> {
    let directive = match verbosity {
        0 => baseline,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let json = log
        .json
        .then(|| fmt::layer().json().with_writer(io::stderr));
    let plain = (!log.json).then(|| fmt::layer().with_target(false).with_writer(io::stderr));

    let (file, guard) = match &log.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &log.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .with(file)
        .init();
    guard
}
