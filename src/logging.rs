use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop; hold it until the process exits.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(
        rotation(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    // JSON goes to the file only; text also mirrors to stdout
    if config.use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(file_writer)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(file_writer).with_ansi(false))
            .with(fmt::layer().with_target(false))
            .init();
    }

    guard
}

fn rotation(name: &str) -> Rotation {
    match name {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// HTTP and SQL client chatter is muted unless tracing is on
fn filter_directives(config: &AppConfig) -> String {
    if config.enable_tracing {
        config.log_level.clone()
    } else {
        format!("{},sqlx=warn,reqwest=warn,hyper=warn", config.log_level)
    }
}
