//! Logging initialization

use anyhow::Result;
use std::path::Path;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetryConfig;

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

/// Install the global subscriber.
///
/// With `log_file` set, a daily-rolling plain-text copy is written as well;
/// the returned guard must live as long as the process to flush it.
pub fn init_logging(config: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let (subscriber, guard) = build_subscriber(config)?;
    subscriber.init();
    Ok(guard)
}

/// The file layer sits directly on the filter so both output formats stack
/// it on the same subscriber type.
fn build_subscriber(config: &TelemetryConfig) -> Result<(BoxedSubscriber, Option<WorkerGuard>)> {
    let log_level = parse_log_level(&config.log_level);

    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy()
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let (file_layer, guard) = match config.log_file.as_deref().map(Path::new) {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "options-pilot.log".to_string());

            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber: BoxedSubscriber = if config.json_logs {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(fmt_layer),
        )
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact();

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(fmt_layer),
        )
    };

    Ok((subscriber, guard))
}

fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
