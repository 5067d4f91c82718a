//! Tracing initialization.

use tracing_subscriber::{fmt, EnvFilter};

use crate::domain::models::config::LoggingConfig;

/// Initialize the global subscriber from config. The optional file
/// target uses a non-blocking appender; the returned guard must stay
/// alive for the process lifetime.
pub fn init(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if let Some(path) = &config.file {
        let path = std::path::Path::new(path);
        let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .map_or_else(|| "vigil.log".into(), |n| n.to_string_lossy().into_owned());
        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        if config.format == "json" {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        } else {
            fmt().with_env_filter(filter).with_writer(writer).init();
        }
        return Some(guard);
    }

    if config.format == "json" {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
    None
}
