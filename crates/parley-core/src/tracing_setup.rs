use std::fs::OpenOptions;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize tracing for an embedding application.
///
/// Filtering follows `RUST_LOG` (default `info`). When `PARLEY_LOG_FILE` is
/// set, a debug-level layer additionally appends to that file, which is the
/// practical way to debug subscription churn without a terminal attached.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(
        fmt::layer()
            .with_target(true)
            .with_filter(env_filter),
    );

    if let Ok(log_path) = std::env::var("PARLEY_LOG_FILE") {
        match OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(file) => {
                let file_layer = fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);
                registry.with(file_layer).init();
                eprintln!("File logging enabled: {log_path}");
            }
            Err(err) => {
                registry.init();
                tracing::warn!(path = %log_path, error = %err, "could not open log file");
            }
        }
    } else {
        registry.init();
    }
}
