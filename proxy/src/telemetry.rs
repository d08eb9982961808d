use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. Logs go to a daily rolling file when
/// `log_dir` is set and to stdout otherwise. `RUST_LOG` takes precedence over
/// `log_level`.
///
/// The returned guard must be held for the life of the process or buffered
/// file output is lost.
pub fn init_tracing(
    log_dir: Option<&str>,
    log_file: &str,
    log_level: &str,
    console_port: Option<u16>,
) -> Option<WorkerGuard> {
    #[cfg(feature = "console")]
    let console_layer = console_port.map(|port| {
        console_subscriber::ConsoleLayer::builder()
            .server_addr((std::net::Ipv4Addr::LOCALHOST, port))
            .spawn()
    });

    #[cfg(not(feature = "console"))]
    if console_port.is_some() {
        eprintln!(
            "console_port is configured but proxy is not built with --features console; tokio-console is disabled"
        );
    }

    let (file_layer, guard) = match log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_file);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = log_dir.is_none().then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
    });

    let registry = tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(file_layer)
        .with(stdout_layer);

    #[cfg(feature = "console")]
    let registry = registry.with(console_layer);

    registry.init();
    guard
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}
