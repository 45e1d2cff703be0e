//! Gateway binary: env bootstrap, tracing, serve loop.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use trellis::GatewayConfig;

fn init_tracing(config: &GatewayConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.debug { "debug" } else { "info" })
    });
    let stdout = tracing_subscriber::fmt::layer();

    if config.debug {
        // Debug runs also log to a file under the data root.
        let _ = std::fs::create_dir_all(&config.data_root);
        let appender = tracing_appender::rolling::never(&config.data_root, "trellis-debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout)
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(stdout).init();
        None
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();
    let config = GatewayConfig::from_env();
    let _log_guard = init_tracing(&config);

    let pipeline = match serve::build_pipeline(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = serve::run(pipeline).await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
