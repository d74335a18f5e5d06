use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use milli_serve::config::{WorkerConfig, load_config, validate};
use milli_serve::service::Services;

fn main() -> ExitCode {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("milli-serve: {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => WorkerConfig::default(),
    };

    // RUST_LOG wins over the configured level.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    if let Err(errors) = validate(&config) {
        for error in &errors {
            tracing::error!(%error, "invalid configuration");
        }
        return ExitCode::FAILURE;
    }

    tracing::info!(
        listen = ?config.listen,
        quic = ?config.quic_listen,
        workers = config.worker_count(),
        root = %config.root_dir.display(),
        "milli-serve starting"
    );
    let services = Services::static_files(&config.root_dir);
    match milli_serve::server::run(Arc::new(config), services) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
