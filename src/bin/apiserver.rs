use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use klite::api::{self, TlsPaths};
use klite::Registry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The klite API server: the registry and its HTTP resource surface.
#[derive(Parser)]
#[command(name = "klite-apiserver")]
struct Args {
    /// Path to the data file for persistence; empty disables persistence.
    #[arg(long, default_value = "klite.db")]
    data_file: PathBuf,

    /// Path to the server certificate.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to the server key.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Path to the CA certificate used to verify clients.
    #[arg(long)]
    tls_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "klite=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("starting klite API server");

    let registry = if args.data_file.as_os_str().is_empty() {
        Arc::new(Registry::ephemeral())
    } else {
        Arc::new(Registry::open(args.data_file).await)
    };

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080u16);

    let tls_paths = match (args.tls_cert, args.tls_key, args.tls_ca) {
        (Some(cert), Some(key), Some(ca)) => Some(TlsPaths { cert, key, ca }),
        _ => None,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    api::serve(registry, port, tls_paths, shutdown).await
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("shutting down");
    shutdown.cancel();
}
