use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use klite::client::ClientTls;
use klite::runtime::{hostname, Agent, DockerRuntime};
use klite::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The klite node agent: registers this host and keeps its pods running.
#[derive(Parser)]
#[command(name = "klite-kubelet")]
struct Args {
    /// Name of this node; defaults to the hostname.
    #[arg(long)]
    node_name: Option<String>,

    /// URL of the API server.
    #[arg(long, default_value = "http://localhost:8080")]
    api_url: String,

    /// Path to the client certificate.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to the client key.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Path to the CA certificate.
    #[arg(long)]
    tls_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "klite=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let node_name = args.node_name.unwrap_or_else(hostname);

    let tls = ClientTls::from_flags(args.tls_cert, args.tls_key, args.tls_ca);
    let client = Client::new(&args.api_url, tls.as_ref())?;
    let runtime = DockerRuntime::connect().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let mut agent = Agent::new(&node_name, client, runtime);
    agent.run(shutdown).await?;
    tracing::info!("kubelet stopped");
    Ok(())
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
    tracing::info!("shutting down kubelet");
    shutdown.cancel();
}
