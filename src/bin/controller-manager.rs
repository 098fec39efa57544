use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use klite::client::ClientTls;
use klite::controllers::{DeploymentController, EndpointsController, ReplicaSetController};
use klite::election::{LeaderElectionConfig, LeaderElector};
use klite::runtime::hostname;
use klite::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOCK_NAME: &str = "klite-controller-manager";

/// The klite controller manager: ReplicaSet, Deployment and Endpoints
/// reconcilers, optionally behind leader election.
#[derive(Parser)]
#[command(name = "klite-controller-manager")]
struct Args {
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

    /// Coordinate with other replicas through a Lease so only one
    /// reconciles at a time.
    #[arg(long)]
    leader_elect: bool,
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
    let tls = ClientTls::from_flags(args.tls_cert, args.tls_key, args.tls_ca);
    let client = Client::new(&args.api_url, tls.as_ref())?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    if args.leader_elect {
        let identity = format!("{}-{}", hostname(), std::process::id());
        let elector = LeaderElector::new(
            client.clone(),
            LeaderElectionConfig::new(LOCK_NAME, &identity),
        );
        let controllers_client = client.clone();
        elector
            .run(shutdown, move |leading| {
                run_controllers(controllers_client.clone(), leading)
            })
            .await;
    } else {
        run_controllers(client, shutdown).await;
    }

    tracing::info!("controller manager stopped");
    Ok(())
}

async fn run_controllers(client: Client, token: CancellationToken) {
    let replica_sets = ReplicaSetController::new(client.clone());
    let deployments = DeploymentController::new(client.clone());
    let endpoints = EndpointsController::new(client);

    tracing::info!("controllers started");
    tokio::join!(
        replica_sets.run(token.clone()),
        deployments.run(token.clone()),
        endpoints.run(token),
    );
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
    tracing::info!("shutting down controller manager");
    shutdown.cancel();
}
