use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{middleware, routing::get, Extension, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::models::kinds::{GROUP_APPS, GROUP_CORE};
use crate::storage::Registry;

use super::handlers::{self, Group};
use super::metrics;
use super::tls;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

/// Server certificate, key and client CA; all three are required for mTLS.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

pub fn build_router(registry: Arc<Registry>) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/", get(banner))
        .route("/metrics", get(metrics::serve_metrics))
        .nest(GROUP_CORE, resource_routes(GROUP_CORE))
        .nest(GROUP_APPS, resource_routes(GROUP_APPS))
        .layer(middleware::from_fn(metrics::track_http))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The uniform CRUD surface every kind shares. The group extension keeps a
/// kind from being addressed through the other group's prefix.
fn resource_routes(group: &'static str) -> Router<AppState> {
    Router::new()
        .route("/{plural}", get(handlers::list).post(handlers::create))
        .route(
            "/{plural}/{name}",
            get(handlers::get)
                .put(handlers::update)
                .delete(handlers::delete),
        )
        .layer(Extension(Group(group)))
}

async fn banner() -> &'static str {
    "klite API Server"
}

pub async fn serve(
    registry: Arc<Registry>,
    port: u16,
    tls_paths: Option<TlsPaths>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(registry);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    match tls_paths {
        Some(paths) => {
            tracing::info!("listening on {addr} with mTLS");
            let acceptor = tls::build_acceptor(&paths)?;
            tls::serve_tls(listener, acceptor, app, shutdown).await
        }
        None => {
            tracing::info!("listening on {addr} (insecure, development only)");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await?;
            Ok(())
        }
    }
}
