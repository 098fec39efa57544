// Shared helpers: every test gets its own in-process API server over a
// fresh ephemeral registry, bound to an OS-assigned port.

use std::sync::Arc;

use klite::api::build_router;
use klite::{Client, Registry};

#[allow(dead_code)]
pub async fn spawn_server() -> String {
    let registry = Arc::new(Registry::ephemeral());
    let app = build_router(registry);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[allow(dead_code)]
pub async fn spawn_server_with_client() -> (String, Client) {
    let base_url = spawn_server().await;
    let client = Client::new(&base_url, None).unwrap();
    (base_url, client)
}
