use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::net::TcpStream;

use crate::models::{Container, IntOrString, Pod, Probe};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Executes liveness probes against a pod's IP. A connection failure is a
/// probe failure (`Ok(false)`), not a prober error.
pub struct Prober {
    http: reqwest::Client,
}

impl Prober {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn probe(&self, pod: &Pod, container: &Container, probe: &Probe) -> Result<bool> {
        if let Some(http_get) = &probe.http_get {
            let port = resolve_port(container, &http_get.port)?;
            return self.probe_http(pod, port, &http_get.path).await;
        }
        if let Some(tcp) = &probe.tcp_socket {
            let port = resolve_port(container, &tcp.port)?;
            return self.probe_tcp(pod, port).await;
        }
        // No action configured means the probe trivially passes.
        Ok(true)
    }

    async fn probe_http(&self, pod: &Pod, port: i32, path: &str) -> Result<bool> {
        let host = probe_host(pod);
        let url = format!("http://{host}:{port}{path}");
        match self.http.get(&url).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                Ok((200..400).contains(&code))
            }
            Err(_) => Ok(false),
        }
    }

    async fn probe_tcp(&self, pod: &Pod, port: i32) -> Result<bool> {
        let host = probe_host(pod);
        let address = format!("{host}:{port}");
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => Ok(true),
            _ => Ok(false),
        }
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

fn probe_host(pod: &Pod) -> &str {
    if pod.status.pod_ip.is_empty() {
        "localhost"
    } else {
        &pod.status.pod_ip
    }
}

/// Named ports are looked up against the container's declared ports.
fn resolve_port(container: &Container, port: &IntOrString) -> Result<i32> {
    match port {
        IntOrString::Int(n) => Ok(*n),
        IntOrString::String(name) => container
            .ports
            .iter()
            .find(|p| p.name == *name)
            .map(|p| p.container_port)
            .ok_or_else(|| anyhow!("no container port named {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerPort, HttpGetAction, TcpSocketAction};
    use axum::routing::get;
    use axum::Router;

    async fn serve_probe_target() -> u16 {
        let app = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route(
                "/broken",
                get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "bad") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn pod_at(ip: &str) -> Pod {
        let mut pod = Pod::new("probe-target");
        pod.status.pod_ip = ip.to_string();
        pod
    }

    fn http_probe(port: i32, path: &str) -> Probe {
        Probe {
            http_get: Some(HttpGetAction {
                path: path.to_string(),
                port: IntOrString::Int(port),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn http_probe_passes_on_2xx_and_fails_on_5xx() {
        let port = serve_probe_target().await;
        let prober = Prober::new();
        let pod = pod_at("127.0.0.1");
        let container = Container::default();

        let ok = prober
            .probe(&pod, &container, &http_probe(port as i32, "/healthz"))
            .await
            .unwrap();
        assert!(ok);

        let broken = prober
            .probe(&pod, &container, &http_probe(port as i32, "/broken"))
            .await
            .unwrap();
        assert!(!broken);
    }

    #[tokio::test]
    async fn connection_refused_is_a_probe_failure_not_an_error() {
        let prober = Prober::new();
        let pod = pod_at("127.0.0.1");
        let container = Container::default();

        // Port 1 is essentially never listening.
        let result = prober
            .probe(&pod, &container, &http_probe(1, "/"))
            .await
            .unwrap();
        assert!(!result);

        let tcp = Probe {
            tcp_socket: Some(TcpSocketAction {
                port: IntOrString::Int(1),
            }),
            ..Default::default()
        };
        assert!(!prober.probe(&pod, &container, &tcp).await.unwrap());
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_a_listener() {
        let port = serve_probe_target().await;
        let prober = Prober::new();
        let pod = pod_at("127.0.0.1");
        let tcp = Probe {
            tcp_socket: Some(TcpSocketAction {
                port: IntOrString::Int(port as i32),
            }),
            ..Default::default()
        };
        assert!(prober.probe(&pod, &Container::default(), &tcp).await.unwrap());
    }

    #[tokio::test]
    async fn named_ports_resolve_against_container_ports() {
        let port = serve_probe_target().await;
        let prober = Prober::new();
        let pod = pod_at("127.0.0.1");
        let container = Container {
            ports: vec![ContainerPort {
                name: "health".to_string(),
                container_port: port as i32,
                ..Default::default()
            }],
            ..Default::default()
        };
        let probe = Probe {
            http_get: Some(HttpGetAction {
                path: "/healthz".to_string(),
                port: IntOrString::String("health".to_string()),
            }),
            ..Default::default()
        };

        assert!(prober.probe(&pod, &container, &probe).await.unwrap());

        let unknown = Probe {
            http_get: Some(HttpGetAction {
                path: "/healthz".to_string(),
                port: IntOrString::String("nope".to_string()),
            }),
            ..Default::default()
        };
        assert!(prober.probe(&pod, &container, &unknown).await.is_err());
    }
}
