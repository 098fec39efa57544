use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::models::Endpoints;

const TICK: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

type EndpointsCache = Arc<Mutex<HashMap<String, Endpoints>>>;

/// Publishes every Service nodePort on this host and forwards accepted
/// connections to a random backend from the Service's Endpoints.
pub struct Proxier {
    client: Client,
    listeners: Mutex<HashMap<i32, JoinHandle<()>>>,
    endpoints: EndpointsCache,
}

impl Proxier {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            listeners: Mutex::new(HashMap::new()),
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("starting service proxy");
        let mut ticker = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.close_all();
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sync_once().await {
                        warn!("proxy sync failed: {err}");
                    }
                }
            }
        }
    }

    /// Align open listeners with the declared nodePorts and refresh the
    /// endpoints cache for every exposed service.
    pub async fn sync_once(&self) -> Result<(), crate::client::ClientError> {
        let services = self.client.list_services().await?;

        let mut desired: HashMap<i32, String> = HashMap::new();
        for service in &services {
            for port in &service.spec.ports {
                if port.node_port != 0 {
                    desired.insert(port.node_port, service.metadata.name.clone());
                }
            }
        }

        for service_name in desired.values() {
            if let Ok(Some(endpoints)) = self.client.get_endpoints(service_name).await {
                self.endpoints
                    .lock()
                    .expect("endpoints cache poisoned")
                    .insert(service_name.clone(), endpoints);
            }
        }

        let to_open: Vec<(i32, String)> = {
            let listeners = self.listeners.lock().expect("listener map poisoned");
            desired
                .iter()
                .filter(|(port, _)| !listeners.contains_key(port))
                .map(|(port, name)| (*port, name.clone()))
                .collect()
        };

        for (port, service_name) in to_open {
            match TcpListener::bind(("0.0.0.0", port as u16)).await {
                Ok(listener) => {
                    info!("opening proxy listener for service {service_name} on :{port}");
                    let cache = self.endpoints.clone();
                    let task = tokio::spawn(accept_loop(listener, service_name, cache));
                    self.listeners
                        .lock()
                        .expect("listener map poisoned")
                        .insert(port, task);
                }
                Err(err) => warn!("failed to listen on :{port}: {err}"),
            }
        }

        let mut listeners = self.listeners.lock().expect("listener map poisoned");
        listeners.retain(|port, task| {
            if desired.contains_key(port) {
                return true;
            }
            info!("closing proxy listener on :{port}");
            task.abort();
            false
        });

        Ok(())
    }

    fn close_all(&self) {
        let mut listeners = self.listeners.lock().expect("listener map poisoned");
        for (_, task) in listeners.drain() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, service_name: String, cache: EndpointsCache) {
    loop {
        let Ok((connection, _)) = listener.accept().await else {
            return;
        };
        let service_name = service_name.clone();
        let cache = cache.clone();
        tokio::spawn(handle_connection(connection, service_name, cache));
    }
}

async fn handle_connection(mut inbound: TcpStream, service_name: String, cache: EndpointsCache) {
    let backend = {
        let cache = cache.lock().expect("endpoints cache poisoned");
        cache.get(&service_name).and_then(|ep| {
            let backends = backends(ep);
            if backends.is_empty() {
                None
            } else {
                let pick = rand::rng().random_range(0..backends.len());
                Some(backends[pick].clone())
            }
        })
    };

    let Some(backend) = backend else {
        debug!("no endpoints for {service_name}, closing connection");
        return;
    };

    let mut outbound =
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&backend)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!("dial failed to {backend}: {err}");
                return;
            }
            Err(_) => {
                warn!("dial to {backend} timed out");
                return;
            }
        };

    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
}

/// Candidate backend addresses: every address of the first subset, paired
/// with its first port.
fn backends(endpoints: &Endpoints) -> Vec<String> {
    let Some(subset) = endpoints.subsets.first() else {
        return Vec::new();
    };
    let port = subset.ports.first().map(|p| p.port).unwrap_or(80);
    subset
        .addresses
        .iter()
        .map(|address| format!("{}:{port}", address.ip))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndpointAddress, EndpointPort, EndpointSubset};

    #[test]
    fn backends_pair_every_address_with_the_first_port() {
        let endpoints = Endpoints {
            subsets: vec![EndpointSubset {
                addresses: vec![
                    EndpointAddress {
                        ip: "10.0.0.1".to_string(),
                        node_name: String::new(),
                    },
                    EndpointAddress {
                        ip: "10.0.0.2".to_string(),
                        node_name: String::new(),
                    },
                ],
                ports: vec![
                    EndpointPort {
                        port: 8080,
                        ..Default::default()
                    },
                    EndpointPort {
                        port: 9090,
                        ..Default::default()
                    },
                ],
            }],
            ..Default::default()
        };

        assert_eq!(backends(&endpoints), vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
    }

    #[test]
    fn empty_endpoints_yield_no_backends() {
        assert!(backends(&Endpoints::default()).is_empty());
    }
}
