use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::Client;
use crate::models::{
    selector_matches, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, IntOrString,
    ObjectMeta, Pod, Service, TypeMeta,
};

const TICK: Duration = Duration::from_secs(5);

/// Derives each Service's Endpoints object from the Running pods its
/// selector matches.
pub struct EndpointsController {
    client: Client,
}

impl EndpointsController {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("starting endpoints controller");
        let mut ticker = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        error!("endpoints reconcile failed: {err}");
                    }
                }
            }
        }
    }

    pub async fn reconcile(&self) -> Result<(), crate::client::ClientError> {
        let services = self.client.list_services().await?;
        let pods = self.client.list_pods().await?;

        for service in &services {
            // Selector-less services manage their endpoints by hand.
            if service.spec.selector.is_empty() {
                continue;
            }
            if let Err(err) = self.reconcile_service(service, &pods).await {
                error!(
                    "failed to reconcile endpoints for {}: {err}",
                    service.metadata.name
                );
            }
        }
        Ok(())
    }

    async fn reconcile_service(
        &self,
        service: &Service,
        pods: &[Pod],
    ) -> Result<(), crate::client::ClientError> {
        let subsets = desired_subsets(service, pods);

        match self.client.get_endpoints(&service.metadata.name).await? {
            None => {
                let endpoints = Endpoints {
                    type_meta: TypeMeta::new("Endpoints", "v1"),
                    metadata: ObjectMeta {
                        name: service.metadata.name.clone(),
                        namespace: service.metadata.namespace_or_default().to_string(),
                        labels: service.metadata.labels.clone(),
                        ..Default::default()
                    },
                    subsets,
                };
                info!("creating endpoints for service {}", service.metadata.name);
                self.client.create_endpoints(&endpoints).await
            }
            Some(mut existing) if existing.subsets != subsets => {
                existing.subsets = subsets;
                info!("updating endpoints for service {}", service.metadata.name);
                self.client.update_endpoints(&existing).await
            }
            Some(_) => Ok(()),
        }
    }
}

/// The single subset a service maps to: matching Running pods with an IP,
/// addresses sorted by IP, one port entry per service port.
pub fn desired_subsets(service: &Service, pods: &[Pod]) -> Vec<EndpointSubset> {
    let namespace = service.metadata.namespace_or_default();

    let mut addresses: Vec<EndpointAddress> = pods
        .iter()
        .filter(|p| p.metadata.namespace_or_default() == namespace)
        .filter(|p| selector_matches(&service.spec.selector, &p.metadata.labels))
        .filter(|p| p.status.phase == "Running" && !p.status.pod_ip.is_empty())
        .map(|p| EndpointAddress {
            ip: p.status.pod_ip.clone(),
            node_name: p.spec.node_name.clone(),
        })
        .collect();
    addresses.sort_by(|a, b| a.ip.cmp(&b.ip));

    if addresses.is_empty() {
        return Vec::new();
    }

    let ports = service
        .spec
        .ports
        .iter()
        .map(|sp| EndpointPort {
            name: sp.name.clone(),
            port: resolve_target_port(sp.target_port.as_ref(), sp.port),
            protocol: if sp.protocol.is_empty() {
                "TCP".to_string()
            } else {
                sp.protocol.clone()
            },
        })
        .collect();

    vec![EndpointSubset { addresses, ports }]
}

/// Integer targetPorts are used directly; a missing, zero or named
/// targetPort falls back to the service port.
fn resolve_target_port(target: Option<&IntOrString>, service_port: i32) -> i32 {
    match target.and_then(IntOrString::int_value) {
        Some(port) if port != 0 => port,
        _ => service_port,
    }
}
