use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::Client;
use crate::models::{
    Container, ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus,
    Node, NodeCondition, Pod,
};

use super::{container_name, ContainerInfo, ContainerRuntime, Prober};

const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// The node agent: registers its Node, then repeatedly reconciles the pods
/// bound to it against the container runtime and reports status back.
pub struct Agent<R> {
    node_name: String,
    client: Client,
    runtime: R,
    prober: Prober,
    /// Containers restarted by this agent, keyed by runtime container name.
    /// Survives the stop+start cycle that loses the container itself.
    restart_counts: HashMap<String, i32>,
}

impl<R: ContainerRuntime> Agent<R> {
    pub fn new(node_name: &str, client: Client, runtime: R) -> Self {
        Self {
            node_name: node_name.to_string(),
            client,
            runtime,
            prober: Prober::new(),
            restart_counts: HashMap::new(),
        }
    }

    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!("starting node agent on {}", self.node_name);
        self.register_node().await?;

        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = self.sync_once().await {
                        error!("sync failed: {err}");
                    }
                }
            }
        }
    }

    /// Advertise this host as a Ready node. A conflict means we are
    /// rejoining after a restart, which is fine.
    pub async fn register_node(&self) -> Result<()> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .to_string();

        let mut node = Node::default();
        node.type_meta = crate::models::TypeMeta::new("Node", "v1");
        node.metadata.name = self.node_name.clone();
        node.metadata.labels.insert(
            "kubernetes.io/hostname".to_string(),
            self.node_name.clone(),
        );
        node.status.capacity.insert("cpu".to_string(), cpus.clone());
        node.status.allocatable.insert("cpu".to_string(), cpus);
        node.status.conditions.push(NodeCondition {
            r#type: "Ready".to_string(),
            status: "True".to_string(),
            last_heartbeat_time: Some(Utc::now()),
        });

        info!("registering node {}", self.node_name);
        self.client.register_node(&node).await?;
        Ok(())
    }

    /// One desired-vs-actual pass: start what is missing, restart what
    /// died or fails its liveness probe, remove what is no longer ours,
    /// then publish pod status.
    pub async fn sync_once(&mut self) -> Result<()> {
        let pods = self.client.list_pods().await?;
        let mine: Vec<Pod> = pods
            .into_iter()
            .filter(|p| p.spec.node_name == self.node_name)
            .collect();

        let containers = self.runtime.list_containers().await?;
        let mut by_pod: HashMap<String, Vec<ContainerInfo>> = HashMap::new();
        for container in containers {
            by_pod
                .entry(container.pod_name.clone())
                .or_default()
                .push(container);
        }

        for pod in &mine {
            let running = by_pod.remove(&pod.metadata.name).unwrap_or_default();
            self.reconcile_pod(pod, &running).await;
        }

        // Whatever is left belongs to pods no longer bound here.
        for (pod_name, leftovers) in by_pod {
            info!(
                "pod {pod_name} no longer assigned, cleaning up {} containers",
                leftovers.len()
            );
            for container in leftovers {
                if let Err(err) = self.runtime.stop_container(&container.id, 0).await {
                    warn!("failed to remove container {}: {err}", container.name);
                }
            }
        }

        Ok(())
    }

    async fn reconcile_pod(&mut self, pod: &Pod, running: &[ContainerInfo]) {
        let mut pod_ip = pod.status.pod_ip.clone();
        let mut statuses = Vec::with_capacity(pod.spec.containers.len());

        for spec_container in &pod.spec.containers {
            let expected = container_name(&pod.metadata.name, &spec_container.name);
            let found = running.iter().find(|c| c.name == expected);

            let healthy = match found {
                None => {
                    info!(
                        "starting container {} for pod {}",
                        spec_container.name, pod.metadata.name
                    );
                    match self.runtime.run_container(pod, spec_container).await {
                        Ok(_) => false,
                        Err(err) => {
                            error!("failed to run container {expected}: {err}");
                            false
                        }
                    }
                }
                Some(actual) if actual.state != "running" => {
                    info!("container {expected} exited, restarting");
                    self.restart_container(pod, spec_container, &actual.id, 0)
                        .await;
                    false
                }
                Some(actual) => {
                    match self.runtime.container_ip(&actual.id).await {
                        Ok(ip) if !ip.is_empty() => pod_ip = ip,
                        Ok(_) => {}
                        Err(err) => warn!("failed to read IP of {expected}: {err}"),
                    }

                    if let Some(probe) = &spec_container.liveness_probe {
                        let mut probed = pod.clone();
                        probed.status.pod_ip = pod_ip.clone();
                        match self.prober.probe(&probed, spec_container, probe).await {
                            Ok(true) => true,
                            Ok(false) => {
                                warn!("liveness probe failed for {expected}, restarting");
                                self.restart_container(pod, spec_container, &actual.id, 1)
                                    .await;
                                false
                            }
                            Err(err) => {
                                warn!("probe error for {expected}: {err}");
                                true
                            }
                        }
                    } else {
                        true
                    }
                }
            };

            statuses.push(self.container_status(spec_container, &expected, found, healthy));
        }

        let phase = if running.iter().any(|c| c.state == "running") {
            "Running"
        } else {
            "Pending"
        };

        let changed = pod.status.phase != phase
            || pod.status.pod_ip != pod_ip
            || pod.status.container_statuses != statuses;
        if changed {
            let mut updated = pod.clone();
            updated.status.phase = phase.to_string();
            updated.status.pod_ip = pod_ip;
            updated.status.container_statuses = statuses;
            match self.client.update_pod(&updated).await {
                Ok(()) => info!("updated pod {} status to {phase}", pod.metadata.name),
                Err(err) => warn!(
                    "failed to update status of pod {}: {err}",
                    pod.metadata.name
                ),
            }
        }
    }

    async fn restart_container(
        &mut self,
        pod: &Pod,
        spec_container: &Container,
        container_id: &str,
        stop_timeout: i64,
    ) {
        if let Err(err) = self.runtime.stop_container(container_id, stop_timeout).await {
            warn!("failed to stop container {container_id}: {err}");
        }
        match self.runtime.run_container(pod, spec_container).await {
            Ok(_) => {
                let name = container_name(&pod.metadata.name, &spec_container.name);
                *self.restart_counts.entry(name).or_insert(0) += 1;
            }
            Err(err) => error!(
                "failed to restart container {} for pod {}: {err}",
                spec_container.name, pod.metadata.name
            ),
        }
    }

    fn container_status(
        &self,
        spec_container: &Container,
        runtime_name: &str,
        found: Option<&ContainerInfo>,
        healthy: bool,
    ) -> ContainerStatus {
        let running = found.is_some_and(|c| c.state == "running");
        let state = if running && healthy {
            ContainerState {
                running: Some(ContainerStateRunning { started_at: None }),
                ..Default::default()
            }
        } else {
            ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: "ContainerCreating".to_string(),
                }),
                ..Default::default()
            }
        };

        ContainerStatus {
            name: spec_container.name.clone(),
            state,
            ready: running && healthy,
            restart_count: self
                .restart_counts
                .get(runtime_name)
                .copied()
                .unwrap_or(0),
            image: spec_container.image.clone(),
            container_id: found
                .map(|c| format!("docker://{}", c.id))
                .unwrap_or_default(),
        }
    }
}
