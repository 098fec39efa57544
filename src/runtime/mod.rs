pub mod agent;
pub mod prober;

pub use agent::Agent;
pub use prober::Prober;

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::info;

use crate::models::{Container, Pod};

/// Containers we own are named `k8s-lite-<pod>-<container>` and labelled
/// with the pod coordinates so they can be rediscovered after a restart.
pub const CONTAINER_NAME_PREFIX: &str = "k8s-lite";
pub const POD_NAME_LABEL: &str = "k8s.pod.name";
pub const POD_NAMESPACE_LABEL: &str = "k8s.pod.namespace";

pub fn container_name(pod_name: &str, container: &str) -> String {
    format!("{CONTAINER_NAME_PREFIX}-{pod_name}-{container}")
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// running, exited, ...
    pub state: String,
    pub pod_name: String,
    pub pod_namespace: String,
}

/// The container engine the agent drives. Everything else treats it as an
/// external collaborator.
pub trait ContainerRuntime {
    /// Start a detached container for the given spec; returns the runtime id.
    fn run_container(
        &self,
        pod: &Pod,
        container: &Container,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Stop the container, then remove it.
    fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: i64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// All containers carrying a pod-name label, whatever their state.
    fn list_containers(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ContainerInfo>>> + Send;

    /// The container's IP on its network, or an empty string.
    fn container_ip(
        &self,
        container_id: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// Docker implementation over the local daemon socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        info!("connected to Docker daemon");
        Ok(Self { docker })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (image_name, tag) = match image.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (image, "latest"),
        };

        let options = CreateImageOptions {
            from_image: image_name,
            tag,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|err| anyhow!("failed to pull image {image}: {err}"))?;
        }
        Ok(())
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn run_container(&self, pod: &Pod, container: &Container) -> Result<String> {
        let name = container_name(&pod.metadata.name, &container.name);

        self.pull_image(&container.image).await?;

        let mut cmd = container.command.clone();
        cmd.extend(container.args.iter().cloned());

        let config = Config {
            image: Some(container.image.clone()),
            hostname: Some(pod.metadata.name.clone()),
            cmd: if cmd.is_empty() { None } else { Some(cmd) },
            labels: Some(HashMap::from([
                (POD_NAME_LABEL.to_string(), pod.metadata.name.clone()),
                (
                    POD_NAMESPACE_LABEL.to_string(),
                    pod.metadata.namespace_or_default().to_string(),
                ),
            ])),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        };

        info!("creating container {name} with image {}", container.image);
        let created = self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(created.id)
    }

    async fn stop_container(&self, container_id: &str, timeout_seconds: i64) -> Result<()> {
        let options = (timeout_seconds > 0).then_some(StopContainerOptions { t: timeout_seconds });
        // Already-stopped containers still need the remove.
        let _ = self.docker.stop_container(container_id, options).await;
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let filters = HashMap::from([("label".to_string(), vec![POD_NAME_LABEL.to_string()])]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let containers = summaries
            .into_iter()
            .filter_map(|c| {
                let labels = c.labels.unwrap_or_default();
                let pod_name = labels.get(POD_NAME_LABEL)?.clone();
                Some(ContainerInfo {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                    pod_name,
                    pod_namespace: labels.get(POD_NAMESPACE_LABEL).cloned().unwrap_or_default(),
                })
            })
            .collect();
        Ok(containers)
    }

    async fn container_ip(&self, container_id: &str) -> Result<String> {
        let details = self.docker.inspect_container(container_id, None).await?;
        let ip = details
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .find_map(|endpoint| endpoint.ip_address.filter(|ip| !ip.is_empty()))
            })
            .unwrap_or_default();
        Ok(ip)
    }
}

/// Best-effort host name, used for node registration and leader identity.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}
