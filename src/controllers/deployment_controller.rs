use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::Client;
use crate::models::{
    selector_matches, Deployment, DeploymentStatus, ObjectMeta, PodTemplateSpec, ReplicaSet,
    ReplicaSetSpec, TypeMeta,
};

const TICK: Duration = Duration::from_secs(5);

/// Annotation naming the pod-template revision a ReplicaSet was stamped
/// from.
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Manages one ReplicaSet per Deployment revision: the ReplicaSet matching
/// the current template hash is scaled to the declared replica count, all
/// others to zero.
pub struct DeploymentController {
    client: Client,
}

impl DeploymentController {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("starting deployment controller");
        let mut ticker = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        error!("deployment reconcile failed: {err}");
                    }
                }
            }
        }
    }

    pub async fn reconcile(&self) -> Result<(), crate::client::ClientError> {
        let deployments = self.client.list_deployments().await?;
        let replica_sets = self.client.list_replica_sets().await?;

        for deployment in &deployments {
            if let Err(err) = self.sync_deployment(deployment, &replica_sets).await {
                error!(
                    "failed to sync deployment {}: {err}",
                    deployment.metadata.name
                );
            }
        }

        self.scale_down_orphans(&deployments, &replica_sets).await;
        Ok(())
    }

    async fn sync_deployment(
        &self,
        deployment: &Deployment,
        all_rs: &[ReplicaSet],
    ) -> Result<(), crate::client::ClientError> {
        let owned: Vec<&ReplicaSet> = all_rs
            .iter()
            .filter(|rs| {
                selector_matches(
                    &deployment.spec.selector.match_labels,
                    &rs.metadata.labels,
                )
            })
            .collect();

        let hash = template_hash(&deployment.spec.template);
        let desired = deployment.spec.replicas.unwrap_or(1);

        let new_rs_name = match owned
            .iter()
            .find(|rs| rs.metadata.annotations.get(REVISION_ANNOTATION) == Some(&hash))
        {
            Some(new_rs) => {
                if new_rs.spec.replicas != Some(desired) {
                    let mut scaled = (*new_rs).clone();
                    scaled.spec.replicas = Some(desired);
                    info!("scaling replicaset {} to {desired}", scaled.metadata.name);
                    self.client.update_replica_set(&scaled).await?;
                }
                new_rs.metadata.name.clone()
            }
            None => {
                let new_rs = new_replica_set(deployment, &hash, desired);
                info!(
                    "creating replicaset {} for deployment {} (revision {})",
                    new_rs.metadata.name,
                    deployment.metadata.name,
                    &hash[..10]
                );
                self.client.create_replica_set(&new_rs).await?;
                new_rs.metadata.name
            }
        };

        // Every other revision is retired eagerly.
        for rs in &owned {
            if rs.metadata.name != new_rs_name && rs.spec.replicas.unwrap_or(0) > 0 {
                let mut scaled = (*rs).clone();
                scaled.spec.replicas = Some(0);
                info!("scaling down old replicaset {}", scaled.metadata.name);
                if let Err(err) = self.client.update_replica_set(&scaled).await {
                    error!(
                        "failed to scale down replicaset {}: {err}",
                        rs.metadata.name
                    );
                }
            }
        }

        self.update_status(deployment, &owned, &new_rs_name, desired)
            .await;
        Ok(())
    }

    async fn update_status(
        &self,
        deployment: &Deployment,
        owned: &[&ReplicaSet],
        new_rs_name: &str,
        desired: i32,
    ) {
        let replicas: i32 = owned.iter().map(|rs| rs.status.replicas).sum();
        let ready: i32 = owned.iter().map(|rs| rs.status.ready_replicas).sum();
        let updated: i32 = owned
            .iter()
            .find(|rs| rs.metadata.name == new_rs_name)
            .map(|rs| rs.status.replicas)
            .unwrap_or(0);

        let status = DeploymentStatus {
            observed_generation: 0,
            replicas,
            updated_replicas: updated,
            ready_replicas: ready,
            available_replicas: ready,
            unavailable_replicas: (desired - ready).max(0),
        };

        if deployment.status != status {
            let mut changed = deployment.clone();
            changed.status = status;
            if let Err(err) = self.client.update_deployment(&changed).await {
                error!(
                    "failed to update status of deployment {}: {err}",
                    deployment.metadata.name
                );
            }
        }
    }

    /// A revisioned ReplicaSet that no live Deployment selects keeps its
    /// pods running forever unless someone retires it. Scale it to zero;
    /// the object itself is left behind.
    async fn scale_down_orphans(&self, deployments: &[Deployment], all_rs: &[ReplicaSet]) {
        for rs in all_rs {
            if !rs.metadata.annotations.contains_key(REVISION_ANNOTATION) {
                continue;
            }
            if rs.spec.replicas.unwrap_or(0) == 0 {
                continue;
            }
            let adopted = deployments.iter().any(|d| {
                selector_matches(&d.spec.selector.match_labels, &rs.metadata.labels)
            });
            if adopted {
                continue;
            }

            info!("scaling down orphaned replicaset {}", rs.metadata.name);
            let mut scaled = rs.clone();
            scaled.spec.replicas = Some(0);
            if let Err(err) = self.client.update_replica_set(&scaled).await {
                error!(
                    "failed to scale down orphaned replicaset {}: {err}",
                    rs.metadata.name
                );
            }
        }
    }
}

fn new_replica_set(deployment: &Deployment, hash: &str, replicas: i32) -> ReplicaSet {
    ReplicaSet {
        type_meta: TypeMeta::new("ReplicaSet", "apps/v1"),
        metadata: ObjectMeta {
            name: format!("{}-{}", deployment.metadata.name, &hash[..10]),
            namespace: deployment.metadata.namespace_or_default().to_string(),
            labels: deployment.spec.template.metadata.labels.clone(),
            annotations: [(REVISION_ANNOTATION.to_string(), hash.to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        },
        spec: ReplicaSetSpec {
            replicas: Some(replicas),
            selector: deployment.spec.selector.clone(),
            template: deployment.spec.template.clone(),
        },
        status: Default::default(),
    }
}

/// Deterministic revision identifier for a pod template: the template is
/// serialized through `serde_json::Value`, whose maps are ordered, so the
/// digest is independent of the field order of any JSON input it was parsed
/// from.
pub fn template_hash(template: &PodTemplateSpec) -> String {
    let canonical = serde_json::to_value(template)
        .and_then(|v| serde_json::to_vec(&v))
        .unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_json_field_order() {
        let a: PodTemplateSpec = serde_json::from_str(
            r#"{"metadata":{"labels":{"app":"web","tier":"front"}},
                "spec":{"containers":[{"name":"c","image":"nginx:latest"}]}}"#,
        )
        .unwrap();
        let b: PodTemplateSpec = serde_json::from_str(
            r#"{"spec":{"containers":[{"image":"nginx:latest","name":"c"}]},
                "metadata":{"labels":{"tier":"front","app":"web"}}}"#,
        )
        .unwrap();

        assert_eq!(template_hash(&a), template_hash(&b));
    }

    #[test]
    fn hash_distinguishes_templates() {
        let mut a = PodTemplateSpec::default();
        a.metadata.labels.insert("app".to_string(), "web".to_string());
        let mut b = a.clone();
        b.spec.containers.push(crate::models::Container {
            name: "c".to_string(),
            image: "nginx:1.25".to_string(),
            ..Default::default()
        });

        assert_ne!(template_hash(&a), template_hash(&b));
        // 64 hex chars; names truncate the first 10.
        assert_eq!(template_hash(&a).len(), 64);
    }

    #[test]
    fn new_replica_set_inherits_selector_template_and_revision() {
        let mut deployment = Deployment::default();
        deployment.metadata.name = "api".to_string();
        deployment.spec.replicas = Some(3);
        deployment
            .spec
            .selector
            .match_labels
            .insert("app".to_string(), "api".to_string());
        deployment
            .spec
            .template
            .metadata
            .labels
            .insert("app".to_string(), "api".to_string());

        let hash = template_hash(&deployment.spec.template);
        let rs = new_replica_set(&deployment, &hash, 3);

        assert_eq!(rs.metadata.name, format!("api-{}", &hash[..10]));
        assert_eq!(rs.spec.replicas, Some(3));
        assert_eq!(
            rs.metadata.annotations.get(REVISION_ANNOTATION),
            Some(&hash)
        );
        assert_eq!(rs.metadata.labels.get("app").unwrap(), "api");
        assert_eq!(rs.spec.selector, deployment.spec.selector);
    }
}
