use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::client::Client;
use crate::models::{selector_matches, Pod, ReplicaSet, ReplicaSetStatus, TypeMeta};

const TICK: Duration = Duration::from_secs(5);

/// Keeps the number of pods matching each ReplicaSet's selector equal to
/// its declared replica count.
pub struct ReplicaSetController {
    client: Client,
}

impl ReplicaSetController {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("starting replicaset controller");
        let mut ticker = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        error!("replicaset reconcile failed: {err}");
                    }
                }
            }
        }
    }

    /// One pass over every ReplicaSet. Pods are listed once and filtered in
    /// memory.
    pub async fn reconcile(&self) -> Result<(), crate::client::ClientError> {
        let replica_sets = self.client.list_replica_sets().await?;
        let pods = self.client.list_pods().await?;

        for rs in &replica_sets {
            self.reconcile_replica_set(rs, &pods).await;
        }
        Ok(())
    }

    async fn reconcile_replica_set(&self, rs: &ReplicaSet, all_pods: &[Pod]) {
        let desired = rs.spec.replicas.unwrap_or(0);

        let mut owned: Vec<&Pod> = all_pods
            .iter()
            .filter(|p| selector_matches(&rs.spec.selector.match_labels, &p.metadata.labels))
            .collect();
        let current = owned.len() as i32;

        if current < desired {
            let diff = desired - current;
            info!("scaling up {} by {diff}", rs.metadata.name);
            for _ in 0..diff {
                let pod = pod_from_template(rs);
                if let Err(err) = self.client.create_pod(&pod).await {
                    error!(
                        "failed to create pod for replicaset {}: {err}",
                        rs.metadata.name
                    );
                }
            }
        } else if current > desired {
            let diff = (current - desired) as usize;
            info!("scaling down {} by {diff}", rs.metadata.name);
            sort_for_scale_down(&mut owned);
            for pod in owned.iter().take(diff) {
                if let Err(err) = self.client.delete_pod(&pod.metadata.name).await {
                    error!("failed to delete pod {}: {err}", pod.metadata.name);
                }
            }
        }

        let ready = owned
            .iter()
            .filter(|p| p.status.phase == "Running")
            .count() as i32;
        let status = ReplicaSetStatus {
            replicas: current,
            fully_labeled_replicas: current,
            ready_replicas: ready,
            available_replicas: ready,
        };
        if rs.status != status {
            let mut updated = rs.clone();
            updated.status = status;
            if let Err(err) = self.client.update_replica_set(&updated).await {
                error!(
                    "failed to update status of replicaset {}: {err}",
                    rs.metadata.name
                );
            }
        }
    }
}

/// Victims for scale-down: Pending pods first, then the oldest.
fn sort_for_scale_down(pods: &mut [&Pod]) {
    pods.sort_by(|a, b| {
        let a_pending = a.status.phase != "Running";
        let b_pending = b.status.phase != "Running";
        b_pending
            .cmp(&a_pending)
            .then(a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp))
            .then(a.metadata.name.cmp(&b.metadata.name))
    });
}

fn pod_from_template(rs: &ReplicaSet) -> Pod {
    let template = &rs.spec.template;
    let suffix = Uuid::new_v4().simple().to_string();
    Pod {
        type_meta: TypeMeta::new("Pod", "v1"),
        metadata: crate::models::ObjectMeta {
            name: format!("{}-{}", rs.metadata.name, &suffix[..5]),
            namespace: rs.metadata.namespace_or_default().to_string(),
            labels: template.metadata.labels.clone(),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: Default::default(),
    }
}
