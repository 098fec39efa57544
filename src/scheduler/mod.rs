use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::Client;
use crate::models::{Node, Pod};

const TICK: Duration = Duration::from_secs(3);

/// Binds unscheduled pods to Ready nodes with enough allocatable CPU.
pub struct Scheduler {
    client: Client,
}

impl Scheduler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("starting scheduler");
        let mut ticker = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.schedule_once().await {
                        warn!("scheduling round failed: {err}");
                    }
                }
            }
        }
    }

    /// One full pass over the unscheduled pods. Pods that cannot be placed
    /// (or whose bind loses a write race) are retried next tick.
    pub async fn schedule_once(&self) -> Result<(), crate::client::ClientError> {
        let pods = self.client.list_pods().await?;
        let unscheduled: Vec<&Pod> = pods
            .iter()
            .filter(|p| p.spec.node_name.is_empty())
            .collect();
        if unscheduled.is_empty() {
            return Ok(());
        }

        let nodes = self.client.list_nodes().await?;
        if nodes.is_empty() {
            info!("no nodes available for scheduling");
            return Ok(());
        }

        for pod in unscheduled {
            let Some(node) = select_node(pod, &nodes) else {
                info!("no feasible node for pod {}", pod.metadata.name);
                continue;
            };

            let mut bound = pod.clone();
            bound.spec.node_name = node.to_string();
            match self.client.update_pod(&bound).await {
                Ok(()) => info!("scheduled {} to {node}", pod.metadata.name),
                Err(err) => warn!("failed to bind {} to {node}: {err}", pod.metadata.name),
            }
        }
        Ok(())
    }
}

/// Filter by the required predicates, then pick uniformly at random among
/// the feasible nodes.
fn select_node<'a>(pod: &Pod, nodes: &'a [Node]) -> Option<&'a str> {
    let feasible: Vec<&Node> = nodes.iter().filter(|n| pod_fits(pod, n)).collect();
    if feasible.is_empty() {
        return None;
    }
    let pick = rand::rng().random_range(0..feasible.len());
    Some(&feasible[pick].metadata.name)
}

fn pod_fits(pod: &Pod, node: &Node) -> bool {
    if !node.is_ready() {
        return false;
    }
    pod_cpu_request_millis(pod) <= node_allocatable_cpu_millis(node)
}

/// Total CPU requested by the pod, summed across containers.
fn pod_cpu_request_millis(pod: &Pod) -> i64 {
    pod.spec
        .containers
        .iter()
        .filter_map(|c| c.resources.requests.get("cpu"))
        .map(|q| parse_cpu_millis(q))
        .sum()
}

fn node_allocatable_cpu_millis(node: &Node) -> i64 {
    let quantity = node
        .status
        .allocatable
        .get("cpu")
        .or_else(|| node.status.capacity.get("cpu"))
        .map(String::as_str)
        .unwrap_or("");
    parse_cpu_millis(quantity)
}

/// CPU quantities are either a decimal core count (`"2"`, `"0.5"`) or
/// millicores with an `m` suffix (`"250m"`). Empty means zero.
pub fn parse_cpu_millis(quantity: &str) -> i64 {
    if quantity.is_empty() {
        return 0;
    }
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse::<i64>().unwrap_or(0);
    }
    quantity
        .parse::<f64>()
        .map(|cores| (cores * 1000.0) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Container, NodeCondition, ResourceRequirements};

    fn node(name: &str, ready: bool, cpu: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = name.to_string();
        node.status.conditions.push(NodeCondition {
            r#type: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            last_heartbeat_time: None,
        });
        if !cpu.is_empty() {
            node.status
                .capacity
                .insert("cpu".to_string(), cpu.to_string());
        }
        node
    }

    fn pod_requesting(cpus: &[&str]) -> Pod {
        let mut pod = Pod::new("p");
        for (i, cpu) in cpus.iter().enumerate() {
            let mut requests = std::collections::BTreeMap::new();
            requests.insert("cpu".to_string(), cpu.to_string());
            pod.spec.containers.push(Container {
                name: format!("c{i}"),
                image: "busybox".to_string(),
                resources: ResourceRequirements {
                    requests,
                    ..Default::default()
                },
                ..Default::default()
            });
        }
        pod
    }

    #[test]
    fn parses_cpu_quantities() {
        assert_eq!(parse_cpu_millis(""), 0);
        assert_eq!(parse_cpu_millis("250m"), 250);
        assert_eq!(parse_cpu_millis("2"), 2000);
        assert_eq!(parse_cpu_millis("0.5"), 500);
        assert_eq!(parse_cpu_millis("garbage"), 0);
    }

    #[test]
    fn sums_requests_across_containers() {
        assert_eq!(pod_cpu_request_millis(&pod_requesting(&["250m", "0.5"])), 750);
        assert_eq!(pod_cpu_request_millis(&pod_requesting(&[])), 0);
    }

    #[test]
    fn not_ready_nodes_are_filtered() {
        let nodes = vec![node("a", false, "4")];
        assert!(select_node(&pod_requesting(&[]), &nodes).is_none());
    }

    #[test]
    fn cpu_predicate_rejects_oversized_pods() {
        let nodes = vec![node("small", true, "1"), node("big", true, "4")];
        let pod = pod_requesting(&["2"]);
        assert_eq!(select_node(&pod, &nodes), Some("big"));
    }

    #[test]
    fn any_feasible_node_may_win() {
        let nodes = vec![node("a", true, "2"), node("b", true, "2")];
        let choice = select_node(&pod_requesting(&["100m"]), &nodes).unwrap();
        assert!(choice == "a" || choice == "b");
    }

    #[test]
    fn no_capacity_means_no_fit_for_requesting_pods() {
        // A node that never reported CPU cannot satisfy a non-zero request.
        let nodes = vec![node("bare", true, "")];
        assert!(select_node(&pod_requesting(&["100m"]), &nodes).is_none());
        assert!(select_node(&pod_requesting(&[]), &nodes).is_some());
    }
}
