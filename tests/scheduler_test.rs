mod common;

use klite::models::{Container, Node, NodeCondition, Pod, ResourceRequirements};
use klite::scheduler::Scheduler;

fn ready_node(name: &str, cpu: &str) -> Node {
    let mut node = Node::default();
    node.type_meta = klite::models::TypeMeta::new("Node", "v1");
    node.metadata.name = name.to_string();
    node.status
        .capacity
        .insert("cpu".to_string(), cpu.to_string());
    node.status
        .allocatable
        .insert("cpu".to_string(), cpu.to_string());
    node.status.conditions.push(NodeCondition {
        r#type: "Ready".to_string(),
        status: "True".to_string(),
        last_heartbeat_time: None,
    });
    node
}

fn pod_requesting(name: &str, cpu: &str) -> Pod {
    let mut pod = Pod::new(name);
    let mut container = Container {
        name: "main".to_string(),
        image: "busybox".to_string(),
        ..Default::default()
    };
    if !cpu.is_empty() {
        let mut requests = std::collections::BTreeMap::new();
        requests.insert("cpu".to_string(), cpu.to_string());
        container.resources = ResourceRequirements {
            requests,
            ..Default::default()
        };
    }
    pod.spec.containers.push(container);
    pod
}

#[tokio::test]
async fn unscheduled_pods_are_bound_to_a_feasible_node() {
    let (_url, client) = common::spawn_server_with_client().await;
    client.register_node(&ready_node("node1", "2")).await.unwrap();
    client.create_pod(&pod_requesting("web-0", "250m")).await.unwrap();

    Scheduler::new(client.clone()).schedule_once().await.unwrap();

    let pods = client.list_pods().await.unwrap();
    assert_eq!(pods[0].spec.node_name, "node1");
}

#[tokio::test]
async fn oversized_pods_stay_unscheduled() {
    let (_url, client) = common::spawn_server_with_client().await;
    client.register_node(&ready_node("node1", "2")).await.unwrap();
    client.create_pod(&pod_requesting("hungry", "4")).await.unwrap();

    Scheduler::new(client.clone()).schedule_once().await.unwrap();

    let pods = client.list_pods().await.unwrap();
    assert!(pods[0].spec.node_name.is_empty());
}

#[tokio::test]
async fn not_ready_nodes_are_never_chosen() {
    let (_url, client) = common::spawn_server_with_client().await;

    let mut cordoned = ready_node("down", "8");
    cordoned.status.conditions[0].status = "False".to_string();
    client.register_node(&cordoned).await.unwrap();
    client.register_node(&ready_node("up", "2")).await.unwrap();

    client.create_pod(&pod_requesting("web-0", "")).await.unwrap();
    Scheduler::new(client.clone()).schedule_once().await.unwrap();

    let pods = client.list_pods().await.unwrap();
    assert_eq!(pods[0].spec.node_name, "up");
}

#[tokio::test]
async fn already_bound_pods_are_left_alone() {
    let (_url, client) = common::spawn_server_with_client().await;
    client.register_node(&ready_node("node1", "2")).await.unwrap();

    let mut bound = pod_requesting("bound", "");
    bound.spec.node_name = "elsewhere".to_string();
    client.create_pod(&bound).await.unwrap();

    Scheduler::new(client.clone()).schedule_once().await.unwrap();

    let pods = client.list_pods().await.unwrap();
    assert_eq!(pods[0].spec.node_name, "elsewhere");
}
