mod common;

use klite::controllers::deployment_controller::{template_hash, REVISION_ANNOTATION};
use klite::controllers::{DeploymentController, EndpointsController, ReplicaSetController};
use klite::models::{
    Deployment, IntOrString, LabelSelector, Pod, PodTemplateSpec, ReplicaSet, Service,
    ServicePort, TypeMeta,
};

fn web_selector() -> LabelSelector {
    let mut selector = LabelSelector::default();
    selector
        .match_labels
        .insert("app".to_string(), "web".to_string());
    selector
}

fn web_template() -> PodTemplateSpec {
    let mut template = PodTemplateSpec::default();
    template
        .metadata
        .labels
        .insert("app".to_string(), "web".to_string());
    template.spec.containers.push(klite::models::Container {
        name: "nginx".to_string(),
        image: "nginx:latest".to_string(),
        ..Default::default()
    });
    template
}

fn web_replica_set(name: &str, replicas: i32) -> ReplicaSet {
    ReplicaSet {
        type_meta: TypeMeta::new("ReplicaSet", "apps/v1"),
        metadata: klite::models::ObjectMeta::named(name),
        spec: klite::models::ReplicaSetSpec {
            replicas: Some(replicas),
            selector: web_selector(),
            template: web_template(),
        },
        status: Default::default(),
    }
}

fn web_deployment(name: &str, replicas: i32) -> Deployment {
    Deployment {
        type_meta: TypeMeta::new("Deployment", "apps/v1"),
        metadata: klite::models::ObjectMeta::named(name),
        spec: klite::models::DeploymentSpec {
            replicas: Some(replicas),
            selector: web_selector(),
            template: web_template(),
            strategy: Default::default(),
        },
        status: Default::default(),
    }
}

#[tokio::test]
async fn replicaset_scales_up_to_the_declared_count() {
    let (_url, client) = common::spawn_server_with_client().await;
    client
        .create_replica_set(&web_replica_set("web", 3))
        .await
        .unwrap();

    let controller = ReplicaSetController::new(client.clone());
    controller.reconcile().await.unwrap();

    let pods = client.list_pods().await.unwrap();
    assert_eq!(pods.len(), 3);
    for pod in &pods {
        assert!(pod.metadata.name.starts_with("web-"));
        assert_eq!(pod.metadata.labels.get("app").unwrap(), "web");
        assert_eq!(pod.spec.containers[0].image, "nginx:latest");
    }

    // A second pass must not create more.
    controller.reconcile().await.unwrap();
    assert_eq!(client.list_pods().await.unwrap().len(), 3);
}

#[tokio::test]
async fn replicaset_scales_down_preferring_pending_pods() {
    let (_url, client) = common::spawn_server_with_client().await;
    client
        .create_replica_set(&web_replica_set("web", 1))
        .await
        .unwrap();

    let mut running = Pod::new("web-keep");
    running
        .metadata
        .labels
        .insert("app".to_string(), "web".to_string());
    running.status.phase = "Running".to_string();
    client.create_pod(&running).await.unwrap();

    let mut pending = Pod::new("web-extra");
    pending
        .metadata
        .labels
        .insert("app".to_string(), "web".to_string());
    pending.status.phase = "Pending".to_string();
    client.create_pod(&pending).await.unwrap();

    ReplicaSetController::new(client.clone())
        .reconcile()
        .await
        .unwrap();

    let pods = client.list_pods().await.unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].metadata.name, "web-keep");
}

#[tokio::test]
async fn replicaset_status_counts_ready_replicas() {
    let (_url, client) = common::spawn_server_with_client().await;
    client
        .create_replica_set(&web_replica_set("web", 2))
        .await
        .unwrap();

    let mut ready = Pod::new("web-ready");
    ready
        .metadata
        .labels
        .insert("app".to_string(), "web".to_string());
    ready.status.phase = "Running".to_string();
    client.create_pod(&ready).await.unwrap();

    let mut starting = Pod::new("web-starting");
    starting
        .metadata
        .labels
        .insert("app".to_string(), "web".to_string());
    starting.status.phase = "Pending".to_string();
    client.create_pod(&starting).await.unwrap();

    ReplicaSetController::new(client.clone())
        .reconcile()
        .await
        .unwrap();

    let rs = &client.list_replica_sets().await.unwrap()[0];
    assert_eq!(rs.status.replicas, 2);
    assert_eq!(rs.status.ready_replicas, 1);
}

#[tokio::test]
async fn deployment_creates_a_hash_named_replicaset() {
    let (_url, client) = common::spawn_server_with_client().await;
    let deployment = web_deployment("test-dep", 2);
    client.create_deployment(&deployment).await.unwrap();

    DeploymentController::new(client.clone())
        .reconcile()
        .await
        .unwrap();

    let replica_sets = client.list_replica_sets().await.unwrap();
    assert_eq!(replica_sets.len(), 1);
    let rs = &replica_sets[0];

    let hash = template_hash(&deployment.spec.template);
    assert_eq!(rs.metadata.name, format!("test-dep-{}", &hash[..10]));
    assert_eq!(rs.metadata.annotations.get(REVISION_ANNOTATION), Some(&hash));
    assert_eq!(rs.spec.replicas, Some(2));
    assert_eq!(rs.spec.selector, deployment.spec.selector);
}

#[tokio::test]
async fn deployment_rollout_retires_the_old_revision() {
    let (_url, client) = common::spawn_server_with_client().await;
    let mut deployment = web_deployment("test-dep", 2);
    client.create_deployment(&deployment).await.unwrap();

    let controller = DeploymentController::new(client.clone());
    controller.reconcile().await.unwrap();
    let old_hash = template_hash(&deployment.spec.template);

    // New template revision.
    deployment.spec.template.spec.containers[0].image = "nginx:1.27".to_string();
    let stored = client
        .list_deployments()
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    deployment.metadata = stored.metadata;
    client.update_deployment(&deployment).await.unwrap();

    controller.reconcile().await.unwrap();

    let new_hash = template_hash(&deployment.spec.template);
    assert_ne!(old_hash, new_hash);

    let replica_sets = client.list_replica_sets().await.unwrap();
    assert_eq!(replica_sets.len(), 2);
    for rs in &replica_sets {
        match rs.metadata.annotations.get(REVISION_ANNOTATION) {
            Some(h) if *h == new_hash => assert_eq!(rs.spec.replicas, Some(2)),
            Some(h) if *h == old_hash => assert_eq!(rs.spec.replicas, Some(0)),
            other => panic!("unexpected revision annotation {other:?}"),
        }
    }
}

#[tokio::test]
async fn deleted_deployment_leaves_a_scaled_down_replicaset() {
    let (_url, client) = common::spawn_server_with_client().await;
    client
        .create_deployment(&web_deployment("test-dep", 2))
        .await
        .unwrap();

    let controller = DeploymentController::new(client.clone());
    controller.reconcile().await.unwrap();

    client.delete_deployment("test-dep").await.unwrap();
    controller.reconcile().await.unwrap();

    let replica_sets = client.list_replica_sets().await.unwrap();
    assert_eq!(replica_sets.len(), 1);
    assert_eq!(replica_sets[0].spec.replicas, Some(0));
}

#[tokio::test]
async fn endpoints_follow_running_pods() {
    let (_url, client) = common::spawn_server_with_client().await;

    let mut service = Service::default();
    service.type_meta = TypeMeta::new("Service", "v1");
    service.metadata.name = "web".to_string();
    service
        .spec
        .selector
        .insert("app".to_string(), "web".to_string());
    service.spec.ports.push(ServicePort {
        port: 80,
        target_port: Some(IntOrString::Int(8080)),
        ..Default::default()
    });
    client.create_service(&service).await.unwrap();

    for (name, ip) in [("web-b", "10.0.0.2"), ("web-a", "10.0.0.1")] {
        let mut pod = Pod::new(name);
        pod.metadata
            .labels
            .insert("app".to_string(), "web".to_string());
        pod.spec.node_name = "node1".to_string();
        pod.status.phase = "Running".to_string();
        pod.status.pod_ip = ip.to_string();
        client.create_pod(&pod).await.unwrap();
    }

    let controller = EndpointsController::new(client.clone());
    controller.reconcile().await.unwrap();

    let endpoints = client.get_endpoints("web").await.unwrap().unwrap();
    assert_eq!(endpoints.metadata.name, "web");
    let subset = &endpoints.subsets[0];
    assert_eq!(subset.addresses[0].ip, "10.0.0.1");
    assert_eq!(subset.addresses[1].ip, "10.0.0.2");
    assert_eq!(subset.ports[0].port, 8080);
    assert_eq!(subset.ports[0].protocol, "TCP");

    // Unchanged inputs must not produce another write.
    let version_before = endpoints.metadata.resource_version.clone();
    controller.reconcile().await.unwrap();
    let endpoints = client.get_endpoints("web").await.unwrap().unwrap();
    assert_eq!(endpoints.metadata.resource_version, version_before);

    // A pod leaving the selector set shrinks the subset.
    client.delete_pod("web-b").await.unwrap();
    controller.reconcile().await.unwrap();
    let endpoints = client.get_endpoints("web").await.unwrap().unwrap();
    assert_eq!(endpoints.subsets[0].addresses.len(), 1);
}
