pub mod kinds;
pub mod lease;
pub mod meta;
pub mod node;
pub mod pod;
pub mod service;
pub mod workload;

pub use kinds::{registry_key, registry_prefix, KindSpec, KINDS};
pub use lease::{Lease, LeaseSpec};
pub use meta::{selector_matches, IntOrString, LabelSelector, List, ObjectMeta, TypeMeta};
pub use node::{Node, NodeAddress, NodeCondition, NodeSpec, NodeStatus};
pub use pod::{
    Container, ContainerPort, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, HttpGetAction, Pod, PodCondition, PodSpec, PodStatus,
    PodTemplateSpec, Probe, ResourceList, ResourceRequirements, TcpSocketAction,
};
pub use service::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
    ServiceStatus,
};
pub use workload::{
    Deployment, DeploymentSpec, DeploymentStatus, DeploymentStrategy, ReplicaSet, ReplicaSetSpec,
    ReplicaSetStatus, RollingUpdateDeployment,
};
