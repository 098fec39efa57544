pub mod deployment_controller;
pub mod endpoints_controller;
pub mod replicaset_controller;

pub use deployment_controller::DeploymentController;
pub use endpoints_controller::EndpointsController;
pub use replicaset_controller::ReplicaSetController;
