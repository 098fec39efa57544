use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{Deployment, Endpoints, Lease, Node, Pod, ReplicaSet, Service};

pub const GROUP_CORE: &str = "/api/v1";
pub const GROUP_APPS: &str = "/apis/apps/v1";

/// One entry of the kind registry: everything the generic CRUD surface
/// needs to serve a resource kind without reflection.
pub struct KindSpec {
    pub plural: &'static str,
    pub kind: &'static str,
    pub list_kind: &'static str,
    pub api_version: &'static str,
    pub group: &'static str,
    validate: fn(&Value) -> Result<(), serde_json::Error>,
}

impl KindSpec {
    /// Round-trips a request body through the typed model, rejecting
    /// structurally invalid objects.
    pub fn validate(&self, body: &Value) -> Result<(), serde_json::Error> {
        (self.validate)(body)
    }
}

fn validate_as<T: DeserializeOwned>(body: &Value) -> Result<(), serde_json::Error> {
    serde_json::from_value::<T>(body.clone()).map(|_| ())
}

pub static KINDS: &[KindSpec] = &[
    KindSpec {
        plural: "pods",
        kind: "Pod",
        list_kind: "PodList",
        api_version: "v1",
        group: GROUP_CORE,
        validate: validate_as::<Pod>,
    },
    KindSpec {
        plural: "nodes",
        kind: "Node",
        list_kind: "NodeList",
        api_version: "v1",
        group: GROUP_CORE,
        validate: validate_as::<Node>,
    },
    KindSpec {
        plural: "services",
        kind: "Service",
        list_kind: "ServiceList",
        api_version: "v1",
        group: GROUP_CORE,
        validate: validate_as::<Service>,
    },
    KindSpec {
        plural: "endpoints",
        kind: "Endpoints",
        list_kind: "EndpointsList",
        api_version: "v1",
        group: GROUP_CORE,
        validate: validate_as::<Endpoints>,
    },
    KindSpec {
        plural: "leases",
        kind: "Lease",
        list_kind: "LeaseList",
        api_version: "v1",
        group: GROUP_CORE,
        validate: validate_as::<Lease>,
    },
    KindSpec {
        plural: "replicasets",
        kind: "ReplicaSet",
        list_kind: "ReplicaSetList",
        api_version: "apps/v1",
        group: GROUP_APPS,
        validate: validate_as::<ReplicaSet>,
    },
    KindSpec {
        plural: "deployments",
        kind: "Deployment",
        list_kind: "DeploymentList",
        api_version: "apps/v1",
        group: GROUP_APPS,
        validate: validate_as::<Deployment>,
    },
];

pub fn lookup(group: &str, plural: &str) -> Option<&'static KindSpec> {
    KINDS
        .iter()
        .find(|k| k.group == group && k.plural == plural)
}

pub fn registry_key(plural: &str, name: &str) -> String {
    format!("/registry/{plural}/{name}")
}

pub fn registry_prefix(plural: &str) -> String {
    format!("/registry/{plural}/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_respects_group_boundaries() {
        assert!(lookup(GROUP_CORE, "pods").is_some());
        assert!(lookup(GROUP_APPS, "deployments").is_some());
        assert!(lookup(GROUP_CORE, "deployments").is_none());
        assert!(lookup(GROUP_APPS, "pods").is_none());
        assert!(lookup(GROUP_CORE, "widgets").is_none());
    }

    #[test]
    fn validate_rejects_malformed_bodies() {
        let pods = lookup(GROUP_CORE, "pods").unwrap();
        assert!(pods
            .validate(&json!({"metadata": {"name": "ok"}, "spec": {"containers": []}}))
            .is_ok());
        assert!(pods
            .validate(&json!({"spec": {"containers": "not-a-list"}}))
            .is_err());
    }
}
