use std::path::PathBuf;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::models::{
    Deployment, Endpoints, Lease, List, Node, Pod, ReplicaSet, Service,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("resource not found")]
    NotFound,
    #[error("resource conflict")]
    Conflict,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api error: {status}: {message}")]
    Api { status: u16, message: String },
}

/// Client certificate, key and CA bundle for talking to an mTLS apiserver.
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl ClientTls {
    /// All three flags or nothing; a partial set falls back to plaintext.
    pub fn from_flags(
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
        ca: Option<PathBuf>,
    ) -> Option<Self> {
        match (cert, key, ca) {
            (Some(cert), Some(key), Some(ca)) => Some(Self { cert, key, ca }),
            _ => None,
        }
    }
}

/// Typed access to the resource server. Every non-apiserver binary talks to
/// the cluster exclusively through this.
#[derive(Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, tls: Option<&ClientTls>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();

        if let Some(tls) = tls {
            let cert = std::fs::read(&tls.cert)
                .with_context(|| format!("read client certificate {}", tls.cert.display()))?;
            let key = std::fs::read(&tls.key)
                .with_context(|| format!("read client key {}", tls.key.display()))?;
            let ca = std::fs::read(&tls.ca)
                .with_context(|| format!("read CA bundle {}", tls.ca.display()))?;

            let identity = reqwest::Identity::from_pem(&[cert, key].concat())
                .context("parse client identity")?;
            let ca = reqwest::Certificate::from_pem(&ca).context("parse CA certificate")?;
            builder = builder
                .use_rustls_tls()
                .identity(identity)
                .add_root_certificate(ca);
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: builder.build().context("build HTTP client")?,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status.as_u16() {
            404 => Err(ClientError::NotFound),
            409 => Err(ClientError::Conflict),
            code => {
                let message = response.text().await.unwrap_or_default();
                Err(ClientError::Api {
                    status: code,
                    message,
                })
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ClientError> {
        let response = self
            .http
            .put(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    // Pods

    pub async fn list_pods(&self) -> Result<Vec<Pod>, ClientError> {
        Ok(self.get_json::<List<Pod>>("/api/v1/pods").await?.items)
    }

    pub async fn create_pod(&self, pod: &Pod) -> Result<(), ClientError> {
        self.post_json("/api/v1/pods", pod).await
    }

    pub async fn update_pod(&self, pod: &Pod) -> Result<(), ClientError> {
        self.put_json(&format!("/api/v1/pods/{}", pod.metadata.name), pod)
            .await
    }

    /// Idempotent at this level: deleting an already-gone pod succeeds.
    pub async fn delete_pod(&self, name: &str) -> Result<(), ClientError> {
        match self.delete(&format!("/api/v1/pods/{name}")).await {
            Err(ClientError::NotFound) => Ok(()),
            other => other,
        }
    }

    // Nodes

    pub async fn list_nodes(&self) -> Result<Vec<Node>, ClientError> {
        Ok(self.get_json::<List<Node>>("/api/v1/nodes").await?.items)
    }

    /// A conflict means the node already exists; re-registration after a
    /// restart is success.
    pub async fn register_node(&self, node: &Node) -> Result<(), ClientError> {
        match self.post_json("/api/v1/nodes", node).await {
            Err(ClientError::Conflict) => Ok(()),
            other => other,
        }
    }

    // ReplicaSets

    pub async fn list_replica_sets(&self) -> Result<Vec<ReplicaSet>, ClientError> {
        Ok(self
            .get_json::<List<ReplicaSet>>("/apis/apps/v1/replicasets")
            .await?
            .items)
    }

    pub async fn create_replica_set(&self, rs: &ReplicaSet) -> Result<(), ClientError> {
        self.post_json("/apis/apps/v1/replicasets", rs).await
    }

    pub async fn update_replica_set(&self, rs: &ReplicaSet) -> Result<(), ClientError> {
        self.put_json(
            &format!("/apis/apps/v1/replicasets/{}", rs.metadata.name),
            rs,
        )
        .await
    }

    // Deployments

    pub async fn list_deployments(&self) -> Result<Vec<Deployment>, ClientError> {
        Ok(self
            .get_json::<List<Deployment>>("/apis/apps/v1/deployments")
            .await?
            .items)
    }

    pub async fn create_deployment(&self, deployment: &Deployment) -> Result<(), ClientError> {
        self.post_json("/apis/apps/v1/deployments", deployment).await
    }

    pub async fn update_deployment(&self, deployment: &Deployment) -> Result<(), ClientError> {
        self.put_json(
            &format!("/apis/apps/v1/deployments/{}", deployment.metadata.name),
            deployment,
        )
        .await
    }

    pub async fn delete_deployment(&self, name: &str) -> Result<(), ClientError> {
        match self.delete(&format!("/apis/apps/v1/deployments/{name}")).await {
            Err(ClientError::NotFound) => Ok(()),
            other => other,
        }
    }

    // Services

    pub async fn list_services(&self) -> Result<Vec<Service>, ClientError> {
        Ok(self
            .get_json::<List<Service>>("/api/v1/services")
            .await?
            .items)
    }

    pub async fn create_service(&self, service: &Service) -> Result<(), ClientError> {
        self.post_json("/api/v1/services", service).await
    }

    // Endpoints

    pub async fn get_endpoints(&self, name: &str) -> Result<Option<Endpoints>, ClientError> {
        match self
            .get_json::<Endpoints>(&format!("/api/v1/endpoints/{name}"))
            .await
        {
            Ok(endpoints) => Ok(Some(endpoints)),
            Err(ClientError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn create_endpoints(&self, endpoints: &Endpoints) -> Result<(), ClientError> {
        self.post_json("/api/v1/endpoints", endpoints).await
    }

    pub async fn update_endpoints(&self, endpoints: &Endpoints) -> Result<(), ClientError> {
        self.put_json(
            &format!("/api/v1/endpoints/{}", endpoints.metadata.name),
            endpoints,
        )
        .await
    }

    // Leases

    pub async fn get_lease(&self, name: &str) -> Result<Option<Lease>, ClientError> {
        match self.get_json::<Lease>(&format!("/api/v1/leases/{name}")).await {
            Ok(lease) => Ok(Some(lease)),
            Err(ClientError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn create_lease(&self, lease: &Lease) -> Result<(), ClientError> {
        self.post_json("/api/v1/leases", lease).await
    }

    pub async fn update_lease(&self, lease: &Lease) -> Result<(), ClientError> {
        self.put_json(&format!("/api/v1/leases/{}", lease.metadata.name), lease)
            .await
    }
}
