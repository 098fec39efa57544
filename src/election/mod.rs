use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::Client;
use crate::models::{Lease, LeaseSpec, ObjectMeta, TypeMeta};

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lock_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(lock_name: &str, identity: &str) -> Self {
        Self {
            lock_name: lock_name.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Single-writer guard around the controllers. Whoever holds the unexpired
/// Lease runs them; everyone else keeps retrying the acquire.
pub struct LeaderElector {
    client: Client,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        Self { client, config }
    }

    /// Blocks until `parent` is cancelled. Each time the lease is acquired,
    /// `on_started` runs in its own task under a child token; losing the
    /// lease cancels that token, waits for the task, and re-enters the
    /// acquire loop.
    pub async fn run<F, Fut>(&self, parent: CancellationToken, on_started: F)
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!(
            "attempting to acquire leader lease {} as {}",
            self.config.lock_name, self.config.identity
        );

        loop {
            if parent.is_cancelled() {
                return;
            }

            match self.try_acquire_or_renew().await {
                Err(err) => {
                    info!("failed to acquire lease: {err}");
                }
                Ok(()) => {
                    info!("acquired lease {}, leading", self.config.lock_name);
                    let leading = parent.child_token();
                    let task = tokio::spawn(on_started(leading.clone()));

                    self.renew_loop(&leading).await;

                    leading.cancel();
                    let _ = task.await;
                    warn!("lost leadership for {}", self.config.lock_name);
                }
            }

            tokio::select! {
                _ = parent.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew every retry period. Any renew failure means leadership is
    /// lost: the caller cancels the child token and re-enters acquire.
    async fn renew_loop(&self, leading: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = leading.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        warn!("failed to renew lease: {err}");
                        return;
                    }
                }
            }
        }
    }

    /// One step of the acquire/renew protocol. The update carries the
    /// resourceVersion observed at read time, so two candidates racing for
    /// an expired lease cannot both win.
    pub async fn try_acquire_or_renew(&self) -> Result<()> {
        let now = Utc::now();
        let duration_seconds = self.config.lease_duration.as_secs() as i32;

        let Some(mut lease) = self.client.get_lease(&self.config.lock_name).await? else {
            let lease = Lease {
                type_meta: TypeMeta::new("Lease", "v1"),
                metadata: ObjectMeta::named(&self.config.lock_name),
                spec: LeaseSpec {
                    holder_identity: Some(self.config.identity.clone()),
                    lease_duration_seconds: Some(duration_seconds),
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    lease_transitions: None,
                },
            };
            self.client.create_lease(&lease).await?;
            return Ok(());
        };

        if lease.spec.holder_identity.as_deref() == Some(self.config.identity.as_str()) {
            lease.spec.renew_time = Some(now);
            self.client.update_lease(&lease).await?;
            return Ok(());
        }

        if let (Some(holder), Some(expiry)) = (&lease.spec.holder_identity, lease.spec.expiry()) {
            if now < expiry {
                return Err(anyhow!("lease currently held by {holder}"));
            }
        }

        // Expired or never held: take it over.
        lease.spec.holder_identity = Some(self.config.identity.clone());
        lease.spec.acquire_time = Some(now);
        lease.spec.renew_time = Some(now);
        lease.spec.lease_duration_seconds = Some(duration_seconds);
        lease.spec.lease_transitions = Some(lease.spec.lease_transitions.unwrap_or(0) + 1);
        self.client.update_lease(&lease).await?;
        Ok(())
    }
}
