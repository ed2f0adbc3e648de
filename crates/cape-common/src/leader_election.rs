//! Leader election using Kubernetes Leases
//!
//! Only the lease holder runs the controllers. The webhook and probe servers
//! run on every replica.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lease name for the provider's leader election
pub const LEADER_LEASE_NAME: &str = "cluster-api-provider-external-leader-election-capi";

const FIELD_MANAGER: &str = "cape-controller";

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease read back from the API has no resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Lease timing
#[derive(Clone, Debug)]
pub struct LeaseTiming {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the holder keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Pause between acquisition attempts and between renewals
    pub retry_period: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(40),
            retry_period: Duration::from_secs(5),
        }
    }
}

/// True when a lease renewed at `renew_time` for `duration_secs` has lapsed
pub fn lease_expired(
    renew_time: Option<DateTime<Utc>>,
    duration_secs: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    timing: LeaseTiming,
}

impl LeaderElector {
    /// Create a new leader elector
    pub fn new(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        timing: LeaseTiming,
    ) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            timing,
        }
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard renews the lease in the background; `lost()` resolves when
    /// renewal fails for longer than the renew deadline.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.timing.retry_period).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return self.create_lease(&api, now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());
        let renew_time = spec.and_then(|s| s.renew_time.as_ref()).map(|t| t.0);
        let duration = spec.and_then(|s| s.lease_duration_seconds);

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        if holder == Some(self.identity.as_str()) {
            self.write_lease(&api, &lease, now, transitions, false).await
        } else if holder.is_none() || lease_expired(renew_time, duration, now) {
            self.write_lease(&api, &lease, now, transitions + 1, true).await
        } else {
            Ok(false)
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.timing.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Renew (or take over) the lease with a resourceVersion-guarded replace
    async fn write_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: DateTime<Utc>,
        transitions: i32,
        takeover: bool,
    ) -> Result<bool, LeaderElectionError> {
        let resource_version = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;

        let mut spec = self.lease_spec(now, transitions);
        if !takeover {
            spec.acquire_time = existing.spec.as_ref().and_then(|s| s.acquire_time.clone());
        }
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(resource_version),
                ..Default::default()
            },
            spec: Some(spec),
        };

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                if takeover {
                    info!(identity = %self.identity, transitions, "Took over lease");
                }
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.timing.retry_period).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken by another holder");
                    let _ = lost_tx.send(());
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed");
                    if last_renewed.elapsed() > self.timing.renew_deadline {
                        warn!(identity = %self.identity, "Renew deadline exceeded, leadership lost");
                        let _ = lost_tx.send(());
                        return;
                    }
                }
            }
        }
    }

    /// Clear the holder so a standby can take over immediately
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }

        let patch = json!({
            "spec": {
                "holderIdentity": null,
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Guard that maintains leadership while it lives
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release the lease for fast failover (call during graceful shutdown)
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
