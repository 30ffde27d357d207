//! Per-environment run lock.
//!
//! Only one run may mutate an environment at a time. [`LeaseLock`] enforces
//! this with a `coordination.k8s.io/v1` Lease in the target cluster, renewed in
//! the background while held. [`InMemoryLock`] is a process-local stand-in.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use tracing::{debug, error, info, warn};

use crate::error::RolloutError;

const ANNOTATION_PREFIX: &str = "rollout.platform.io";

/// Mutual exclusion for runs against one environment.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Take the lock for `holder`.
    ///
    /// Returns [`RolloutError::LockHeld`] when another live holder has it.
    async fn acquire(&self, holder: &str) -> Result<Box<dyn LockGuard>, RolloutError>;
}

/// A held lock.
#[async_trait]
pub trait LockGuard: Send + Sync {
    fn holder(&self) -> &str;

    async fn release(self: Box<Self>) -> Result<(), RolloutError>;
}

/// Lease-backed lock.
#[derive(Clone)]
pub struct LeaseLock {
    client: Client,
    namespace: String,
    name: String,
    lease_duration: Duration,
    renewal_interval: Duration,
}

impl LeaseLock {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            lease_duration: Duration::from_secs(60),
            renewal_interval: Duration::from_secs(20),
        }
    }

    #[must_use]
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease_spec(&self, holder: &str) -> LeaseSpec {
        let now = MicroTime(chrono::Utc::now());
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: i32::try_from(self.lease_duration.as_secs()).ok(),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            ..LeaseSpec::default()
        }
    }

    fn annotations(&self, holder: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (format!("{ANNOTATION_PREFIX}/holder"), holder.to_string()),
            (
                format!("{ANNOTATION_PREFIX}/acquired"),
                chrono::Utc::now().to_rfc3339(),
            ),
            (format!("{ANNOTATION_PREFIX}/lock-name"), self.name.clone()),
        ])
    }

    fn guard(&self, holder: &str) -> Box<dyn LockGuard> {
        Box::new(ActiveLease::start(
            self.api(),
            self.name.clone(),
            holder.to_string(),
            self.renewal_interval,
        ))
    }
}

fn lock_err(e: &KubeError) -> RolloutError {
    RolloutError::Lock(e.to_string())
}

#[async_trait]
impl RunLock for LeaseLock {
    async fn acquire(&self, holder: &str) -> Result<Box<dyn LockGuard>, RolloutError> {
        debug!(lock = %self.name, holder, "Acquiring environment lock");
        let api = self.api();
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(self.annotations(holder)),
                ..ObjectMeta::default()
            },
            spec: Some(self.lease_spec(holder)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lock = %self.name, holder, "Acquired environment lock");
                return Ok(self.guard(holder));
            }
            Err(KubeError::Api(err)) if err.code == 409 => {}
            Err(e) => return Err(lock_err(&e)),
        }

        let existing = api.get(&self.name).await.map_err(|e| lock_err(&e))?;
        if !is_expired(&existing, chrono::Utc::now()) {
            let current = existing
                .spec
                .as_ref()
                .and_then(|s| s.holder_identity.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(RolloutError::LockHeld { holder: current });
        }

        debug!(lock = %self.name, "Lease expired, taking over");
        let mut takeover = existing;
        takeover.spec = Some(self.lease_spec(holder));
        takeover.metadata.annotations = Some(self.annotations(holder));
        // replace carries the resourceVersion, so a concurrent takeover gets 409
        match api.replace(&self.name, &PostParams::default(), &takeover).await {
            Ok(_) => {
                info!(lock = %self.name, holder, "Acquired expired environment lock");
                Ok(self.guard(holder))
            }
            Err(KubeError::Api(err)) if err.code == 409 => Err(RolloutError::LockHeld {
                holder: "concurrent run".to_string(),
            }),
            Err(e) => Err(lock_err(&e)),
        }
    }
}

/// Whether a lease's last renewal is older than its duration.
fn is_expired(lease: &Lease, now: chrono::DateTime<chrono::Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    let (Some(renew), Some(secs)) = (&spec.renew_time, spec.lease_duration_seconds) else {
        return true;
    };
    renew.0 + chrono::Duration::seconds(i64::from(secs)) < now
}

/// Held lease with a background renewal task.
struct ActiveLease {
    api: Api<Lease>,
    name: String,
    holder: String,
    renewal: Option<tokio::task::JoinHandle<()>>,
}

impl ActiveLease {
    fn start(api: Api<Lease>, name: String, holder: String, every: Duration) -> Self {
        let renew_api = api.clone();
        let lease_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let patch = serde_json::json!({
                    "spec": { "renewTime": MicroTime(chrono::Utc::now()) }
                });
                match renew_api
                    .patch(&lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => debug!(lock = %lease_name, "Lease renewed"),
                    Err(e) => {
                        error!(lock = %lease_name, error = %e, "Lease renewal failed, lock may expire");
                        break;
                    }
                }
            }
        });
        Self {
            api,
            name,
            holder,
            renewal: Some(handle),
        }
    }
}

#[async_trait]
impl LockGuard for ActiveLease {
    fn holder(&self) -> &str {
        &self.holder
    }

    async fn release(mut self: Box<Self>) -> Result<(), RolloutError> {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
        match self.api.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(lock = %self.name, "Released environment lock");
                Ok(())
            }
            Err(KubeError::Api(err)) if err.code == 404 => {
                warn!(lock = %self.name, "Lease already gone at release");
                Ok(())
            }
            Err(e) => Err(lock_err(&e)),
        }
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

/// Process-local lock.
#[derive(Clone, Default)]
pub struct InMemoryLock {
    holder: Arc<Mutex<Option<String>>>,
}

impl InMemoryLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<String> {
        self.holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RunLock for InMemoryLock {
    async fn acquire(&self, holder: &str) -> Result<Box<dyn LockGuard>, RolloutError> {
        let mut slot = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slot.as_ref() {
            return Err(RolloutError::LockHeld {
                holder: current.clone(),
            });
        }
        *slot = Some(holder.to_string());
        Ok(Box::new(InMemoryGuard {
            slot: self.holder.clone(),
            holder: holder.to_string(),
        }))
    }
}

struct InMemoryGuard {
    slot: Arc<Mutex<Option<String>>>,
    holder: String,
}

#[async_trait]
impl LockGuard for InMemoryGuard {
    fn holder(&self) -> &str {
        &self.holder
    }

    async fn release(self: Box<Self>) -> Result<(), RolloutError> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
