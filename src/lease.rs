//! Cluster-wide mutual exclusion through a Lease object.
//!
//! The lease's existence is the lock: it is taken with an atomic create and
//! given back by deleting it. Holder identity and duration are recorded for
//! operators, and optionally used to reclaim a lease whose holder died
//! without releasing it.
//!
//! ## Reclaiming orphaned leases
//!
//! A process that crashes inside the critical section leaves its lease
//! behind. With `reclaim_expired` enabled (off by default), a contender that
//! finds a lease whose `renewTime + leaseDurationSeconds` is in the past
//! replaces it using the lease's `resourceVersion`, so only one contender can
//! win the takeover. Leases without timestamps are never reclaimed.
//!
//! Leases are not renewed while held, so `duration_secs` must outlast the
//! whole critical section plus any clock skew between replicas.
//!
//! ## Release
//!
//! The guard remembers the uid and resourceVersion of the lease it wrote and
//! deletes with those as preconditions. A holder whose lease was taken over
//! therefore leaves the new holder's lease alone.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::Preconditions;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::TokenBackend;
use crate::error::{EnsureError, StoreError};
use crate::keys;
use crate::retry::{Backoff, BackoffError, poll_with_backoff};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub holder_identity: String,
    pub duration_secs: i32,
    pub reclaim_expired: bool,
    pub backoff: Backoff,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            holder_identity: keys::DEFAULT_HOLDER_IDENTITY.to_string(),
            duration_secs: 30,
            reclaim_expired: false,
            backoff: Backoff::lease(),
        }
    }
}

/// Whether `lease` has outlived its recorded duration at `now`.
pub fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return false;
    };
    let last_touch = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match (last_touch, spec.lease_duration_seconds) {
        (Some(at), Some(secs)) => now > at + chrono::Duration::seconds(i64::from(secs)),
        _ => false,
    }
}

/// Acquires and releases the per-service-account reconcile lease.
#[derive(Clone)]
pub struct LeaseLock<B> {
    backend: B,
    config: LeaseConfig,
}

impl<B: TokenBackend> LeaseLock<B> {
    pub fn new(backend: B, config: LeaseConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn lease_object(
        &self,
        namespace: &str,
        lease_name: &str,
        now: DateTime<Utc>,
        resource_version: Option<String>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(lease_name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.holder_identity.clone()),
                lease_duration_seconds: Some(self.config.duration_secs),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// One acquisition attempt. `Ok(None)` means someone else holds the lease;
    /// otherwise the lease as written by us.
    async fn try_acquire(
        &self,
        namespace: &str,
        lease_name: &str,
    ) -> Result<Option<Lease>, StoreError> {
        let now = Utc::now();
        let lease = self.lease_object(namespace, lease_name, now, None, 0);
        match self.backend.create_lease(namespace, &lease).await {
            Ok(created) => Ok(Some(created)),
            Err(e) if e.is_already_exists() => {
                if self.config.reclaim_expired {
                    self.try_reclaim(namespace, lease_name, now).await
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Take over the existing lease if it has expired, using CAS on resourceVersion.
    async fn try_reclaim(
        &self,
        namespace: &str,
        lease_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>, StoreError> {
        let Some(existing) = self.backend.get_lease(namespace, lease_name).await? else {
            // Released between our create and get; the next attempt can create it.
            return Ok(None);
        };
        if !is_expired(&existing, now) {
            return Ok(None);
        }
        let Some(rv) = existing.metadata.resource_version.clone() else {
            return Ok(None);
        };
        let spec = existing.spec.as_ref();
        let previous_holder = spec
            .and_then(|s| s.holder_identity.clone())
            .unwrap_or_default();
        let transitions = spec
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0)
            .saturating_add(1);
        let lease = self.lease_object(namespace, lease_name, now, Some(rv), transitions);
        match self
            .backend
            .replace_lease(namespace, lease_name, &lease)
            .await
        {
            Ok(replaced) => {
                warn!(
                    namespace,
                    lease = lease_name,
                    previous_holder = %previous_holder,
                    transitions,
                    "took over expired lease"
                );
                Ok(Some(replaced))
            }
            Err(e) if e.is_conflict() || matches!(e, StoreError::NotFound(_)) => {
                debug!(namespace, lease = lease_name, "lease takeover lost the race, will retry");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Block until the lease for `service_account` is ours.
    ///
    /// Retries while the lease is held elsewhere, up to the configured backoff
    /// budget. Any other store failure aborts immediately.
    pub async fn acquire(
        &self,
        namespace: &str,
        service_account: &str,
        cancel: &CancellationToken,
    ) -> Result<LeaseGuard<B>, EnsureError> {
        let lease_name = keys::lease_name(service_account);
        let name = lease_name.as_str();
        let result = poll_with_backoff(&self.config.backoff, cancel, |attempt| async move {
            let acquired = self.try_acquire(namespace, name).await?;
            if acquired.is_none() {
                debug!(namespace, lease = name, attempt, "lease held by another reconciler, waiting");
            }
            Ok::<_, StoreError>(acquired)
        })
        .await;

        match result {
            Ok((held, attempts)) => {
                debug!(namespace, lease = %lease_name, attempts, "acquired lease");
                Ok(LeaseGuard {
                    backend: self.backend.clone(),
                    namespace: namespace.to_string(),
                    name: lease_name,
                    preconditions: Preconditions {
                        uid: held.metadata.uid,
                        resource_version: held.metadata.resource_version,
                    },
                    attempts,
                    released: false,
                })
            }
            Err(BackoffError::Exhausted { attempts }) => Err(EnsureError::LockContention {
                lease: lease_name,
                attempts,
            }),
            Err(BackoffError::Cancelled { .. }) => Err(EnsureError::Cancelled),
            Err(BackoffError::Failed { error, .. }) => Err(EnsureError::store(
                format!("error acquiring the lease for {}", service_account),
                error,
            )),
        }
    }
}

/// Proof that this process holds a reconcile lease.
///
/// Call [`LeaseGuard::release`] when done. If the guard is dropped without
/// that (e.g. the owning future was dropped), a best-effort delete is spawned
/// on the current tokio runtime.
pub struct LeaseGuard<B: TokenBackend> {
    backend: B,
    namespace: String,
    name: String,
    /// Identity of the lease object we wrote.
    preconditions: Preconditions,
    attempts: u32,
    released: bool,
}

impl<B: TokenBackend> std::fmt::Debug for LeaseGuard<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("preconditions", &self.preconditions)
            .field("attempts", &self.attempts)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<B: TokenBackend> LeaseGuard<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of create attempts it took to acquire the lease.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delete the lease if it is still the one we wrote.
    ///
    /// A lease taken over by another holder is left in place and the release
    /// counts as done.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        release_lease(
            &self.backend,
            &self.namespace,
            &self.name,
            self.preconditions.clone(),
        )
        .await
    }
}

impl<B: TokenBackend> Drop for LeaseGuard<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = self.backend.clone();
        let namespace = std::mem::take(&mut self.namespace);
        let name = std::mem::take(&mut self.name);
        let preconditions = self.preconditions.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!(namespace = %namespace, lease = %name, "lease guard dropped while held, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = release_lease(&backend, &namespace, &name, preconditions).await {
                        error!(namespace = %namespace, lease = %name, error = %e, "error releasing lease");
                    }
                });
            }
            Err(_) => {
                error!(namespace = %namespace, lease = %name, "lease guard dropped outside a runtime, lease left behind");
            }
        }
    }
}

async fn release_lease<B: TokenBackend>(
    backend: &B,
    namespace: &str,
    name: &str,
    preconditions: Preconditions,
) -> Result<(), StoreError> {
    match backend
        .delete_lease(namespace, name, Some(preconditions))
        .await
    {
        Err(e) if e.is_conflict() => {
            warn!(namespace, lease = name, error = %e, "lease is no longer ours, leaving it to its holder");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_with(renew: Option<DateTime<Utc>>, duration: Option<i32>) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                renew_time: renew.map(MicroTime),
                lease_duration_seconds: duration,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn expiry_uses_renew_time_plus_duration() {
        let now = Utc::now();
        assert!(is_expired(
            &lease_with(Some(now - chrono::Duration::seconds(31)), Some(30)),
            now
        ));
        assert!(!is_expired(
            &lease_with(Some(now - chrono::Duration::seconds(10)), Some(30)),
            now
        ));
    }

    #[test]
    fn lease_without_timestamps_never_expires() {
        let now = Utc::now();
        assert!(!is_expired(&lease_with(None, Some(30)), now));
        assert!(!is_expired(&lease_with(Some(now - chrono::Duration::hours(1)), None), now));
        assert!(!is_expired(&Lease::default(), now));
    }
}
