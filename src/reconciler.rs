//! Ensure-or-create reconciliation of a service account's token secret.
//!
//! ## Flow
//!
//! 1. Take the in-process lock for the service account.
//! 2. Take the cluster lease (blocking with backoff while another process holds it).
//! 3. Look up the canonical secret, deleting duplicates and forgeries.
//! 4. Create the secret if there is none.
//! 5. Poll the API server directly until the token controller has populated it.
//! 6. Release the lease, then the local lock.
//!
//! Every wait inside the lease is bounded, so the lease is never held for
//! longer than the population budget plus a handful of API calls.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::TokenBackend;
use crate::error::{EnsureError, StoreError};
use crate::keys;
use crate::lease::{LeaseConfig, LeaseLock};
use crate::lister::{DirectLister, SecretLister};
use crate::local_lock::LocalLockRegistry;
use crate::metrics::Metrics;
use crate::retry::{Backoff, BackoffError, poll_with_backoff};
use crate::secret::{self, ServiceAccountRef};
use crate::settings::AppConfig;

/// Reconciles token secrets for service accounts.
///
/// Cheap to clone; clones share the lock registry.
#[derive(Clone)]
pub struct TokenReconciler<B: TokenBackend> {
    backend: B,
    lister: Arc<dyn SecretLister>,
    locks: Arc<LocalLockRegistry>,
    leases: LeaseLock<B>,
    populate: Backoff,
    metrics: Option<Metrics>,
}

impl<B: TokenBackend> TokenReconciler<B> {
    /// Lookups go straight to the backend unless [`with_lister`](Self::with_lister) is used.
    pub fn new(backend: B, locks: Arc<LocalLockRegistry>, config: &AppConfig) -> Self {
        Self::with_config(backend, locks, config.lease.clone(), config.populate.backoff.clone())
    }

    pub fn with_config(
        backend: B,
        locks: Arc<LocalLockRegistry>,
        lease: LeaseConfig,
        populate: Backoff,
    ) -> Self {
        Self {
            lister: Arc::new(DirectLister::new(backend.clone())),
            leases: LeaseLock::new(backend.clone(), lease),
            backend,
            locks,
            populate,
            metrics: None,
        }
    }

    /// Serve the initial lookup from `lister`, e.g. a reflector cache.
    pub fn with_lister(mut self, lister: Arc<dyn SecretLister>) -> Self {
        self.lister = lister;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn locks(&self) -> &Arc<LocalLockRegistry> {
        &self.locks
    }

    /// Get or create the populated token secret for `sa`.
    ///
    /// Safe to call concurrently and repeatedly: callers for the same service
    /// account, in this process or others, converge on one secret.
    pub async fn ensure_secret_for_service_account(
        &self,
        sa: &ServiceAccount,
        cancel: &CancellationToken,
    ) -> Result<Secret, EnsureError> {
        let started = Instant::now();
        let result = self.ensure(sa, cancel).await;
        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            metrics.record_ensure(outcome, started.elapsed().as_secs_f64());
        }
        result
    }

    async fn ensure(
        &self,
        sa: &ServiceAccount,
        cancel: &CancellationToken,
    ) -> Result<Secret, EnsureError> {
        let sa = ServiceAccountRef::from_service_account(sa)?;

        let _local = self
            .locks
            .acquire(&keys::local_lock_key(&sa.namespace, &sa.name), cancel)
            .await?;

        let lease = self.leases.acquire(&sa.namespace, &sa.name, cancel).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_lease_attempts(lease.attempts());
        }

        let result = self.reconcile_locked(&sa, cancel).await;

        let lease_name = lease.name().to_string();
        if let Err(e) = lease.release().await {
            error!(namespace = %sa.namespace, lease = %lease_name, error = %e, "error releasing lease");
            if let Some(metrics) = &self.metrics {
                metrics.record_lease_release_failure();
            }
        }
        result
    }

    /// Lookup, create and wait. Only called while holding both locks.
    async fn reconcile_locked(
        &self,
        sa: &ServiceAccountRef,
        cancel: &CancellationToken,
    ) -> Result<Secret, EnsureError> {
        let lookup = secret::find_valid(sa, self.lister.as_ref(), &self.backend)
            .await
            .map_err(|e| match e {
                EnsureError::Store { context, source } => EnsureError::store(
                    format!(
                        "error looking up secret for service account [{}:{}]: {}",
                        sa.namespace, sa.name, context
                    ),
                    source,
                ),
                other => other,
            })?;
        if let Some(metrics) = &self.metrics {
            metrics.record_secrets_deleted(lookup.deleted, lookup.delete_failures);
        }

        let found = match lookup.secret {
            Some(found) => found,
            None => {
                if cancel.is_cancelled() {
                    return Err(EnsureError::Cancelled);
                }
                let created = self
                    .backend
                    .create_secret(&sa.namespace, &secret::secret_template(sa))
                    .await
                    .map_err(|e| self.store_error(sa, e))?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_secret_created();
                }
                info!(
                    namespace = %sa.namespace,
                    service_account = %sa.name,
                    secret = created.metadata.name.as_deref().unwrap_or_default(),
                    "created token secret"
                );
                created
            }
        };

        if secret::is_populated(&found) {
            return Ok(found);
        }
        self.wait_for_population(sa, found, cancel).await
    }

    /// Re-fetch `secret` from the API server until its token is set.
    ///
    /// Bypasses any lister cache: a cache may not have seen the write yet and
    /// would make us time out on a secret that is already populated.
    async fn wait_for_population(
        &self,
        sa: &ServiceAccountRef,
        secret: Secret,
        cancel: &CancellationToken,
    ) -> Result<Secret, EnsureError> {
        let name = secret.metadata.name.clone().ok_or_else(|| {
            self.store_error(sa, StoreError::Backend("secret has no name".into()))
        })?;
        info!(
            namespace = %sa.namespace,
            secret = %name,
            "waiting for secret to be populated with token"
        );

        let backend = &self.backend;
        let namespace = sa.namespace.as_str();
        let secret_name = name.as_str();
        let result = poll_with_backoff(&self.populate, cancel, |attempt| async move {
            let current = backend
                .get_secret(namespace, secret_name)
                .await?
                .ok_or_else(|| StoreError::NotFound(secret_name.to_string()))?;
            if secret::is_populated(&current) {
                Ok::<_, StoreError>(Some(current))
            } else {
                debug!(namespace, secret = secret_name, attempt, "secret not populated yet");
                Ok(None)
            }
        })
        .await;

        match result {
            Ok((populated, polls)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_populate_polls(polls);
                }
                Ok(populated)
            }
            Err(BackoffError::Exhausted { attempts }) => Err(EnsureError::PopulationTimeout {
                secret: name,
                attempts,
            }),
            Err(BackoffError::Cancelled { .. }) => Err(EnsureError::Cancelled),
            Err(BackoffError::Failed { error, .. }) => Err(self.store_error(sa, error)),
        }
    }

    fn store_error(&self, sa: &ServiceAccountRef, source: StoreError) -> EnsureError {
        EnsureError::store(
            format!(
                "error ensuring secret for service account [{}:{}]",
                sa.namespace, sa.name
            ),
            source,
        )
    }
}
