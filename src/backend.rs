//! Abstraction over the Kubernetes API operations the reconciler needs.
//!
//! `TokenBackend` covers the Lease and Secret calls made while reconciling,
//! so the reconciler can run against a real cluster (`KubeBackend`) or an
//! in-memory store in tests.

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};

use crate::error::StoreError;

/// The Lease and Secret calls a reconcile makes.
///
/// Reads through this trait always hit the authoritative store; cached reads
/// go through [`SecretLister`](crate::lister::SecretLister) instead.
#[async_trait]
pub trait TokenBackend: Send + Sync + Clone + 'static {
    // -- leases --

    /// `None` when there is no such lease.
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, StoreError>;

    /// Atomic create-if-absent; a taken name is `StoreError::AlreadyExists`.
    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, StoreError>;

    /// Write `lease` only if its resourceVersion is still current.
    /// Returns `StoreError::Conflict` if the resourceVersion no longer matches.
    async fn replace_lease(
        &self,
        namespace: &str,
        name: &str,
        lease: &Lease,
    ) -> Result<Lease, StoreError>;

    /// Delete a lease, only if it still matches `preconditions`.
    /// A mismatch is `StoreError::Conflict`; a missing lease is `Ok`.
    async fn delete_lease(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Option<Preconditions>,
    ) -> Result<(), StoreError>;

    // -- secrets --

    /// Create a secret. `metadata.generateName` is honoured by the store.
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, StoreError>;

    /// Always read from the API server. `None` when missing.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;

    /// `label_selector` is in `k=v,k2=v2` form.
    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, StoreError>;

    /// Deleting a missing secret succeeds.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// `TokenBackend` over a live cluster.
#[derive(Clone)]
pub struct KubeBackend {
    client: kube::Client,
}

impl KubeBackend {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Connect with the in-cluster config, falling back to kubeconfig.
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    fn leases(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn object_name(meta: &kube::api::ObjectMeta) -> String {
    meta.name
        .clone()
        .or_else(|| meta.generate_name.clone())
        .unwrap_or_default()
}

#[async_trait]
impl TokenBackend for KubeBackend {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, StoreError> {
        match self.leases(namespace).get(name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, StoreError> {
        match self
            .leases(namespace)
            .create(&PostParams::default(), lease)
            .await
        {
            Ok(l) => Ok(l),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(StoreError::AlreadyExists(
                object_name(&lease.metadata),
            )),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn replace_lease(
        &self,
        namespace: &str,
        name: &str,
        lease: &Lease,
    ) -> Result<Lease, StoreError> {
        match self
            .leases(namespace)
            .replace(name, &PostParams::default(), lease)
            .await
        {
            Ok(l) => Ok(l),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(StoreError::Conflict(
                format!("lease {} changed since it was read", name),
            )),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(StoreError::NotFound(name.into())),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn delete_lease(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Option<Preconditions>,
    ) -> Result<(), StoreError> {
        let dp = DeleteParams {
            preconditions,
            ..Default::default()
        };
        match self.leases(namespace).delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(StoreError::Conflict(format!(
                "lease {} was replaced: {}",
                name, e.message
            ))),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, StoreError> {
        match self
            .secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
        {
            Ok(s) => Ok(s),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(StoreError::AlreadyExists(
                object_name(&secret.metadata),
            )),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        match self.secrets(namespace).get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, StoreError> {
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .secrets(namespace)
            .list(&lp)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(list.items)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self
            .secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }
}
