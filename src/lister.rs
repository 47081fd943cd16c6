//! Secret listing used for the initial lookup.
//!
//! The lookup may be served from a read-through cache. Anything that must see
//! the latest write (the population wait) goes to the backend directly.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::Store;

use crate::backend::TokenBackend;
use crate::error::StoreError;
use crate::keys;

/// Lists secrets in a namespace by label equality.
#[async_trait]
pub trait SecretLister: Send + Sync {
    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, StoreError>;
}

/// Lists straight from the API server.
#[derive(Clone)]
pub struct DirectLister<B> {
    backend: B,
}

impl<B: TokenBackend> DirectLister<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: TokenBackend> SecretLister for DirectLister<B> {
    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, StoreError> {
        self.backend
            .list_secrets(namespace, &keys::render_selector(selector))
            .await
    }
}

/// Lists from a reflector cache kept up to date by a watcher.
///
/// The cache may lag behind recent writes.
#[derive(Clone)]
pub struct CachedLister {
    store: Store<Secret>,
}

impl CachedLister {
    pub fn new(store: Store<Secret>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SecretLister for CachedLister {
    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, StoreError> {
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|s| s.metadata.namespace.as_deref() == Some(namespace))
            .filter(|s| keys::selector_matches(selector, s.metadata.labels.as_ref()))
            .map(|s| Secret::clone(&s))
            .collect())
    }
}
