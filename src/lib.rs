//! Distributed, idempotent reconciliation of Kubernetes service-account token secrets.
//!
//! Several processes may ask for the token secret of the same service account
//! at once. [`reconciler::TokenReconciler`] makes sure exactly one secret ends
//! up existing and returns it once the cluster's token controller has filled
//! in the token.

pub mod backend;
pub mod error;
pub mod keys;
pub mod lease;
pub mod lister;
pub mod local_lock;
pub mod metrics;
pub mod reconciler;
pub mod retry;
pub mod secret;
pub mod settings;
pub mod trace;

pub use backend::{KubeBackend, TokenBackend};
pub use error::{EnsureError, StoreError};
pub use local_lock::LocalLockRegistry;
pub use reconciler::TokenReconciler;
pub use sa_token_macros::test;
