//! Well-known names shared with the cluster's token controller.
//!
//! These strings are matched exactly by other components watching the cluster,
//! so they must not change.

use std::collections::BTreeMap;

/// Label used to search for the secrets belonging to a service account.
pub const SERVICE_ACCOUNT_SECRET_LABEL: &str = "cattle.io/service-account.name";

/// Annotation the token controller reads to decide which service account a secret is for.
pub const SERVICE_ACCOUNT_SECRET_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Secret type that tells the token controller to populate the secret.
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Data key holding the issued token.
pub const SERVICE_ACCOUNT_TOKEN_KEY: &str = "token";

/// Prefix of the lease used to serialize reconcilers across processes.
pub const LEASE_PREFIX: &str = "sa-token-lease-";

/// Suffix appended to the service account name to form the secret's generateName.
pub const SECRET_NAME_SUFFIX: &str = "-token-";

/// Holder identity written into leases when none is configured.
pub const DEFAULT_HOLDER_IDENTITY: &str = "serviceaccounttoken-controller";

/// Name of the lease guarding reconciliation for one service account.
pub fn lease_name(service_account: &str) -> String {
    format!("{}{}", LEASE_PREFIX, service_account)
}

/// The generateName prefix for a service account's token secret.
pub fn secret_name_prefix(service_account: &str) -> String {
    format!("{}{}", service_account, SECRET_NAME_SUFFIX)
}

/// Key used by the in-process lock registry.
pub fn local_lock_key(namespace: &str, service_account: &str) -> String {
    format!("{}/{}", namespace, service_account)
}

/// Labels that select every candidate secret for a service account.
pub fn secret_selector(service_account: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        SERVICE_ACCOUNT_SECRET_LABEL.to_string(),
        service_account.to_string(),
    )])
}

/// Render a label map as an equality-based selector string (`k=v,k2=v2`).
pub fn render_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` satisfies every pair in `selector`.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}
