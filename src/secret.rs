//! Lookup, validation and templating of service-account token secrets.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{error, warn};

use crate::backend::TokenBackend;
use crate::error::{EnsureError, StoreError};
use crate::keys;
use crate::lister::SecretLister;

/// Identity of the service account being reconciled, with required fields checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccountRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ServiceAccountRef {
    pub fn from_service_account(sa: &ServiceAccount) -> Result<Self, EnsureError> {
        let field = |value: Option<&String>, what: &str| {
            value
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| EnsureError::InvalidInput(format!("missing {}", what)))
        };
        Ok(Self {
            namespace: field(sa.metadata.namespace.as_ref(), "namespace")?,
            name: field(sa.metadata.name.as_ref(), "name")?,
            uid: field(sa.metadata.uid.as_ref(), "uid")?,
        })
    }
}

/// Template for a new token secret owned by `sa`.
///
/// The store fills in the name from `generateName`; the token controller
/// fills in the token once it sees the type and annotation.
pub fn secret_template(sa: &ServiceAccountRef) -> Secret {
    Secret {
        metadata: ObjectMeta {
            generate_name: Some(keys::secret_name_prefix(&sa.name)),
            namespace: Some(sa.namespace.clone()),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "ServiceAccount".to_string(),
                name: sa.name.clone(),
                uid: sa.uid.clone(),
                ..Default::default()
            }]),
            annotations: Some(BTreeMap::from([(
                keys::SERVICE_ACCOUNT_SECRET_ANNOTATION.to_string(),
                sa.name.clone(),
            )])),
            labels: Some(keys::secret_selector(&sa.name)),
            ..Default::default()
        },
        type_: Some(keys::SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
        ..Default::default()
    }
}

/// A secret is valid for `sa` if it has the token type and an annotation naming `sa`.
pub fn is_secret_for_service_account(secret: &Secret, sa: &ServiceAccountRef) -> bool {
    if secret.type_.as_deref() != Some(keys::SERVICE_ACCOUNT_TOKEN_TYPE) {
        return false;
    }
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(keys::SERVICE_ACCOUNT_SECRET_ANNOTATION))
        .is_some_and(|name| name == &sa.name)
}

/// Whether the token controller has filled in the token.
pub fn is_populated(secret: &Secret) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(keys::SERVICE_ACCOUNT_TOKEN_KEY))
        .is_some_and(|token| !token.0.is_empty())
}

/// Oldest first, then by name. Secrets without a creation timestamp sort last.
fn canonical_order(a: &Secret, b: &Secret) -> Ordering {
    let ts = |s: &Secret| s.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let by_age = match (ts(a), ts(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_age.then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

/// Split candidates into the canonical secret (if any valid one exists) and
/// everything else, which should be deleted.
pub fn select_canonical(
    candidates: Vec<Secret>,
    sa: &ServiceAccountRef,
) -> (Option<Secret>, Vec<Secret>) {
    let (mut valid, mut rest): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|s| is_secret_for_service_account(s, sa));
    valid.sort_by(canonical_order);
    let mut valid = valid.into_iter();
    let canonical = valid.next();
    rest.extend(valid);
    (canonical, rest)
}

/// Result of a lookup, including how many extras were removed.
#[derive(Debug, Default)]
pub struct Lookup {
    pub secret: Option<Secret>,
    pub deleted: u32,
    pub delete_failures: u32,
}

/// Find the canonical token secret for `sa`, deleting every other candidate.
///
/// Deletion is best-effort: failures are logged and never returned, so a
/// stuck duplicate can't keep the caller from using the canonical secret.
pub async fn find_valid<B: TokenBackend>(
    sa: &ServiceAccountRef,
    lister: &dyn SecretLister,
    backend: &B,
) -> Result<Lookup, EnsureError> {
    let candidates = lister
        .list(&sa.namespace, &keys::secret_selector(&sa.name))
        .await
        .map_err(|e| EnsureError::store("could not get secrets for service account", e))?;

    let (secret, extras) = select_canonical(candidates, sa);
    let mut lookup = Lookup {
        secret,
        ..Default::default()
    };

    for extra in extras {
        let name = extra.metadata.name.clone().unwrap_or_default();
        let reason = if is_secret_for_service_account(&extra, sa) {
            "duplicate"
        } else {
            "invalid"
        };
        warn!(
            namespace = %sa.namespace,
            secret = %name,
            service_account = %sa.name,
            reason,
            "secret is not the canonical token secret for service account, deleting"
        );
        match delete_secret(backend, &sa.namespace, &name).await {
            Ok(()) => lookup.deleted += 1,
            Err(e) => {
                error!(namespace = %sa.namespace, secret = %name, error = %e, "unable to delete secret");
                lookup.delete_failures += 1;
            }
        }
    }

    Ok(lookup)
}

async fn delete_secret<B: TokenBackend>(
    backend: &B,
    namespace: &str,
    name: &str,
) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::Backend("secret has no name".into()));
    }
    backend.delete_secret(namespace, name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::ByteString;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn sa() -> ServiceAccountRef {
        ServiceAccountRef {
            namespace: "cattle-system".into(),
            name: "builder".into(),
            uid: "uid-1".into(),
        }
    }

    fn candidate(name: &str, created_secs: Option<i64>, annotation: &str, type_: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("cattle-system".into()),
                creation_timestamp: created_secs
                    .map(|s| Time(Utc.timestamp_opt(s, 0).single().unwrap())),
                annotations: Some(BTreeMap::from([(
                    keys::SERVICE_ACCOUNT_SECRET_ANNOTATION.to_string(),
                    annotation.to_string(),
                )])),
                labels: Some(keys::secret_selector("builder")),
                ..Default::default()
            },
            type_: Some(type_.into()),
            ..Default::default()
        }
    }

    #[test]
    fn template_carries_owner_and_markers() {
        let s = secret_template(&sa());
        assert_eq!(s.metadata.generate_name.as_deref(), Some("builder-token-"));
        assert_eq!(s.metadata.name, None);
        assert_eq!(s.type_.as_deref(), Some(keys::SERVICE_ACCOUNT_TOKEN_TYPE));
        let owner = &s.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "ServiceAccount");
        assert_eq!(owner.uid, "uid-1");
        assert!(is_secret_for_service_account(&s, &sa()));
        assert!(!is_populated(&s));
    }

    #[test]
    fn validity_requires_type_and_exact_annotation() {
        let ok = candidate("a", None, "builder", keys::SERVICE_ACCOUNT_TOKEN_TYPE);
        let wrong_annotation = candidate("b", None, "builder2", keys::SERVICE_ACCOUNT_TOKEN_TYPE);
        let wrong_type = candidate("c", None, "builder", "Opaque");
        assert!(is_secret_for_service_account(&ok, &sa()));
        assert!(!is_secret_for_service_account(&wrong_annotation, &sa()));
        assert!(!is_secret_for_service_account(&wrong_type, &sa()));
    }

    #[test]
    fn oldest_valid_secret_is_canonical() {
        let t = keys::SERVICE_ACCOUNT_TOKEN_TYPE;
        let (canonical, rest) = select_canonical(
            vec![
                candidate("newer", Some(200), "builder", t),
                candidate("forged", Some(1), "someone-else", t),
                candidate("untimed", None, "builder", t),
                candidate("older", Some(100), "builder", t),
            ],
            &sa(),
        );
        assert_eq!(canonical.unwrap().metadata.name.as_deref(), Some("older"));
        let mut names: Vec<_> = rest
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["forged", "newer", "untimed"]);
    }

    #[test]
    fn equal_timestamps_fall_back_to_name() {
        let t = keys::SERVICE_ACCOUNT_TOKEN_TYPE;
        let (canonical, rest) = select_canonical(
            vec![
                candidate("builder-token-b", Some(5), "builder", t),
                candidate("builder-token-a", Some(5), "builder", t),
            ],
            &sa(),
        );
        assert_eq!(
            canonical.unwrap().metadata.name.as_deref(),
            Some("builder-token-a")
        );
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn populated_requires_non_empty_token() {
        let mut s = secret_template(&sa());
        s.data = Some(BTreeMap::from([(
            keys::SERVICE_ACCOUNT_TOKEN_KEY.to_string(),
            ByteString(vec![]),
        )]));
        assert!(!is_populated(&s));
        s.data = Some(BTreeMap::from([(
            keys::SERVICE_ACCOUNT_TOKEN_KEY.to_string(),
            ByteString(b"abc".to_vec()),
        )]));
        assert!(is_populated(&s));
    }

    #[test]
    fn service_account_ref_requires_identity() {
        let mut account = ServiceAccount::default();
        assert!(matches!(
            ServiceAccountRef::from_service_account(&account),
            Err(EnsureError::InvalidInput(_))
        ));
        account.metadata.namespace = Some("ns".into());
        account.metadata.name = Some("builder".into());
        account.metadata.uid = Some(String::new());
        assert!(matches!(
            ServiceAccountRef::from_service_account(&account),
            Err(EnsureError::InvalidInput(_))
        ));
        account.metadata.uid = Some("u".into());
        let r = ServiceAccountRef::from_service_account(&account).unwrap();
        assert_eq!(r.name, "builder");
    }
}
