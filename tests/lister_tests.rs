
use std::sync::Arc;
use std::sync::atomic::Ordering;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use mock_k8s::{
    MockK8sBackend, MockK8sState, NAMESPACE, labelled_secret, service_account, token_of,
};
use sa_token::lister::{CachedLister, SecretLister};
use sa_token::settings::AppConfig;
use sa_token::{LocalLockRegistry, TokenReconciler, keys};
use tokio_util::sync::CancellationToken;

const TOKEN_TYPE: &str = keys::SERVICE_ACCOUNT_TOKEN_TYPE;

fn in_namespace(mut secret: Secret, namespace: &str) -> Secret {
    secret.metadata.namespace = Some(namespace.to_string());
    secret
}

/// A reflector store fed the given secrets as watcher events.
fn cache_of(secrets: &[Secret]) -> Store<Secret> {
    let (reader, mut writer) = reflector::store();
    for secret in secrets {
        writer.apply_watcher_event(&watcher::Event::Apply(secret.clone()));
    }
    reader
}

fn names(mut secrets: Vec<Secret>) -> Vec<String> {
    secrets.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    secrets.into_iter().filter_map(|s| s.metadata.name).collect()
}

#[sa_token::test]
async fn cached_list_filters_by_namespace_and_labels() {
    let mut unlabelled = labelled_secret("builder", "builder-unlabelled", "builder", TOKEN_TYPE, 5);
    unlabelled.metadata.labels = None;
    let store = cache_of(&[
        labelled_secret("builder", "builder-token-a", "builder", TOKEN_TYPE, 60),
        labelled_secret("builder", "builder-token-b", "builder", "Opaque", 30),
        labelled_secret("deployer", "deployer-token-a", "deployer", TOKEN_TYPE, 60),
        in_namespace(
            labelled_secret("builder", "builder-token-elsewhere", "builder", TOKEN_TYPE, 60),
            "other-ns",
        ),
        unlabelled,
    ]);
    let lister = CachedLister::new(store);

    let found = lister
        .list(NAMESPACE, &keys::secret_selector("builder"))
        .await
        .unwrap();
    // Label matching only; type and annotation are checked by the caller.
    assert_eq!(names(found), vec!["builder-token-a", "builder-token-b"]);

    let found = lister
        .list("other-ns", &keys::secret_selector("builder"))
        .await
        .unwrap();
    assert_eq!(names(found), vec!["builder-token-elsewhere"]);

    let found = lister
        .list("empty-ns", &keys::secret_selector("builder"))
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[sa_token::test]
async fn cached_list_drops_deleted_secrets() {
    let secret = labelled_secret("builder", "builder-token-a", "builder", TOKEN_TYPE, 60);
    let (reader, mut writer) = reflector::store();
    writer.apply_watcher_event(&watcher::Event::Apply(secret.clone()));
    writer.apply_watcher_event(&watcher::Event::Delete(secret));

    let found = CachedLister::new(reader)
        .list(NAMESPACE, &keys::secret_selector("builder"))
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[sa_token::test(start_paused = true)]
async fn reconcile_through_cache_cleans_up_and_polls_the_api() {
    let state = MockK8sState::new();
    let old = labelled_secret("builder", "builder-token-old", "builder", TOKEN_TYPE, 600);
    let new = labelled_secret("builder", "builder-token-new", "builder", TOKEN_TYPE, 10);
    state.put_secret(old.clone()).await;
    state.put_secret(new.clone()).await;
    // The token lands in the API server only; the cache still shows it empty.
    state.populate(NAMESPACE, "builder-token-old").await;

    let reconciler = TokenReconciler::new(
        MockK8sBackend::new(state.clone()),
        Arc::new(LocalLockRegistry::new()),
        &AppConfig::default(),
    )
    .with_lister(Arc::new(CachedLister::new(cache_of(&[old, new]))));

    let secret = reconciler
        .ensure_secret_for_service_account(&service_account("builder"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(secret.metadata.name.as_deref(), Some("builder-token-old"));
    assert_eq!(
        token_of(&secret),
        Some("token-for-builder-token-old".to_string())
    );
    assert_eq!(state.secret_list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.secret_get_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        state.secret_names(NAMESPACE).await,
        vec!["builder-token-old".to_string()]
    );
}
