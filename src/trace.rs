use std::sync::Once;

use tracing_subscriber::{EnvFilter, prelude::*};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber, filtered by `RUST_LOG` (default `info`).
///
/// `Text` gives compact lines for terminals, `Json` one object per event for
/// log shippers. Only the first call does anything.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let registry = tracing_subscriber::registry();
        let result = match log_format {
            LogFormat::Text => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .compact()
                        .with_filter(env_filter),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .json()
                        .with_filter(env_filter),
                )
                .try_init(),
        };
        init_result = Some(result.map_err(|e| anyhow::anyhow!(e)));
    });
    init_result.unwrap_or(Ok(()))
}

/// Run an async test body with tracing installed.
pub async fn with_test_tracing<F, Fut, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    // A subscriber installed by another harness is fine.
    let _ = init(LogFormat::Text);
    f().await
}

/// [`with_test_tracing`] for `#[test]` bodies.
pub fn with_test_tracing_sync<F, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _ = init(LogFormat::Text);
    f()
}
