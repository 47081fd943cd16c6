use std::future::ready;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::Api;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sa_token::keys;
use sa_token::lister::CachedLister;
use sa_token::settings::{AppConfig, LogFormat};
use sa_token::{KubeBackend, LocalLockRegistry, TokenReconciler};

#[derive(Parser, Debug)]
#[command(name = "sa-token", version, about)]
/// Ensure service accounts have a populated token secret
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// emit logs as JSON regardless of the config file
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure the token secret for one service account and print its name
    Ensure {
        #[arg(short = 'n', long)]
        namespace: String,
        /// service account name
        name: String,
    },
    /// Ensure token secrets for every service account in a namespace, as they appear
    Watch {
        #[arg(short = 'n', long)]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = AppConfig::load(args.config.as_deref())?;
    let log_format = if args.json_logs {
        LogFormat::Json
    } else {
        cfg.logging.format
    };
    sa_token::trace::init(log_format)?;

    let metrics = sa_token::metrics::init()?;
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
                shutdown.cancel();
            }
        });
    }
    if let Some(addr) = cfg.metrics.addr {
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = sa_token::metrics::run_metrics_server(addr, metrics, shutdown).await {
                error!(error = %e, "metrics server failed");
            }
        });
    }

    let backend = KubeBackend::try_default().await?;
    let reconciler = TokenReconciler::new(
        backend.clone(),
        Arc::new(LocalLockRegistry::new()),
        &cfg,
    )
    .with_metrics(metrics);

    match args.command {
        Command::Ensure { namespace, name } => {
            let accounts: Api<ServiceAccount> =
                Api::namespaced(backend.client().clone(), &namespace);
            let sa = accounts.get(&name).await?;
            let secret = reconciler
                .ensure_secret_for_service_account(&sa, &shutdown)
                .await?;
            println!("{}", secret.metadata.name.unwrap_or_default());
        }
        Command::Watch { namespace } => {
            run_watch(backend, reconciler, &namespace, shutdown).await?;
        }
    }

    Ok(())
}

/// Keep a reflector cache of token secrets and ensure a secret for each
/// service account the watcher reports.
async fn run_watch(
    backend: KubeBackend,
    reconciler: TokenReconciler<KubeBackend>,
    namespace: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let secrets: Api<Secret> = Api::namespaced(backend.client().clone(), namespace);
    let (reader, writer) = reflector::store();
    let secret_stream = reflector(
        writer,
        watcher(
            secrets,
            watcher::Config::default().labels(keys::SERVICE_ACCOUNT_SECRET_LABEL),
        ),
    )
    .default_backoff()
    .for_each(|event| {
        if let Err(e) = event {
            warn!(error = %e, "secret watcher error, will retry");
        }
        ready(())
    });
    let cache_task = tokio::spawn(secret_stream);

    reader.wait_until_ready().await?;
    info!(namespace, "secret cache ready");
    let reconciler = reconciler.with_lister(Arc::new(CachedLister::new(reader)));

    let accounts: Api<ServiceAccount> = Api::namespaced(backend.client().clone(), namespace);
    let mut sa_stream = watcher(accounts, watcher::Config::default())
        .default_backoff()
        .applied_objects()
        .boxed();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = sa_stream.next() => match next {
                Some(Ok(sa)) => {
                    let reconciler = reconciler.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let name = sa.metadata.name.clone().unwrap_or_default();
                        match reconciler.ensure_secret_for_service_account(&sa, &shutdown).await {
                            Ok(secret) => info!(
                                service_account = %name,
                                secret = secret.metadata.name.as_deref().unwrap_or_default(),
                                "token secret ready"
                            ),
                            Err(e) => error!(service_account = %name, error = %e, "failed to ensure token secret"),
                        }
                    });
                }
                Some(Err(e)) => warn!(error = %e, "service account watcher error, will retry"),
                None => break,
            },
        }
    }

    cache_task.abort();
    Ok(())
}
