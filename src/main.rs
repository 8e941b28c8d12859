//! Trellis controller - ingress control plane for a data-plane proxy fleet

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis::cache::ObjectCache;
use trellis::crd::{TrellisCertificateDelegation, TrellisProxy};
use trellis::retry::RetryConfig;
use trellis::snapshot::SnapshotCache;
use trellis::status::{KubeStatusStore, StatusReconciler};
use trellis::trigger::{DebounceConfig, RebuildTrigger};
use trellis::{dag, serve, snapshot, trigger, watch};

/// Trellis - CRD-driven ingress control plane
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Idle debounce window for the rebuild trigger, in milliseconds
    #[arg(long, env = "TRELLIS_DEBOUNCE_MS", default_value_t = trellis::DEFAULT_DEBOUNCE_MS)]
    debounce_ms: u64,

    /// Maximum coalescing window, in milliseconds
    #[arg(long, env = "TRELLIS_MAX_COALESCE_MS", default_value_t = trellis::DEFAULT_MAX_COALESCE_MS)]
    max_coalesce_ms: u64,

    /// Bound on status-write retry attempts after a version conflict
    #[arg(long, env = "TRELLIS_STATUS_RETRIES", default_value_t = trellis::DEFAULT_STATUS_RETRY_ATTEMPTS)]
    status_retry_attempts: u32,

    /// Listen address for the subscriber-facing snapshot endpoint
    #[arg(long, env = "TRELLIS_SERVE_ADDR", default_value = "0.0.0.0:8090")]
    serve_addr: SocketAddr,

    /// Seconds granted to in-flight work on shutdown
    #[arg(long, default_value_t = 5)]
    drain_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for both owned kinds
        for crd in [TrellisProxy::crd(), TrellisCertificateDelegation::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    run_controller(cli).await
}

/// Ensure the Trellis CRDs are installed
///
/// The controller installs its own CRDs on startup using server-side
/// apply, so the CRD versions always match the controller version. The
/// apply is retried with backoff: on a fresh cluster the API server may
/// still be settling when the controller comes up.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};
    use trellis::retry::retry_with_backoff;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("trellis-controller").force();
    let retry = RetryConfig::with_max_attempts(5);

    info!("Installing TrellisProxy CRD...");
    retry_with_backoff(&retry, "install_proxy_crd", || {
        let crds = crds.clone();
        let params = params.clone();
        async move {
            crds.patch(
                "trellisproxies.trellis.dev",
                &params,
                &Patch::Apply(&TrellisProxy::crd()),
            )
            .await
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TrellisProxy CRD: {}", e))?;

    info!("Installing TrellisCertificateDelegation CRD...");
    retry_with_backoff(&retry, "install_delegation_crd", || {
        let crds = crds.clone();
        let params = params.clone();
        async move {
            crds.patch(
                "trelliscertificatedelegations.trellis.dev",
                &params,
                &Patch::Apply(&TrellisCertificateDelegation::crd()),
            )
            .await
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TrellisCertificateDelegation CRD: {}", e))?;

    info!("All Trellis CRDs installed/updated");
    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    ensure_crds_installed(&client).await?;

    let cache = Arc::new(ObjectCache::new());
    let snapshots = Arc::new(SnapshotCache::new());
    let store = Arc::new(KubeStatusStore::new(client.clone()));
    let reconciler = Arc::new(StatusReconciler::new(
        store,
        RetryConfig::with_max_attempts(cli.status_retry_attempts),
    ));

    let (rebuild_trigger, notifications) = RebuildTrigger::new();
    let watch_handles = watch::spawn_watches(client, cache.clone(), rebuild_trigger.clone());

    let server = tokio::spawn(serve::serve(cli.serve_addr, snapshots.clone()));

    // The rebuild loop: gather a snapshot, build, render, publish, and
    // hand the verdicts to the reconciler. Reconciliation drains on its
    // own task so the next cycle's gathering is never blocked on store
    // writes.
    let debounce = DebounceConfig {
        window: Duration::from_millis(cli.debounce_ms),
        max_window: Duration::from_millis(cli.max_coalesce_ms),
    };
    let rebuild_loop = {
        let cache = cache.clone();
        let snapshots = snapshots.clone();
        let reconciler = reconciler.clone();
        tokio::spawn(trigger::run_rebuild_loop(notifications, debounce, move || {
            let cache = cache.clone();
            let snapshots = snapshots.clone();
            let reconciler = reconciler.clone();
            async move {
                let view = cache.snapshot();
                let result = dag::build(&view);
                let rendered = snapshot::render(&result.dag);
                let generation = snapshots.publish(rendered);
                info!(
                    generation,
                    objects = view.len(),
                    statuses = result.statuses.len(),
                    "rebuild complete"
                );
                tokio::spawn(async move {
                    reconciler.reconcile(result.statuses).await;
                });
            }
        }))
    };

    info!("trellis controller started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");

    // Stop feeding the trigger, let the in-flight rebuild finish, and
    // give pending status writes a bounded drain period.
    for handle in watch_handles {
        handle.abort();
    }
    drop(rebuild_trigger);
    if tokio::time::timeout(Duration::from_secs(cli.drain_secs), rebuild_loop)
        .await
        .is_err()
    {
        warn!("rebuild loop did not drain in time, abandoning");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    server.abort();
    info!("trellis controller stopped");
    Ok(())
}
