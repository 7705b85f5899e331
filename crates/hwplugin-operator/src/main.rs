//! Hardware plugin operator - allocates and releases bare-metal hosts

mod controller_runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use hwplugin_common::crd::{AllocatedNode, AllocationRequest, PhysicalHost};
use hwplugin_common::kube_utils::{apply_crd, create_client};
use hwplugin_common::retry::{retry_with_backoff_if, RetryConfig};
use hwplugin_common::telemetry::{init_telemetry, TelemetryConfig};
use hwplugin_common::{Error, DEFAULT_PLUGIN_ID};
use hwplugin_controller::{CallbackNotifier, Context, ControllerConfig, NodeIndex};

use controller_runner::{build_hardware_controllers, RunnerConfig};

/// Hardware plugin - reconciles allocation requests against a pool of physical hosts
#[derive(Parser, Debug)]
#[command(name = "hwplugin", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Plugin identity; only requests labelled with it are reconciled
    #[arg(long, env = "HWPLUGIN_PLUGIN_ID", default_value = DEFAULT_PLUGIN_ID)]
    plugin_id: String,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "HWPLUGIN_NAMESPACE")]
    namespace: Option<String>,

    /// Path to a kubeconfig file (in-cluster or default config when unset)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Install or update the CRDs on startup
    #[arg(long, env = "HWPLUGIN_INSTALL_CRDS")]
    install_crds: bool,

    /// Reconciles allowed to run at once per controller
    #[arg(long, env = "HWPLUGIN_CONCURRENCY", default_value_t = 8)]
    concurrency: u16,

    /// Seconds to wait for in-flight callbacks on shutdown
    #[arg(long, env = "HWPLUGIN_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [AllocationRequest::crd(), AllocatedNode::crd(), PhysicalHost::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let telemetry = init_telemetry(TelemetryConfig {
        service_name: "hwplugin-operator".to_string(),
        ..Default::default()
    })?;

    let result = run(cli).await;
    if let Err(e) = &result {
        tracing::error!(error = ?e, "operator exited with error");
    }
    telemetry.shutdown();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .context("failed to create Kubernetes client")?;

    if cli.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let (index, index_driver) = NodeIndex::start(client.clone(), &cli.plugin_id);
    let index = Arc::new(index);
    let index_task = tokio::spawn(index_driver);
    index
        .ensure_ready()
        .await
        .context("AllocatedNode index did not become ready")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let notifier = Arc::new(CallbackNotifier::new()?);
    let ctx = Arc::new(
        Context::builder(client.clone())
            .index(index)
            .notifier(notifier.clone())
            .config(ControllerConfig {
                plugin_id: cli.plugin_id.clone(),
                ..Default::default()
            })
            .cancel(cancel.clone())
            .build(),
    );

    tracing::info!(
        plugin = %cli.plugin_id,
        namespace = cli.namespace.as_deref().unwrap_or("<all>"),
        "Starting hardware plugin controllers"
    );
    let controllers = build_hardware_controllers(
        client,
        ctx,
        &RunnerConfig {
            plugin_id: cli.plugin_id,
            namespace: cli.namespace,
            concurrency: cli.concurrency,
        },
    );
    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped, draining callbacks");
    cancel.cancel();
    index_task.abort();
    let timeout = Duration::from_secs(cli.shutdown_timeout_secs);
    if !notifier.shutdown(timeout).await {
        tracing::warn!(?timeout, "callbacks still in flight at shutdown were cancelled");
    }

    tracing::info!("Hardware plugin shut down");
    Ok(())
}

/// Install the plugin CRDs, retrying transient API errors
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let retry = RetryConfig::with_max_attempts(5);
    for crd in [AllocationRequest::crd(), AllocatedNode::crd(), PhysicalHost::crd()] {
        retry_with_backoff_if(
            &retry,
            "install_crd",
            || apply_crd(client, &crd),
            Error::is_retryable,
        )
        .await?;
    }
    tracing::info!("All hardware plugin CRDs installed/updated");
    Ok(())
}

/// Cancel in-progress reconciles once SIGTERM or Ctrl-C arrives
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
