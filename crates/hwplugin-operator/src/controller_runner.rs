//! Controller runner - builds controller futures for the hardware plugin
//!
//! Returns boxed futures that the caller composes, so controller
//! construction stays separate from process lifecycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use hwplugin_common::crd::{AllocatedNode, AllocationRequest};
use hwplugin_common::PLUGIN_LABEL;
use hwplugin_controller::{error_policy, node_error_policy, reconcile, reconcile_node, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watch scope and parallelism shared by both controllers
pub struct RunnerConfig {
    /// Plugin identity used to filter watched objects
    pub plugin_id: String,
    /// Namespace to watch, all namespaces when `None`
    pub namespace: Option<String>,
    /// Reconciles allowed to run at once per controller
    pub concurrency: u16,
}

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Build the AllocationRequest and AllocatedNode controller futures
pub fn build_hardware_controllers(
    client: Client,
    ctx: Arc<Context>,
    config: &RunnerConfig,
) -> Vec<ControllerFuture> {
    let selector = format!("{}={}", PLUGIN_LABEL, config.plugin_id);
    let watcher = || {
        WatcherConfig::default()
            .labels(&selector)
            .timeout(WATCH_TIMEOUT_SECS)
    };
    let namespace = config.namespace.as_deref();

    let requests: Api<AllocationRequest> = scoped(client.clone(), namespace);
    let owned_nodes: Api<AllocatedNode> = scoped(client.clone(), namespace);
    let nodes: Api<AllocatedNode> = scoped(client, namespace);

    tracing::info!(plugin = %config.plugin_id, "- AllocationRequest controller");
    let request_ctrl = Controller::new(requests, watcher())
        .owns(owned_nodes, watcher())
        .with_config(ControllerConfig::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("AllocationRequest"));

    tracing::info!(plugin = %config.plugin_id, "- AllocatedNode controller");
    let node_ctrl = Controller::new(nodes, watcher())
        .with_config(ControllerConfig::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile_node, node_error_policy, ctx)
        .for_each(log_reconcile_result("AllocatedNode"));

    vec![Box::pin(request_ctrl), Box::pin(node_ctrl)]
}

/// Create a closure for logging reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
