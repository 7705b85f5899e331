//! AllocationRequest controller implementation
//!
//! Reconciliation is level-triggered: every pass reads the request and its
//! AllocatedNodes, classifies what the request needs and runs one step of
//! that phase. All state lives on the objects themselves, so passes for
//! different requests run concurrently without shared locks and a repeated
//! or reordered pass converges to the same result.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use hwplugin_common::crd::AllocationRequest;
use hwplugin_common::{
    Error, DEFAULT_PLUGIN_ID, HOST_ERROR_TOLERANCE, REQUEST_FINALIZER, REQUEUE_CONFLICT,
    REQUEUE_IMMEDIATE, REQUEUE_LONG, REQUEUE_MEDIUM, REQUEUE_SHORT,
};

use crate::callback::StatusNotifier;
use crate::classifier::{classify, RequestAction};
use crate::index::NodeIndex;
use crate::phases::{handle_create, handle_processing, handle_spec_changed};
use crate::readiness::{KubeMemberClusters, MemberClusterAccess};
use crate::store::{HardwareReader, HardwareWriter, KubeHardwareStore};
use crate::timeout::check_hardware_timeout;

/// Tunables shared by both controllers
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Identity value this plugin stamps on and filters requests by
    pub plugin_id: String,
    /// How long a host may report an error before it is believed
    pub host_error_tolerance: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            plugin_id: DEFAULT_PLUGIN_ID.to_string(),
            host_error_tolerance: HOST_ERROR_TOLERANCE,
        }
    }
}

/// Controller context containing shared state and clients
///
/// Store access is split into narrow reader and writer traits so handlers
/// declare what they touch and tests can substitute an in-memory store.
pub struct Context {
    /// Read access to requests, nodes and hosts
    pub reader: Arc<dyn HardwareReader>,
    /// Write access to requests, nodes and hosts
    pub writer: Arc<dyn HardwareWriter>,
    /// Hub and member cluster lookups for readiness checks
    pub members: Arc<dyn MemberClusterAccess>,
    /// Callback delivery, `None` disables callbacks
    pub notifier: Option<Arc<dyn StatusNotifier>>,
    /// Controller tunables
    pub config: ControllerConfig,
    /// Cancelled when the process is shutting down
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom store and member access
    #[cfg(test)]
    pub fn for_testing(
        reader: Arc<dyn HardwareReader>,
        writer: Arc<dyn HardwareWriter>,
        members: Arc<dyn MemberClusterAccess>,
    ) -> Self {
        Self {
            reader,
            writer,
            members,
            notifier: None,
            config: ControllerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Fail with a retryable error once shutdown has begun.
    ///
    /// Called before each write that would leave partial state behind.
    pub fn ensure_active(&self, step: &str) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(step));
        }
        Ok(())
    }
}

/// Builder for creating a Context with optional overrides
pub struct ContextBuilder {
    client: Client,
    index: Option<Arc<NodeIndex>>,
    reader: Option<Arc<dyn HardwareReader>>,
    writer: Option<Arc<dyn HardwareWriter>>,
    members: Option<Arc<dyn MemberClusterAccess>>,
    notifier: Option<Arc<dyn StatusNotifier>>,
    config: ControllerConfig,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            index: None,
            reader: None,
            writer: None,
            members: None,
            notifier: None,
            config: ControllerConfig::default(),
            cancel: None,
        }
    }

    /// Serve node lookups from a shared reverse index
    pub fn index(mut self, index: Arc<NodeIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Override the store reader
    pub fn reader(mut self, reader: Arc<dyn HardwareReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Override the store writer
    pub fn writer(mut self, writer: Arc<dyn HardwareWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Override member cluster access
    pub fn members(mut self, members: Arc<dyn MemberClusterAccess>) -> Self {
        self.members = Some(members);
        self
    }

    /// Deliver condition changes to request callbacks
    pub fn notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set controller tunables
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share the process shutdown token
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let mut store = KubeHardwareStore::new(self.client.clone());
        if let Some(index) = self.index {
            store = store.with_index(index);
        }
        let store = Arc::new(store);

        Context {
            reader: self
                .reader
                .unwrap_or_else(|| store.clone() as Arc<dyn HardwareReader>),
            writer: self.writer.unwrap_or(store as Arc<dyn HardwareWriter>),
            members: self
                .members
                .unwrap_or_else(|| Arc::new(KubeMemberClusters::new(self.client.clone()))),
            notifier: self.notifier,
            config: self.config,
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

/// Reconcile an AllocationRequest
///
/// Deletion is handled first, then the hardware timeout guard, then the
/// finalizer, and finally the phase the classifier picks. Each pass does
/// at most one phase step.
#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
pub async fn reconcile(
    request: Arc<AllocationRequest>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    if request.plugin_id() != Some(ctx.config.plugin_id.as_str()) {
        debug!("request belongs to another plugin");
        return Ok(Action::await_change());
    }
    ctx.ensure_active("reconcile")?;

    if request.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&request, &ctx).await;
    }

    if let Some(action) = check_hardware_timeout(&request, &ctx).await? {
        return Ok(action);
    }

    if !has_finalizer(&request) {
        info!("adding finalizer");
        ctx.writer
            .add_request_finalizer(&request, REQUEST_FINALIZER)
            .await?;
        return Ok(Action::requeue(REQUEUE_IMMEDIATE));
    }

    let action = classify(&request);
    debug!(?action, "classified request");
    match action {
        RequestAction::Create => handle_create(&request, &ctx).await,
        RequestAction::Processing => handle_processing(&request, &ctx).await,
        RequestAction::SpecChanged => handle_spec_changed(&request, &ctx).await,
        RequestAction::Noop => Ok(Action::await_change()),
    }
}

/// Error policy for the controller
///
/// Conflicts retry quickly, deletions at the active-work interval and
/// transient failures at the status-retry interval. Anything else waits
/// longer since it needs an outside change.
pub fn error_policy(request: Arc<AllocationRequest>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        request = %request.name_any(),
        "reconciliation failed"
    );

    if error.is_conflict() {
        Action::requeue(REQUEUE_CONFLICT)
    } else if request.metadata.deletion_timestamp.is_some() {
        Action::requeue(REQUEUE_SHORT)
    } else if error.is_retryable() {
        Action::requeue(REQUEUE_MEDIUM)
    } else {
        Action::requeue(REQUEUE_LONG)
    }
}

fn has_finalizer(request: &AllocationRequest) -> bool {
    request
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.contains(&REQUEST_FINALIZER.to_string()))
}

/// Release every node, then let the request go.
///
/// Nodes carry their own finalizer and are released by the AllocatedNode
/// controller; this side only asks for their deletion and waits until none
/// remain.
async fn handle_deletion(request: &AllocationRequest, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(request) {
        return Ok(Action::await_change());
    }

    let namespace = request.namespace().unwrap_or_default();
    let nodes = ctx
        .reader
        .list_nodes(&namespace, &request.name_any())
        .await?;

    if nodes.is_empty() {
        info!("all nodes released, removing finalizer");
        ctx.writer
            .remove_request_finalizer(request, REQUEST_FINALIZER)
            .await?;
        return Ok(Action::await_change());
    }

    for node in nodes.iter().filter(|n| !n.is_deleting()) {
        ctx.ensure_active("deletion")?;
        info!(node = %node.name_any(), "deleting allocated node");
        ctx.writer.delete_node(&namespace, &node.name_any()).await?;
    }
    debug!(remaining = nodes.len(), "waiting for nodes to be released");
    Ok(Action::requeue(REQUEUE_SHORT))
}
