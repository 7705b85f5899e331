//! Per-node provisioning progress
//!
//! Looks at the host behind an AllocatedNode and decides whether the node
//! is ready, still waiting, or failed. A host reporting an error gets a
//! grace period before the failure is believed: the first sighting is
//! stamped on the host and only errors older than the tolerance count.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use hwplugin_common::crd::{
    conditions, AllocatedNode, AllocationRequest, ConditionReason, ConditionStatus, ConditionType,
    PhysicalHost, ProvisioningState,
};
use hwplugin_common::{Error, ERROR_TIMESTAMP_ANNOTATION};

use crate::controller::Context;
use crate::readiness::{check_readiness, Readiness};

/// Where one AllocatedNode stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeProgress {
    /// Provisioned and, when a callback is configured, joined its cluster
    Ready,
    /// Still converging
    Waiting(String),
    /// The host failed past its error tolerance
    Failed(String),
}

/// Evaluate one node and persist its Provisioned condition when it settles
pub async fn evaluate_node(
    request: &AllocationRequest,
    node: &AllocatedNode,
    ctx: &Context,
) -> Result<NodeProgress, Error> {
    if node
        .condition(ConditionType::Provisioned)
        .is_some_and(|c| c.is_true())
    {
        return Ok(NodeProgress::Ready);
    }

    let host_ref = &node.spec.host_ref;
    let host = ctx
        .reader
        .get_host(host_ref)
        .await?
        .ok_or_else(|| Error::host(host_ref.to_string(), "host not found"))?;

    let state = host.state();
    if state == ProvisioningState::Error {
        if !host_error_exceeded(&host, ctx).await? {
            return Ok(NodeProgress::Waiting("host reporting an error".to_string()));
        }
        let message = host
            .status
            .as_ref()
            .and_then(|s| s.error_message.clone())
            .unwrap_or_else(|| "host in error state".to_string());
        warn!(node = %node.name_any(), host = %host_ref, %message, "host failed");
        mark_node(node, ctx, ConditionStatus::False, ConditionReason::Failed, &message).await?;
        return Ok(NodeProgress::Failed(message));
    }
    clear_error_timestamp(&host, ctx).await?;

    if state != ProvisioningState::Provisioned {
        return Ok(NodeProgress::Waiting(format!("host is {state:?}")));
    }
    if node.config_in_progress() {
        return Ok(NodeProgress::Waiting("configuration in progress".to_string()));
    }
    if !host.profile_applied() {
        return Ok(NodeProgress::Waiting(
            "hardware profile not yet applied".to_string(),
        ));
    }

    if request.callback_url().is_some() {
        if let Readiness::NotReady(reason) =
            check_readiness(ctx.members.as_ref(), request, node).await?
        {
            return Ok(NodeProgress::Waiting(reason));
        }
    }

    let mut status = node.status_or_default();
    conditions::set(
        &mut status.conditions,
        ConditionType::Provisioned,
        ConditionStatus::True,
        ConditionReason::Completed,
        "Provisioned",
    );
    if let Some(host_status) = &host.status {
        status.hostname = host_status.hostname.clone();
        status.boot_mac_address = host_status.boot_mac_address.clone();
    }
    status.hw_profile = Some(node.spec.hw_profile.clone());
    ctx.writer
        .patch_node_status(&node.namespace().unwrap_or_default(), &node.name_any(), &status)
        .await?;
    info!(node = %node.name_any(), host = %host_ref, "node provisioned");
    Ok(NodeProgress::Ready)
}

async fn mark_node(
    node: &AllocatedNode,
    ctx: &Context,
    status: ConditionStatus,
    reason: ConditionReason,
    message: &str,
) -> Result<(), Error> {
    let mut node_status = node.status_or_default();
    if conditions::set(
        &mut node_status.conditions,
        ConditionType::Provisioned,
        status,
        reason,
        message,
    ) {
        ctx.writer
            .patch_node_status(
                &node.namespace().unwrap_or_default(),
                &node.name_any(),
                &node_status,
            )
            .await?;
    }
    Ok(())
}

/// Whether a host in error has stayed there longer than the tolerance.
///
/// The first sighting stamps the host and returns false.
pub(crate) async fn host_error_exceeded(host: &PhysicalHost, ctx: &Context) -> Result<bool, Error> {
    let first_seen = host
        .annotations()
        .get(ERROR_TIMESTAMP_ANNOTATION)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));

    let Some(first_seen) = first_seen else {
        debug!(host = %host.object_ref(), "host error first observed");
        let patch = json!({
            "metadata": {"annotations": {ERROR_TIMESTAMP_ANNOTATION: Utc::now().to_rfc3339()}}
        });
        ctx.writer.patch_host(&host.object_ref(), &patch).await?;
        return Ok(false);
    };

    let elapsed = Utc::now()
        .signed_duration_since(first_seen)
        .to_std()
        .unwrap_or_default();
    Ok(elapsed >= ctx.config.host_error_tolerance)
}

/// Drop a stale error stamp once the host has recovered
pub(crate) async fn clear_error_timestamp(host: &PhysicalHost, ctx: &Context) -> Result<(), Error> {
    if !host.annotations().contains_key(ERROR_TIMESTAMP_ANNOTATION) {
        return Ok(());
    }
    let patch = json!({"metadata": {"annotations": {ERROR_TIMESTAMP_ANNOTATION: null}}});
    ctx.writer.patch_host(&host.object_ref(), &patch).await
}
