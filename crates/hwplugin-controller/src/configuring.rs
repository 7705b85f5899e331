//! Rolling hardware profile updates after a request is edited
//!
//! One node is updated at a time. The node carrying the in-progress
//! annotation is checked first; only when none is in flight is the next
//! node that still needs the group's profile started. A node that failed
//! keeps its failure and the rollout moves on to the rest. Nodes are visited in
//! name order so the rollout is deterministic across reconciles.

use std::time::Duration;

use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use hwplugin_common::crd::{
    conditions, AllocatedNode, AllocationRequest, ConditionReason, ConditionStatus, ConditionType,
    NodeGroup, PhysicalHost, ProvisioningState,
};
use hwplugin_common::{
    Error, CONFIG_IN_PROGRESS_ANNOTATION, REQUEUE_IMMEDIATE, REQUEUE_MEDIUM,
};

use crate::controller::Context;
use crate::progress::{clear_error_timestamp, host_error_exceeded};
use crate::readiness::{check_readiness, Readiness};

/// What the rollout wants next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigStep {
    /// A node is mid-update; check back after the delay
    Requeue(Duration),
    /// No node needs work; aggregate the per-node results
    Continue,
}

/// Advance the rollout by at most one node transition
pub async fn drive(
    request: &AllocationRequest,
    nodes: &[AllocatedNode],
    ctx: &Context,
) -> Result<ConfigStep, Error> {
    let mut active: Vec<&AllocatedNode> = nodes.iter().filter(|n| !n.is_deleting()).collect();
    active.sort_by_key(|n| n.name_any());

    if let Some(node) = active.iter().find(|n| n.config_in_progress()) {
        return check_in_flight(request, node, ctx).await;
    }

    for node in active {
        let group = request.group(&node.spec.group_name).ok_or_else(|| {
            Error::validation_for(
                request.name_any(),
                format!(
                    "node group {} of AllocatedNode {} no longer exists",
                    node.spec.group_name,
                    node.name_any()
                ),
            )
        })?;

        let needs_config = node
            .condition(ConditionType::Configured)
            .map_or(true, |c| c.has_reason(ConditionReason::InvalidInput));
        if node.spec.hw_profile != group.hw_profile || needs_config {
            return start_update(node, group, ctx).await;
        }
    }

    Ok(ConfigStep::Continue)
}

fn applied_profile(host: &PhysicalHost) -> Option<&str> {
    host.status.as_ref().and_then(|s| s.applied_profile.as_deref())
}

async fn start_update(
    node: &AllocatedNode,
    group: &NodeGroup,
    ctx: &Context,
) -> Result<ConfigStep, Error> {
    ctx.ensure_active("configuration")?;

    let host_ref = &node.spec.host_ref;
    let host = ctx
        .reader
        .get_host(host_ref)
        .await?
        .ok_or_else(|| Error::host(host_ref.to_string(), "host not found"))?;
    let namespace = node.namespace().unwrap_or_default();
    let name = node.name_any();
    let already_applied = applied_profile(&host) == Some(group.hw_profile.as_str());

    let mut node_patch = json!({"spec": {"hwProfile": group.hw_profile}});
    if !already_applied {
        node_patch["metadata"] = json!({"annotations": {CONFIG_IN_PROGRESS_ANNOTATION: "true"}});
    }
    ctx.writer.patch_node(&namespace, &name, &node_patch).await?;
    ctx.writer
        .patch_host(host_ref, &json!({"spec": {"hardwareProfile": group.hw_profile}}))
        .await?;

    let mut status = node.status_or_default();
    if already_applied {
        conditions::set(
            &mut status.conditions,
            ConditionType::Configured,
            ConditionStatus::True,
            ConditionReason::ConfigApplied,
            "ConfigSuccess",
        );
        status.hw_profile = Some(group.hw_profile.clone());
        ctx.writer.patch_node_status(&namespace, &name, &status).await?;
        debug!(node = %name, profile = %group.hw_profile, "profile already applied");
        return Ok(ConfigStep::Requeue(REQUEUE_IMMEDIATE));
    }

    conditions::set(
        &mut status.conditions,
        ConditionType::Configured,
        ConditionStatus::False,
        ConditionReason::ConfigUpdate,
        "Update Requested",
    );
    ctx.writer.patch_node_status(&namespace, &name, &status).await?;
    info!(node = %name, host = %host_ref, profile = %group.hw_profile, "profile update requested");
    Ok(ConfigStep::Requeue(REQUEUE_MEDIUM))
}

async fn check_in_flight(
    request: &AllocationRequest,
    node: &AllocatedNode,
    ctx: &Context,
) -> Result<ConfigStep, Error> {
    let host_ref = &node.spec.host_ref;
    let host = ctx
        .reader
        .get_host(host_ref)
        .await?
        .ok_or_else(|| Error::host(host_ref.to_string(), "host not found"))?;

    if host.state() == ProvisioningState::Error {
        if host_error_exceeded(&host, ctx).await? {
            warn!(node = %node.name_any(), host = %host_ref, "host failed while servicing");
            finish_node(
                node,
                ctx,
                ConditionStatus::False,
                ConditionReason::Failed,
                "host servicing error",
            )
            .await?;
            return Ok(ConfigStep::Requeue(REQUEUE_IMMEDIATE));
        }
        return Ok(ConfigStep::Requeue(REQUEUE_MEDIUM));
    }
    clear_error_timestamp(&host, ctx).await?;

    if applied_profile(&host) != Some(node.spec.hw_profile.as_str()) {
        debug!(node = %node.name_any(), "waiting for host to apply profile");
        return Ok(ConfigStep::Requeue(REQUEUE_MEDIUM));
    }

    if host.state() == ProvisioningState::Provisioned && request.callback_url().is_some() {
        if let Readiness::NotReady(reason) =
            check_readiness(ctx.members.as_ref(), request, node).await?
        {
            debug!(node = %node.name_any(), %reason, "waiting for member node after update");
            return Ok(ConfigStep::Requeue(REQUEUE_MEDIUM));
        }
    }

    finish_node(
        node,
        ctx,
        ConditionStatus::True,
        ConditionReason::ConfigApplied,
        "ConfigSuccess",
    )
    .await?;
    info!(node = %node.name_any(), profile = %node.spec.hw_profile, "profile applied");
    Ok(ConfigStep::Requeue(REQUEUE_IMMEDIATE))
}

/// Record the outcome on the node and drop the in-progress marker
async fn finish_node(
    node: &AllocatedNode,
    ctx: &Context,
    status: ConditionStatus,
    reason: ConditionReason,
    message: &str,
) -> Result<(), Error> {
    let namespace = node.namespace().unwrap_or_default();
    let name = node.name_any();

    let mut node_status = node.status_or_default();
    conditions::set(
        &mut node_status.conditions,
        ConditionType::Configured,
        status,
        reason,
        message,
    );
    if status == ConditionStatus::True {
        node_status.hw_profile = Some(node.spec.hw_profile.clone());
    }
    ctx.writer
        .patch_node_status(&namespace, &name, &node_status)
        .await?;
    ctx.writer
        .patch_node(
            &namespace,
            &name,
            &json!({"metadata": {"annotations": {CONFIG_IN_PROGRESS_ANNOTATION: null}}}),
        )
        .await
}

/// Fold per-node Configured conditions into the request's condition
pub fn aggregate(nodes: &[AllocatedNode]) -> (ConditionStatus, ConditionReason, String) {
    let mut pending: Vec<(ConditionReason, String)> = Vec::new();

    let mut active: Vec<&AllocatedNode> = nodes.iter().filter(|n| !n.is_deleting()).collect();
    active.sort_by_key(|n| n.name_any());

    for node in active {
        let name = node.name_any();
        match node.condition(ConditionType::Configured) {
            None => pending.push((
                ConditionReason::InProgress,
                format!("Node {name} missing Configured condition"),
            )),
            Some(c) if c.is_true() => {}
            Some(c) => pending.push((
                ConditionReason::parse(&c.reason).unwrap_or(ConditionReason::InProgress),
                format!("AllocatedNode {name}: {}", c.message),
            )),
        }
    }

    let Some((first, _)) = pending.first() else {
        return (
            ConditionStatus::True,
            ConditionReason::ConfigApplied,
            "ConfigSuccess".to_string(),
        );
    };

    let reason = pending
        .iter()
        .map(|(r, _)| *r)
        .find(ConditionReason::is_terminal_failure)
        .unwrap_or(*first);
    let message = pending
        .iter()
        .map(|(_, m)| m.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    (ConditionStatus::False, reason, message)
}
