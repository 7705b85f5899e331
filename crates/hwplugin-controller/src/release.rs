//! Returning a host to the free pool
//!
//! Release is two-phase. The first pass strips ownership and deployment
//! fields and marks the host with the deallocation-complete annotation.
//! The second pass, once the inventory has caught up, powers the host off
//! and drops the bookkeeping annotations. Each pass is a single merge patch
//! so a crash between passes leaves the host in a state the next pass
//! recognises.

use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use hwplugin_common::crd::{AllocatedNode, ConditionType, PhysicalHost, ProvisioningState};
use hwplugin_common::{
    Error, BIOS_UPDATE_NEEDED_ANNOTATION, DEALLOCATION_COMPLETE_ANNOTATION,
    ERROR_TIMESTAMP_ANNOTATION, FIRMWARE_UPDATE_NEEDED_ANNOTATION, HOST_ALLOCATED_LABEL,
    HOST_ALLOCATED_NODE_LABEL, HOST_NODE_GROUP_LABEL, HOST_OWNED_BY_LABEL, INFRA_ENV_LABEL,
};

use crate::controller::Context;

/// Outcome of one release pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostRelease {
    /// The host no longer belongs to the node
    Released,
    /// Call again once the host has moved on
    Pending,
}

/// Run one pass of the release for the host bound to `node`
pub async fn release_host(node: &AllocatedNode, ctx: &Context) -> Result<HostRelease, Error> {
    let host_ref = &node.spec.host_ref;
    let Some(host) = ctx.reader.get_host(host_ref).await? else {
        debug!(host = %host_ref, "host already gone");
        return Ok(HostRelease::Released);
    };

    let bound_to = host.labels().get(HOST_ALLOCATED_NODE_LABEL);
    if bound_to.is_some_and(|n| *n != node.name_any()) {
        info!(host = %host_ref, node = %node.name_any(), "host rebound elsewhere, leaving it");
        return Ok(HostRelease::Released);
    }

    if !host.deallocation_complete() {
        ctx.writer
            .patch_host(host_ref, &deallocation_patch(&host))
            .await?;
        ctx.writer.remove_image_label(host_ref, INFRA_ENV_LABEL).await?;
        info!(host = %host_ref, "host deallocated");
        return Ok(HostRelease::Pending);
    }

    let node_provisioned = node
        .condition(ConditionType::Provisioned)
        .is_some_and(|c| c.is_true());
    if !node_provisioned && host.state() != ProvisioningState::Available {
        debug!(host = %host_ref, state = ?host.state(), "waiting for host to settle");
        return Ok(HostRelease::Pending);
    }

    ctx.writer
        .patch_host(host_ref, &finish_patch(&host))
        .await?;
    info!(host = %host_ref, "host released");
    Ok(HostRelease::Released)
}

/// First pass: drop ownership, deployment and update markers
fn deallocation_patch(host: &PhysicalHost) -> Value {
    let labels: Map<String, Value> = [
        HOST_ALLOCATED_LABEL,
        HOST_ALLOCATED_NODE_LABEL,
        HOST_OWNED_BY_LABEL,
        HOST_NODE_GROUP_LABEL,
        INFRA_ENV_LABEL,
    ]
    .into_iter()
    .map(|l| (l.to_string(), Value::Null))
    .collect();

    let mut patch = json!({
        "metadata": {
            "labels": labels,
            "annotations": {
                BIOS_UPDATE_NEEDED_ANNOTATION: null,
                FIRMWARE_UPDATE_NEEDED_ANNOTATION: null,
                DEALLOCATION_COMPLETE_ANNOTATION: "true",
            },
        },
    });

    if !host.skip_cleanup() {
        let mut spec = json!({
            "image": null,
            "customDeploy": null,
            "hardwareProfile": null,
        });
        if host.state() == ProvisioningState::Provisioned {
            spec["automatedCleaningMode"] = json!("metadata");
            spec["online"] = json!(false);
        }
        patch["spec"] = spec;
    }
    patch
}

/// Second pass: power off and drop the bookkeeping annotations
fn finish_patch(host: &PhysicalHost) -> Value {
    let mut patch = json!({
        "metadata": {
            "annotations": {
                DEALLOCATION_COMPLETE_ANNOTATION: null,
                ERROR_TIMESTAMP_ANNOTATION: null,
            },
        },
    });
    if host.spec.online && !host.skip_cleanup() {
        patch["spec"] = json!({"online": false});
    }
    patch
}
