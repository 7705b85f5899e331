//! Processing phase: finish allocation and wait for every node to be ready

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use hwplugin_common::crd::{AllocationRequest, ConditionReason, ConditionStatus, ConditionType};
use hwplugin_common::{Error, REQUEUE_MEDIUM, REQUEUE_SHORT};

use super::{reject_invalid_input, set_condition, start_clock, update_status};
use crate::allocator;
use crate::controller::Context;
use crate::progress::{evaluate_node, NodeProgress};

/// Resume allocation where a previous pass stopped, then poll node progress
#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
pub async fn handle_processing(
    request: &AllocationRequest,
    ctx: &Context,
) -> Result<Action, Error> {
    if let Err(e) = request.validate() {
        return reject_invalid_input(request, ctx, ConditionType::Provisioned, &e).await;
    }

    let mut status = request.status_or_default();
    start_clock(&mut status);

    match allocator::allocate(request, ctx, &mut status).await {
        Ok(0) => {}
        Ok(created) => info!(created, "resumed allocation"),
        Err(e @ Error::InsufficientResources { .. }) => {
            warn!(error = %e, "not enough free hosts");
            set_condition(
                &mut status,
                ConditionType::Provisioned,
                ConditionStatus::False,
                ConditionReason::Failed,
                format!("Creation request failed: {e}"),
            );
            update_status(request, ctx, status).await?;
            return Ok(Action::requeue(REQUEUE_SHORT));
        }
        // Transient and shutdown errors leave the request untouched
        Err(e) if e.is_retryable() => return Err(e),
        Err(e) => {
            set_condition(
                &mut status,
                ConditionType::Provisioned,
                ConditionStatus::False,
                ConditionReason::Failed,
                e.to_string(),
            );
            update_status(request, ctx, status).await?;
            return Err(e);
        }
    }

    let namespace = request.namespace().unwrap_or_default();
    let nodes = ctx.reader.list_nodes(&namespace, &request.name_any()).await?;
    let active: Vec<_> = nodes.iter().filter(|n| !n.is_deleting()).collect();

    let mut failures = Vec::new();
    let mut ready = 0;
    for node in &active {
        match evaluate_node(request, node, ctx).await? {
            NodeProgress::Ready => ready += 1,
            NodeProgress::Waiting(reason) => {
                debug!(node = %node.name_any(), %reason, "node not ready");
            }
            NodeProgress::Failed(message) => {
                failures.push(format!("AllocatedNode {}: {message}", node.name_any()));
            }
        }
    }

    if !failures.is_empty() {
        set_condition(
            &mut status,
            ConditionType::Provisioned,
            ConditionStatus::False,
            ConditionReason::Failed,
            failures.join("; "),
        );
        update_status(request, ctx, status).await?;
        return Ok(Action::requeue(REQUEUE_MEDIUM));
    }

    let groups_full = request.spec.node_group.iter().all(|group| {
        let have = active
            .iter()
            .filter(|n| n.spec.group_name == group.name)
            .count();
        have >= group.size as usize
    });

    if groups_full && ready == active.len() {
        info!(nodes = ready, "all nodes provisioned");
        set_condition(
            &mut status,
            ConditionType::Provisioned,
            ConditionStatus::True,
            ConditionReason::Completed,
            "Created",
        );
        status.observed_generation = Some(request.generation());
        update_status(request, ctx, status).await?;
        return Ok(Action::await_change());
    }

    set_condition(
        &mut status,
        ConditionType::Provisioned,
        ConditionStatus::False,
        ConditionReason::InProgress,
        "AwaitConfig",
    );
    update_status(request, ctx, status).await?;
    Ok(Action::requeue(REQUEUE_SHORT))
}
