//! Hardware operation deadline
//!
//! Provisioning and configuration cycles share one clock on the request
//! status. When the clock runs past the request's timeout the active
//! condition is closed as TimedOut and reconciliation stops until the
//! request is edited.

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{info, warn};

use hwplugin_common::crd::{AllocationRequest, ConditionReason, ConditionStatus, ConditionType};
use hwplugin_common::{Error, CONFIG_IN_PROGRESS_ANNOTATION};

use crate::controller::Context;
use crate::phases::{reject_invalid_input, set_condition, update_status};

/// Close the running cycle if it is past its deadline.
///
/// Returns the action to take when the guard handled the request, or
/// `None` when reconciliation should carry on.
pub async fn check_hardware_timeout(
    request: &AllocationRequest,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    let provisioned_done = request
        .condition(ConditionType::Provisioned)
        .is_some_and(|c| c.is_true());

    let timeout = match request.hardware_timeout() {
        Ok(t) => t,
        Err(e) => {
            let active = if provisioned_done {
                ConditionType::Configured
            } else {
                ConditionType::Provisioned
            };
            return reject_invalid_input(request, ctx, active, &e).await.map(Some);
        }
    };

    let mut status = request.status_or_default();
    let Some(started) = status.hardware_operation_start_time else {
        return Ok(None);
    };
    let elapsed = Utc::now()
        .signed_duration_since(started)
        .to_std()
        .unwrap_or_default();
    if elapsed < timeout {
        return Ok(None);
    }

    if !provisioned_done {
        warn!(request = %request.name_any(), ?elapsed, "hardware provisioning timed out");
        set_condition(
            &mut status,
            ConditionType::Provisioned,
            ConditionStatus::False,
            ConditionReason::TimedOut,
            "Hardware provisioning timed out",
        );
    } else if request
        .condition(ConditionType::Configured)
        .is_some_and(|c| !c.is_true())
    {
        warn!(request = %request.name_any(), ?elapsed, "hardware configuration timed out");
        clear_config_markers(request, ctx).await?;
        set_condition(
            &mut status,
            ConditionType::Configured,
            ConditionStatus::False,
            ConditionReason::TimedOut,
            "Hardware configuration timed out",
        );
    } else {
        return Ok(None);
    }

    status.observed_generation = Some(request.generation());
    update_status(request, ctx, status).await?;
    Ok(Some(Action::await_change()))
}

async fn clear_config_markers(request: &AllocationRequest, ctx: &Context) -> Result<(), Error> {
    let namespace = request.namespace().unwrap_or_default();
    let patch = json!({"metadata": {"annotations": {CONFIG_IN_PROGRESS_ANNOTATION: null}}});
    for node in ctx.reader.list_nodes(&namespace, &request.name_any()).await? {
        if node.config_in_progress() {
            info!(node = %node.name_any(), "abandoning profile update");
            ctx.writer.patch_node(&namespace, &node.name_any(), &patch).await?;
        }
    }
    Ok(())
}
