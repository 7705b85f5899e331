//! SpecChanged phase: roll a new hardware profile across provisioned nodes

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

use hwplugin_common::crd::{
    AllocationRequest, AllocationRequestStatus, ConditionReason, ConditionStatus, ConditionType,
};
use hwplugin_common::{Error, REQUEUE_SHORT};

use super::{reject_invalid_input, restart_clock, set_condition, update_status};
use crate::configuring::{self, ConfigStep};
use crate::controller::Context;

/// Whether a new generation should open a fresh configuration cycle
fn needs_reseed(status: &AllocationRequestStatus) -> bool {
    match status.condition(ConditionType::Configured) {
        None => true,
        Some(c) if c.is_true() => true,
        Some(c) => ConditionReason::parse(&c.reason).is_some_and(|r| r.is_terminal_failure()),
    }
}

/// Drive the rollout one step and fold node results into `Configured`
#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
pub async fn handle_spec_changed(
    request: &AllocationRequest,
    ctx: &Context,
) -> Result<Action, Error> {
    if let Err(e) = request.validate() {
        return reject_invalid_input(request, ctx, ConditionType::Configured, &e).await;
    }

    let mut status = request.status_or_default();
    if needs_reseed(&status) {
        info!(generation = request.generation(), "starting configuration cycle");
        set_condition(
            &mut status,
            ConditionType::Configured,
            ConditionStatus::False,
            ConditionReason::ConfigUpdate,
            "AwaitConfig",
        );
        restart_clock(&mut status);
    }

    let namespace = request.namespace().unwrap_or_default();
    let name = request.name_any();
    let nodes = ctx.reader.list_nodes(&namespace, &name).await?;

    match configuring::drive(request, &nodes, ctx).await {
        Ok(ConfigStep::Requeue(after)) => {
            update_status(request, ctx, status).await?;
            return Ok(Action::requeue(after));
        }
        Ok(ConfigStep::Continue) => {}
        Err(e) if e.is_input_error() => {
            return reject_invalid_input(request, ctx, ConditionType::Configured, &e).await;
        }
        Err(e) => {
            update_status(request, ctx, status).await?;
            return Err(e);
        }
    }

    let nodes = ctx.reader.list_nodes(&namespace, &name).await?;
    let (condition_status, reason, message) = configuring::aggregate(&nodes);
    set_condition(
        &mut status,
        ConditionType::Configured,
        condition_status,
        reason,
        message,
    );

    if condition_status == ConditionStatus::True || reason.is_terminal_failure() {
        info!(%reason, "configuration cycle settled");
        status.observed_generation = Some(request.generation());
        status.hardware_operation_start_time = None;
        update_status(request, ctx, status).await?;
        return Ok(Action::await_change());
    }

    update_status(request, ctx, status).await?;
    Ok(Action::requeue(REQUEUE_SHORT))
}
