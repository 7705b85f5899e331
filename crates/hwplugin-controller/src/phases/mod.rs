//! Phase handlers for AllocationRequest reconciliation
//!
//! Each handler reads the request, drives one step of its phase and writes
//! the request status at most once. Status writes go through
//! [`update_status`], which skips no-op patches and fires callbacks for
//! condition changes.

mod create;
mod processing;
mod spec_changed;

pub use create::handle_create;
pub use processing::handle_processing;
pub use spec_changed::handle_spec_changed;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, warn};

use hwplugin_common::crd::{
    conditions, AllocationRequest, AllocationRequestStatus, ConditionReason, ConditionStatus,
    ConditionType,
};
use hwplugin_common::Error;

use crate::controller::Context;

/// Write `status` if it differs from what the request carries, then notify
/// the callback of any condition whose status or reason moved.
pub async fn update_status(
    request: &AllocationRequest,
    ctx: &Context,
    status: AllocationRequestStatus,
) -> Result<(), Error> {
    let current = request.status_or_default();
    if current == status {
        debug!("status unchanged, skipping update");
        return Ok(());
    }

    ctx.writer.patch_request_status(request, &status).await?;

    let Some(notifier) = ctx.notifier.as_ref() else {
        return Ok(());
    };
    if request.callback_url().is_none() {
        return Ok(());
    }
    for type_ in [ConditionType::Provisioned, ConditionType::Configured] {
        let Some(next) = status.condition(type_) else {
            continue;
        };
        let moved = current
            .condition(type_)
            .map_or(true, |prev| prev.status != next.status || prev.reason != next.reason);
        if moved {
            notifier.notify(request, next);
        }
    }
    Ok(())
}

/// Set a request condition and keep the hardware operation clock in step.
///
/// Success and terminal input/timeout outcomes stop the clock. Failures
/// leave it running so a stuck allocation still times out.
pub fn set_condition(
    status: &mut AllocationRequestStatus,
    type_: ConditionType,
    condition_status: ConditionStatus,
    reason: ConditionReason,
    message: impl Into<String>,
) {
    conditions::set(&mut status.conditions, type_, condition_status, reason, message);
    if matches!(
        reason,
        ConditionReason::Completed
            | ConditionReason::ConfigApplied
            | ConditionReason::TimedOut
            | ConditionReason::InvalidInput
    ) {
        status.hardware_operation_start_time = None;
    }
}

/// Start the clock unless a cycle is already being timed
pub fn start_clock(status: &mut AllocationRequestStatus) {
    status.hardware_operation_start_time.get_or_insert_with(Utc::now);
}

/// Start a fresh cycle
pub fn restart_clock(status: &mut AllocationRequestStatus) {
    status.hardware_operation_start_time = Some(Utc::now());
}

/// Record an input error on `type_` and stop until the request is edited
pub async fn reject_invalid_input(
    request: &AllocationRequest,
    ctx: &Context,
    type_: ConditionType,
    error: &Error,
) -> Result<Action, Error> {
    warn!(request = %request.name_any(), %error, "request rejected as invalid input");
    let mut status = request.status_or_default();
    set_condition(
        &mut status,
        type_,
        ConditionStatus::False,
        ConditionReason::InvalidInput,
        error.to_string(),
    );
    status.observed_generation = Some(request.generation());
    update_status(request, ctx, status).await?;
    Ok(Action::await_change())
}
