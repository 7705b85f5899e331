//! Decides which phase handler a request needs
//!
//! Pure and cheap: it only reads the request's conditions and generations,
//! so it runs on every reconcile.

use hwplugin_common::crd::{AllocationRequest, ConditionReason, ConditionType};

/// Phase handler selected for a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestAction {
    /// Never reconciled: select and claim hosts
    Create,
    /// Allocation under way: keep allocating and monitor progress
    Processing,
    /// Edited after completion: re-apply the profile to every node
    SpecChanged,
    /// Nothing to do until the request changes
    Noop,
}

/// Classify a request by its Provisioned condition and generations
///
/// A `Failed` request stays in Processing so allocation resumes once hosts
/// free up; only `TimedOut` and `InvalidInput` park it until the next edit.
pub fn classify(request: &AllocationRequest) -> RequestAction {
    let Some(provisioned) = request.condition(ConditionType::Provisioned) else {
        return RequestAction::Create;
    };

    let spec_applied = request.observed_generation() == request.generation();

    if !provisioned.is_true() {
        // Timeouts and invalid input are final for the generation that caused them
        let terminal = provisioned.has_reason(ConditionReason::TimedOut)
            || provisioned.has_reason(ConditionReason::InvalidInput);
        if terminal && spec_applied {
            return RequestAction::Noop;
        }
        return RequestAction::Processing;
    }

    if !spec_applied {
        return RequestAction::SpecChanged;
    }

    RequestAction::Noop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{request_with, sample_request};
    use hwplugin_common::crd::{Condition, ConditionStatus};

    fn provisioned(status: ConditionStatus, reason: ConditionReason) -> Condition {
        Condition::new(ConditionType::Provisioned, status, reason, "")
    }

    #[test]
    fn missing_provisioned_condition_is_create() {
        assert_eq!(classify(&sample_request("cluster-a")), RequestAction::Create);
    }

    #[test]
    fn in_progress_is_processing() {
        let req = request_with(
            vec![provisioned(ConditionStatus::False, ConditionReason::InProgress)],
            1,
            1,
        );
        assert_eq!(classify(&req), RequestAction::Processing);
    }

    #[test]
    fn failed_allocation_keeps_processing() {
        let req = request_with(
            vec![provisioned(ConditionStatus::False, ConditionReason::Failed)],
            1,
            1,
        );
        assert_eq!(classify(&req), RequestAction::Processing);
    }

    #[test]
    fn timed_out_is_terminal_until_spec_edit() {
        let cond = vec![provisioned(ConditionStatus::False, ConditionReason::TimedOut)];
        assert_eq!(classify(&request_with(cond.clone(), 2, 2)), RequestAction::Noop);
        assert_eq!(classify(&request_with(cond, 3, 2)), RequestAction::Processing);
    }

    #[test]
    fn invalid_input_is_terminal_until_spec_edit() {
        let cond = vec![provisioned(ConditionStatus::False, ConditionReason::InvalidInput)];
        assert_eq!(classify(&request_with(cond.clone(), 1, 1)), RequestAction::Noop);
        assert_eq!(classify(&request_with(cond, 2, 1)), RequestAction::Processing);
    }

    #[test]
    fn completed_with_new_generation_is_spec_changed() {
        let req = request_with(
            vec![provisioned(ConditionStatus::True, ConditionReason::Completed)],
            2,
            1,
        );
        assert_eq!(classify(&req), RequestAction::SpecChanged);
    }

    #[test]
    fn completed_and_applied_is_noop() {
        let req = request_with(
            vec![provisioned(ConditionStatus::True, ConditionReason::Completed)],
            4,
            4,
        );
        assert_eq!(classify(&req), RequestAction::Noop);
    }
}
