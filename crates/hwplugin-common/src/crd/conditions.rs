//! Find and upsert helpers over ordered condition lists
//!
//! Conditions stay in insertion order. An upsert only moves
//! `lastTransitionTime` when the status itself changes, so repeated
//! reconciles that re-assert the same state do not churn the timestamp.

use super::types::{Condition, ConditionReason, ConditionStatus, ConditionType};

/// Find a condition by type
pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

/// Insert or replace the condition with the same type.
///
/// Returns true when anything observable changed.
pub fn upsert(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return false;
            }
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Build and upsert a condition in one step
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: ConditionReason,
    message: impl Into<String>,
) -> bool {
    upsert(conditions, Condition::new(type_, status, reason, message))
}

/// True when the condition exists and is `True`
pub fn is_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find(conditions, type_).is_some_and(Condition::is_true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn provisioned(status: ConditionStatus, reason: ConditionReason, msg: &str) -> Condition {
        Condition::new(ConditionType::Provisioned, status, reason, msg)
    }

    #[test]
    fn upsert_appends_new_types_in_order() {
        let mut conditions = Vec::new();
        assert!(set(
            &mut conditions,
            ConditionType::Provisioned,
            ConditionStatus::True,
            ConditionReason::Completed,
            "Created",
        ));
        assert!(set(
            &mut conditions,
            ConditionType::Configured,
            ConditionStatus::False,
            ConditionReason::ConfigUpdate,
            "AwaitConfig",
        ));

        let types: Vec<_> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["Provisioned", "Configured"]);
    }

    #[test]
    fn upsert_is_noop_for_identical_condition() {
        let mut conditions = vec![provisioned(
            ConditionStatus::False,
            ConditionReason::InProgress,
            "AwaitConfig",
        )];
        let changed = upsert(
            &mut conditions,
            provisioned(ConditionStatus::False, ConditionReason::InProgress, "AwaitConfig"),
        );
        assert!(!changed);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn upsert_keeps_transition_time_when_status_unchanged() {
        let earlier = Utc::now() - Duration::minutes(10);
        let mut first = provisioned(ConditionStatus::False, ConditionReason::InProgress, "Handling creation");
        first.last_transition_time = earlier;
        let mut conditions = vec![first];

        assert!(upsert(
            &mut conditions,
            provisioned(ConditionStatus::False, ConditionReason::InProgress, "AwaitConfig"),
        ));
        assert_eq!(conditions[0].message, "AwaitConfig");
        assert_eq!(conditions[0].last_transition_time, earlier);
    }

    #[test]
    fn upsert_moves_transition_time_when_status_changes() {
        let earlier = Utc::now() - Duration::minutes(10);
        let mut first = provisioned(ConditionStatus::False, ConditionReason::InProgress, "AwaitConfig");
        first.last_transition_time = earlier;
        let mut conditions = vec![first];

        upsert(
            &mut conditions,
            provisioned(ConditionStatus::True, ConditionReason::Completed, "Created"),
        );
        assert!(conditions[0].last_transition_time > earlier);
        assert!(is_true(&conditions, ConditionType::Provisioned));
    }

    #[test]
    fn find_missing_type_returns_none() {
        let conditions = vec![provisioned(
            ConditionStatus::True,
            ConditionReason::Completed,
            "Created",
        )];
        assert!(find(&conditions, ConditionType::Configured).is_none());
        assert!(!is_true(&conditions, ConditionType::Configured));
    }
}
