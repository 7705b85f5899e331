//! Create phase: first allocation for a request that has never been handled

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use hwplugin_common::crd::{AllocationRequest, ConditionReason, ConditionStatus, ConditionType};
use hwplugin_common::{Error, REQUEUE_SHORT};

use super::{reject_invalid_input, restart_clock, set_condition, update_status};
use crate::allocator;
use crate::controller::Context;

/// Validate the request, start the clock and claim hosts for every group
#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
pub async fn handle_create(request: &AllocationRequest, ctx: &Context) -> Result<Action, Error> {
    if let Err(e) = request.validate() {
        return reject_invalid_input(request, ctx, ConditionType::Provisioned, &e).await;
    }

    let mut status = request.status_or_default();
    restart_clock(&mut status);
    status.observed_generation = Some(request.generation());

    match allocator::allocate(request, ctx, &mut status).await {
        Ok(created) => {
            info!(created, "allocation started");
            set_condition(
                &mut status,
                ConditionType::Provisioned,
                ConditionStatus::False,
                ConditionReason::InProgress,
                "Handling creation",
            );
        }
        Err(e @ Error::InsufficientResources { .. }) => {
            warn!(error = %e, "not enough free hosts");
            set_condition(
                &mut status,
                ConditionType::Provisioned,
                ConditionStatus::False,
                ConditionReason::Failed,
                format!("Creation request failed: {e}"),
            );
        }
        Err(e) => return Err(e),
    }

    update_status(request, ctx, status).await?;
    Ok(Action::requeue(REQUEUE_SHORT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{free_host, no_members, sample_request, FakeStore};

    #[tokio::test]
    async fn invalid_request_is_rejected_without_touching_hosts() {
        let store = FakeStore::new();
        store.insert_host(free_host("host-0"));
        let mut request = sample_request("cluster-a");
        request.spec.site.clear();
        store.insert_request(request.clone());
        let ctx = Context::for_testing(store.clone(), store.clone(), no_members());

        let action = handle_create(&request, &ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let stored = store.request("cluster-a").unwrap();
        let cond = stored.condition(ConditionType::Provisioned).unwrap();
        assert!(cond.has_reason(ConditionReason::InvalidInput));
        assert_eq!(stored.observed_generation(), 1);
        assert!(store.nodes().is_empty());
        assert!(!store.host("host-0").is_allocated());
    }

    #[tokio::test]
    async fn successful_allocation_starts_the_clock() {
        let store = FakeStore::new();
        for i in 0..3 {
            store.insert_host(free_host(&format!("host-{i}")));
        }
        let request = sample_request("cluster-a");
        store.insert_request(request.clone());
        let ctx = Context::for_testing(store.clone(), store.clone(), no_members());

        let action = handle_create(&request, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_SHORT));

        let stored = store.request("cluster-a").unwrap();
        let status = stored.status.unwrap();
        assert!(status.hardware_operation_start_time.is_some());
        assert_eq!(status.properties.node_names.len(), 3);
        let cond = status.condition(ConditionType::Provisioned).unwrap();
        assert_eq!(cond.message, "Handling creation");
    }
}
