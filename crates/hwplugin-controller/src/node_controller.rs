//! AllocatedNode controller
//!
//! Owns the node finalizer: a deleted node keeps it until its host has been
//! released. Nodes whose request disappeared without running its own
//! cleanup are deleted here so their hosts are not leaked.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use hwplugin_common::crd::AllocatedNode;
use hwplugin_common::{Error, NODE_FINALIZER, REQUEUE_SHORT};

use crate::controller::Context;
use crate::release::{release_host, HostRelease};

/// Reconcile an AllocatedNode
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile_node(node: Arc<AllocatedNode>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = node.namespace().unwrap_or_default();

    if node.is_deleting() {
        if !has_finalizer(&node) {
            return Ok(Action::await_change());
        }
        ctx.ensure_active("host release")?;
        return match release_host(&node, &ctx).await? {
            HostRelease::Released => {
                info!("host released, removing finalizer");
                ctx.writer
                    .remove_node_finalizer(&node, NODE_FINALIZER)
                    .await?;
                Ok(Action::await_change())
            }
            HostRelease::Pending => Ok(Action::requeue(REQUEUE_SHORT)),
        };
    }

    let request = ctx
        .reader
        .get_request(&namespace, node.request_name())
        .await?;
    if request.is_none() {
        info!(request = %node.request_name(), "owning request is gone, deleting node");
        ctx.writer.delete_node(&namespace, &node.name_any()).await?;
        return Ok(Action::requeue(REQUEUE_SHORT));
    }

    debug!("node bound to a live request");
    Ok(Action::await_change())
}

/// Error policy for the AllocatedNode controller
pub fn node_error_policy(node: Arc<AllocatedNode>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        node = %node.name_any(),
        "reconciliation failed"
    );
    Action::requeue(REQUEUE_SHORT)
}

fn has_finalizer(node: &AllocatedNode) -> bool {
    node.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.contains(&NODE_FINALIZER.to_string()))
}
