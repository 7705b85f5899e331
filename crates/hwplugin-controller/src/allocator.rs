//! Host selection and claiming for node groups
//!
//! Groups are filled in request order. For each group the allocator first
//! rebinds hosts already labelled for it whose AllocatedNode is missing (a
//! crash between claim and create, or a stale cache), then claims free
//! hosts in name order. A claim is a resourceVersion-guarded patch, so two
//! requests racing for the same host cannot both win: the loser gets a
//! conflict and moves on to the next candidate.

use std::collections::{BTreeMap, BTreeSet};

use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument};

use hwplugin_common::crd::{
    AllocatedNode, AllocatedNodeSpec, AllocationRequest, AllocationRequestStatus, NodeGroup,
    PhysicalHost, ProvisioningState,
};
use hwplugin_common::{
    Error, HOST_ALLOCATED_LABEL, HOST_ALLOCATED_NODE_LABEL, HOST_NODE_GROUP_LABEL,
    HOST_OWNED_BY_LABEL, NODE_FINALIZER, PLUGIN_LABEL, REQUEST_LABEL, RESOURCE_POOL_LABEL,
    RESOURCE_SELECTOR_PREFIX, SITE_LABEL,
};

use crate::controller::Context;
use crate::naming::allocated_node_name;

/// Bring every node group up to its size.
///
/// Created node names are appended to `status.properties.nodeNames`.
/// Returns the number of AllocatedNodes created. Fails with
/// [`Error::InsufficientResources`] for the first group that cannot be
/// filled; groups before it keep what they claimed.
#[instrument(skip(request, ctx, status), fields(request = %request.name_any()))]
pub async fn allocate(
    request: &AllocationRequest,
    ctx: &Context,
    status: &mut AllocationRequestStatus,
) -> Result<usize, Error> {
    let namespace = request.namespace().unwrap_or_default();
    let name = request.name_any();
    let nodes = ctx.reader.list_nodes(&namespace, &name).await?;
    let existing: BTreeSet<String> = nodes.iter().map(|n| n.name_any()).collect();

    let mut created = 0;
    for group in &request.spec.node_group {
        let wanted = group.size as usize;
        let mut have = nodes
            .iter()
            .filter(|n| n.spec.group_name == group.name && !n.is_deleting())
            .count();
        if have >= wanted {
            continue;
        }

        for host in ctx.reader.list_hosts(&owned_selector(&name, group)).await? {
            if have >= wanted {
                break;
            }
            let node_name = node_name_for(request, ctx, &host);
            if existing.contains(&node_name) {
                continue;
            }
            info!(host = %host.object_ref(), node = %node_name, "rebinding claimed host");
            create_node(request, group, &host, &node_name, ctx).await?;
            record_node(status, node_name);
            have += 1;
            created += 1;
        }

        let pending = wanted.saturating_sub(have);
        if pending == 0 {
            continue;
        }

        let candidates = free_candidates(request, group, ctx).await?;
        if candidates.len() < pending {
            return Err(Error::insufficient_resources(
                &name,
                &group.name,
                candidates.len(),
                pending,
            ));
        }

        let mut claimed = 0;
        for host in candidates {
            if claimed == pending {
                break;
            }
            ctx.ensure_active("allocation")?;

            let node_name = node_name_for(request, ctx, &host);
            match ctx
                .writer
                .claim_host(&host, &claim_patch(request, group, &node_name))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    debug!(host = %host.object_ref(), "host claimed concurrently, trying next");
                    continue;
                }
                Err(e) => return Err(e),
            }
            info!(host = %host.object_ref(), node = %node_name, group = %group.name, "claimed host");

            create_node(request, group, &host, &node_name, ctx).await?;
            record_node(status, node_name);
            claimed += 1;
            created += 1;
        }

        if claimed < pending {
            return Err(Error::insufficient_resources(
                &name,
                &group.name,
                claimed,
                pending,
            ));
        }
    }

    Ok(created)
}

fn node_name_for(request: &AllocationRequest, ctx: &Context, host: &PhysicalHost) -> String {
    allocated_node_name(
        &ctx.config.plugin_id,
        &request.spec.cluster_id,
        &host.namespace().unwrap_or_default(),
        &host.name_any(),
    )
}

fn record_node(status: &mut AllocationRequestStatus, node_name: String) {
    if !status.properties.node_names.contains(&node_name) {
        status.properties.node_names.push(node_name);
    }
}

/// Selector keys without a prefix live under the plugin's selector namespace
fn qualify_selector_key(key: &str) -> String {
    if key.contains('/') {
        key.to_string()
    } else {
        format!("{RESOURCE_SELECTOR_PREFIX}{key}")
    }
}

fn qualified_selector(group: &NodeGroup) -> BTreeMap<String, String> {
    group
        .resource_selector
        .iter()
        .map(|(k, v)| (qualify_selector_key(k), v.clone()))
        .collect()
}

/// Labels of hosts this request already claimed for a group
fn owned_selector(request: &str, group: &NodeGroup) -> BTreeMap<String, String> {
    BTreeMap::from([
        (HOST_ALLOCATED_LABEL.to_string(), "true".to_string()),
        (HOST_OWNED_BY_LABEL.to_string(), request.to_string()),
        (HOST_NODE_GROUP_LABEL.to_string(), group.name.clone()),
    ])
}

/// Free hosts matching a group, in namespace/name order
async fn free_candidates(
    request: &AllocationRequest,
    group: &NodeGroup,
    ctx: &Context,
) -> Result<Vec<PhysicalHost>, Error> {
    let selector = qualified_selector(group);
    let mut labels = selector.clone();
    labels.insert(SITE_LABEL.to_string(), request.spec.site.clone());
    if let Some(pool) = &group.resource_pool_id {
        labels.insert(RESOURCE_POOL_LABEL.to_string(), pool.clone());
    }

    let mut hosts: Vec<PhysicalHost> = ctx
        .reader
        .list_hosts(&labels)
        .await?
        .into_iter()
        .filter(|h| is_free(h))
        .filter(|h| {
            h.matches(
                &request.spec.site,
                group.resource_pool_id.as_deref(),
                &selector,
                &group.hw_profile,
            )
        })
        .collect();
    hosts.sort_by_key(|h| (h.namespace().unwrap_or_default(), h.name_any()));
    Ok(hosts)
}

fn is_free(host: &PhysicalHost) -> bool {
    !host.is_allocated()
        && host.state() == ProvisioningState::Available
        && !host.deallocation_complete()
        && host.metadata.deletion_timestamp.is_none()
}

/// Labels binding a host to a node, plus the profile it should converge to
fn claim_patch(request: &AllocationRequest, group: &NodeGroup, node_name: &str) -> serde_json::Value {
    json!({
        "metadata": {
            "labels": {
                HOST_ALLOCATED_LABEL: "true",
                HOST_ALLOCATED_NODE_LABEL: node_name,
                HOST_OWNED_BY_LABEL: request.name_any(),
                HOST_NODE_GROUP_LABEL: group.name,
            }
        },
        "spec": {
            "hardwareProfile": group.hw_profile,
        }
    })
}

async fn create_node(
    request: &AllocationRequest,
    group: &NodeGroup,
    host: &PhysicalHost,
    node_name: &str,
    ctx: &Context,
) -> Result<(), Error> {
    let mut node = AllocatedNode::new(
        node_name,
        AllocatedNodeSpec {
            allocation_request: request.name_any(),
            group_name: group.name.clone(),
            hw_profile: group.hw_profile.clone(),
            host_ref: host.object_ref(),
        },
    );
    node.metadata.namespace = request.namespace();
    node.metadata.labels = Some(BTreeMap::from([
        (PLUGIN_LABEL.to_string(), ctx.config.plugin_id.clone()),
        (REQUEST_LABEL.to_string(), request.name_any()),
    ]));
    node.metadata.finalizers = Some(vec![NODE_FINALIZER.to_string()]);
    node.metadata.owner_references = request.controller_owner_ref(&()).map(|r| vec![r]);

    ctx.writer.create_node(&node).await
}
