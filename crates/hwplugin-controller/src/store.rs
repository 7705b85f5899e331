//! Narrow read and write access to the object store
//!
//! Handlers take these traits instead of a raw client so every dependency is
//! visible at the call site and can be mocked in tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use hwplugin_common::crd::{
    AllocatedNode, AllocatedNodeStatus, AllocationRequest, AllocationRequestStatus, ObjectRef,
    PhysicalHost,
};
use hwplugin_common::kube_utils::ok_if_not_found;
use hwplugin_common::{Error, FIELD_MANAGER, REQUEST_LABEL};

use crate::index::NodeIndex;

/// Read access to requests, allocated nodes and hosts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HardwareReader: Send + Sync {
    /// Get an AllocationRequest, `None` if it no longer exists
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AllocationRequest>, Error>;

    /// List the AllocatedNodes owned by a request (reverse index lookup)
    async fn list_nodes(&self, namespace: &str, request: &str)
        -> Result<Vec<AllocatedNode>, Error>;

    /// List hosts in all namespaces carrying every given label
    async fn list_hosts(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PhysicalHost>, Error>;

    /// Get a host, `None` if it no longer exists
    async fn get_host(&self, host: &ObjectRef) -> Result<Option<PhysicalHost>, Error>;
}

/// Write access to requests, allocated nodes and hosts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HardwareWriter: Send + Sync {
    /// Replace the status subresource of a request
    async fn patch_request_status(
        &self,
        request: &AllocationRequest,
        status: &AllocationRequestStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer to a request
    async fn add_request_finalizer(
        &self,
        request: &AllocationRequest,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer from a request
    async fn remove_request_finalizer(
        &self,
        request: &AllocationRequest,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Create an AllocatedNode; an existing node with the same name is success
    async fn create_node(&self, node: &AllocatedNode) -> Result<(), Error>;

    /// Merge-patch an AllocatedNode's metadata or spec
    async fn patch_node(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error>;

    /// Replace the status subresource of an AllocatedNode
    async fn patch_node_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AllocatedNodeStatus,
    ) -> Result<(), Error>;

    /// Delete an AllocatedNode; a missing node is success
    async fn delete_node(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Remove a finalizer from an AllocatedNode
    async fn remove_node_finalizer(&self, node: &AllocatedNode, finalizer: &str)
        -> Result<(), Error>;

    /// Merge-patch a host guarded by its resourceVersion.
    ///
    /// Fails with a 409 conflict when the host changed since it was read,
    /// which is what makes claiming a host an atomic decision.
    async fn claim_host(&self, host: &PhysicalHost, patch: &Value) -> Result<(), Error>;

    /// Merge-patch a host unconditionally
    async fn patch_host(&self, host: &ObjectRef, patch: &Value) -> Result<(), Error>;

    /// Remove a label from the preprovisioning image paired with a host
    async fn remove_image_label(&self, host: &ObjectRef, label: &str) -> Result<(), Error>;
}

/// Kubernetes-backed implementation of both store traits
pub struct KubeHardwareStore {
    client: Client,
    index: Option<Arc<NodeIndex>>,
}

impl KubeHardwareStore {
    /// Create a store that lists nodes directly from the API server
    pub fn new(client: Client) -> Self {
        Self {
            client,
            index: None,
        }
    }

    /// Serve node lookups from the shared reverse index
    pub fn with_index(mut self, index: Arc<NodeIndex>) -> Self {
        self.index = Some(index);
        self
    }

    fn requests(&self, namespace: &str) -> Api<AllocationRequest> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self, namespace: &str) -> Api<AllocatedNode> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn hosts(&self, namespace: &str) -> Api<PhysicalHost> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// ApiResource for metal3 PreprovisioningImages
fn preprovisioning_image_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "metal3.io",
        "v1alpha1",
        "PreprovisioningImage",
    ))
}

fn finalizers_without(finalizers: &[String], finalizer: &str) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect()
}

#[async_trait]
impl HardwareReader for KubeHardwareStore {
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AllocationRequest>, Error> {
        Ok(self.requests(namespace).get_opt(name).await?)
    }

    async fn list_nodes(
        &self,
        namespace: &str,
        request: &str,
    ) -> Result<Vec<AllocatedNode>, Error> {
        if let Some(index) = &self.index {
            index.ensure_ready().await?;
            return Ok(index.nodes_for(namespace, request));
        }

        let params = ListParams::default().labels(&format!("{}={}", REQUEST_LABEL, request));
        Ok(self.nodes(namespace).list(&params).await?.items)
    }

    async fn list_hosts(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PhysicalHost>, Error> {
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let api: Api<PhysicalHost> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    async fn get_host(&self, host: &ObjectRef) -> Result<Option<PhysicalHost>, Error> {
        Ok(self.hosts(&host.namespace).get_opt(&host.name).await?)
    }
}

#[async_trait]
impl HardwareWriter for KubeHardwareStore {
    async fn patch_request_status(
        &self,
        request: &AllocationRequest,
        status: &AllocationRequestStatus,
    ) -> Result<(), Error> {
        let namespace = request.namespace().unwrap_or_default();
        self.requests(&namespace)
            .patch_status(
                &request.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn add_request_finalizer(
        &self,
        request: &AllocationRequest,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut finalizers = request.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": request.resource_version(),
            }
        });
        self.requests(&request.namespace().unwrap_or_default())
            .patch(
                &request.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_request_finalizer(
        &self,
        request: &AllocationRequest,
        finalizer: &str,
    ) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers_without(request.finalizers(), finalizer),
                "resourceVersion": request.resource_version(),
            }
        });
        let result = self
            .requests(&request.namespace().unwrap_or_default())
            .patch(
                &request.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await;
        ok_if_not_found(result)?;
        Ok(())
    }

    async fn create_node(&self, node: &AllocatedNode) -> Result<(), Error> {
        let namespace = node.namespace().unwrap_or_default();
        match self
            .nodes(&namespace)
            .create(&PostParams::default(), node)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                debug!(node = %node.name_any(), "AllocatedNode already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_node(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error> {
        self.nodes(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_node_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AllocatedNodeStatus,
    ) -> Result<(), Error> {
        self.nodes(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn delete_node(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let result = self
            .nodes(namespace)
            .delete(name, &DeleteParams::default())
            .await;
        ok_if_not_found(result)?;
        Ok(())
    }

    async fn remove_node_finalizer(
        &self,
        node: &AllocatedNode,
        finalizer: &str,
    ) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers_without(node.finalizers(), finalizer),
                "resourceVersion": node.resource_version(),
            }
        });
        let result = self
            .nodes(&node.namespace().unwrap_or_default())
            .patch(
                &node.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await;
        ok_if_not_found(result)?;
        Ok(())
    }

    async fn claim_host(&self, host: &PhysicalHost, patch: &Value) -> Result<(), Error> {
        let Some(resource_version) = host.resource_version() else {
            return Err(Error::host(
                host.object_ref().to_string(),
                "host has no resourceVersion to guard the claim",
            ));
        };

        let mut guarded = patch.clone();
        guarded["metadata"]["resourceVersion"] = Value::String(resource_version);

        self.hosts(&host.namespace().unwrap_or_default())
            .patch(
                &host.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&guarded),
            )
            .await?;
        Ok(())
    }

    async fn patch_host(&self, host: &ObjectRef, patch: &Value) -> Result<(), Error> {
        self.hosts(&host.namespace)
            .patch(&host.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn remove_image_label(&self, host: &ObjectRef, label: &str) -> Result<(), Error> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            &host.namespace,
            &preprovisioning_image_resource(),
        );
        let patch = json!({ "metadata": { "labels": { label: Value::Null } } });
        let result = api
            .patch(&host.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await;
        ok_if_not_found(result)?;
        Ok(())
    }
}
