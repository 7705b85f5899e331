//! In-memory object store for reconciliation tests
//!
//! Applies merge patches the way the API server does, enforces
//! resourceVersion on host claims and honours finalizers on delete, so the
//! phase handlers can be driven end to end without a cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use hwplugin_common::crd::{
    AllocatedNode, AllocatedNodeStatus, AllocationRequest, AllocationRequestSpec,
    AllocationRequestStatus, Condition, NodeGroup, ObjectRef, PhysicalHost, PhysicalHostSpec,
    PhysicalHostStatus, ProvisioningStatus,
};
use hwplugin_common::{
    Error, DEFAULT_PLUGIN_ID, PLUGIN_LABEL, RESOURCE_POOL_LABEL, SITE_LABEL,
};

use crate::readiness::MockMemberClusterAccess;
use crate::store::{HardwareReader, HardwareWriter};

pub const REQUEST_NAMESPACE: &str = "hwplugin";
pub const HOST_NAMESPACE: &str = "metal";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("fake store: {reason}"),
        reason: reason.to_string(),
        code,
    }))
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    let Some(object) = target.as_object_mut() else {
        return;
    };
    for (k, v) in fields {
        if v.is_null() {
            object.remove(k);
        } else {
            merge_patch(object.entry(k.clone()).or_insert(Value::Null), v);
        }
    }
}

fn patched<T: Serialize + DeserializeOwned>(obj: &T, patch: &Value) -> T {
    let mut value = serde_json::to_value(obj).unwrap();
    merge_patch(&mut value, patch);
    serde_json::from_value(value).unwrap()
}

#[derive(Default)]
struct State {
    requests: BTreeMap<Key, AllocationRequest>,
    nodes: BTreeMap<Key, AllocatedNode>,
    hosts: BTreeMap<Key, PhysicalHost>,
    image_labels_removed: Vec<(ObjectRef, String)>,
    next_rv: u64,
    writes: usize,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.writes += 1;
        self.next_rv.to_string()
    }
}

/// Fake implementation of both store traits
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_request(&self, mut request: AllocationRequest) {
        let mut state = self.state.lock().unwrap();
        request.metadata.resource_version = Some(state.bump());
        let k = key(&request.namespace().unwrap_or_default(), &request.name_any());
        state.requests.insert(k, request);
    }

    pub fn insert_host(&self, mut host: PhysicalHost) {
        let mut state = self.state.lock().unwrap();
        host.metadata.resource_version = Some(state.bump());
        let k = key(&host.namespace().unwrap_or_default(), &host.name_any());
        state.hosts.insert(k, host);
    }

    pub fn insert_node(&self, mut node: AllocatedNode) {
        let mut state = self.state.lock().unwrap();
        node.metadata.resource_version = Some(state.bump());
        let k = key(&node.namespace().unwrap_or_default(), &node.name_any());
        state.nodes.insert(k, node);
    }

    pub fn request(&self, name: &str) -> Option<AllocationRequest> {
        let state = self.state.lock().unwrap();
        state.requests.get(&key(REQUEST_NAMESPACE, name)).cloned()
    }

    pub fn host(&self, name: &str) -> PhysicalHost {
        let state = self.state.lock().unwrap();
        state.hosts[&key(HOST_NAMESPACE, name)].clone()
    }

    pub fn nodes(&self) -> Vec<AllocatedNode> {
        self.state.lock().unwrap().nodes.values().cloned().collect()
    }

    pub fn hosts(&self) -> Vec<PhysicalHost> {
        self.state.lock().unwrap().hosts.values().cloned().collect()
    }

    pub fn remove_host(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.hosts.remove(&key(HOST_NAMESPACE, name));
    }

    pub fn image_labels_removed(&self) -> Vec<(ObjectRef, String)> {
        self.state.lock().unwrap().image_labels_removed.clone()
    }

    /// Number of mutating calls served so far
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Simulate the inventory system moving a host
    pub fn update_host(&self, name: &str, f: impl FnOnce(&mut PhysicalHost)) {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let host = state.hosts.get_mut(&key(HOST_NAMESPACE, name)).unwrap();
        f(host);
        host.metadata.resource_version = Some(rv);
    }

    /// Simulate an edit of the request spec
    pub fn update_request(&self, name: &str, f: impl FnOnce(&mut AllocationRequest)) {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let request = state.requests.get_mut(&key(REQUEST_NAMESPACE, name)).unwrap();
        f(request);
        request.metadata.generation = Some(request.generation() + 1);
        request.metadata.resource_version = Some(rv);
    }

    /// Simulate `kubectl delete` on a request
    pub fn delete_request(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let k = key(REQUEST_NAMESPACE, name);
        let Some(request) = state.requests.get(&k) else {
            return;
        };
        if request.finalizers().is_empty() {
            state.requests.remove(&k);
            return;
        }
        let rv = state.bump();
        if let Some(request) = state.requests.get_mut(&k) {
            request.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            request.metadata.resource_version = Some(rv);
        }
    }
}

#[async_trait]
impl HardwareReader for FakeStore {
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AllocationRequest>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.requests.get(&key(namespace, name)).cloned())
    }

    async fn list_nodes(
        &self,
        namespace: &str,
        request: &str,
    ) -> Result<Vec<AllocatedNode>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .values()
            .filter(|n| n.namespace().as_deref() == Some(namespace) && n.request_name() == request)
            .cloned()
            .collect())
    }

    async fn list_hosts(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PhysicalHost>, Error> {
        let snapshot: Vec<PhysicalHost> = {
            let state = self.state.lock().unwrap();
            state
                .hosts
                .values()
                .filter(|h| labels.iter().all(|(k, v)| h.labels().get(k) == Some(v)))
                .cloned()
                .collect()
        };
        // Hand back a snapshot that concurrent reconciles can invalidate
        tokio::task::yield_now().await;
        Ok(snapshot)
    }

    async fn get_host(&self, host: &ObjectRef) -> Result<Option<PhysicalHost>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.hosts.get(&key(&host.namespace, &host.name)).cloned())
    }
}

#[async_trait]
impl HardwareWriter for FakeStore {
    async fn patch_request_status(
        &self,
        request: &AllocationRequest,
        status: &AllocationRequestStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let k = key(&request.namespace().unwrap_or_default(), &request.name_any());
        let Some(stored) = state.requests.get_mut(&k) else {
            return Err(api_error(404, "NotFound"));
        };
        *stored = patched(&*stored, &json!({ "status": status }));
        stored.metadata.resource_version = Some(rv);
        Ok(())
    }

    async fn add_request_finalizer(
        &self,
        request: &AllocationRequest,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let k = key(&request.namespace().unwrap_or_default(), &request.name_any());
        let Some(stored) = state.requests.get_mut(&k) else {
            return Err(api_error(404, "NotFound"));
        };
        let finalizers = stored.finalizers_mut();
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
        stored.metadata.resource_version = Some(rv);
        Ok(())
    }

    async fn remove_request_finalizer(
        &self,
        request: &AllocationRequest,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.bump();
        let k = key(&request.namespace().unwrap_or_default(), &request.name_any());
        let Some(stored) = state.requests.get_mut(&k) else {
            return Ok(());
        };
        stored.finalizers_mut().retain(|f| f != finalizer);
        if stored.finalizers().is_empty() && stored.metadata.deletion_timestamp.is_some() {
            state.requests.remove(&k);
        }
        Ok(())
    }

    async fn create_node(&self, node: &AllocatedNode) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(&node.namespace().unwrap_or_default(), &node.name_any());
        if state.nodes.contains_key(&k) {
            return Ok(());
        }
        let mut node = node.clone();
        node.metadata.resource_version = Some(state.bump());
        state.nodes.insert(k, node);
        Ok(())
    }

    async fn patch_node(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let Some(stored) = state.nodes.get_mut(&key(namespace, name)) else {
            return Err(api_error(404, "NotFound"));
        };
        *stored = patched(&*stored, patch);
        stored.metadata.resource_version = Some(rv);
        Ok(())
    }

    async fn patch_node_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AllocatedNodeStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let Some(stored) = state.nodes.get_mut(&key(namespace, name)) else {
            return Err(api_error(404, "NotFound"));
        };
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(rv);
        Ok(())
    }

    async fn delete_node(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let k = key(namespace, name);
        let Some(stored) = state.nodes.get_mut(&k) else {
            return Ok(());
        };
        if stored.finalizers().is_empty() {
            state.nodes.remove(&k);
            return Ok(());
        }
        if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            stored.metadata.resource_version = Some(rv);
        }
        Ok(())
    }

    async fn remove_node_finalizer(
        &self,
        node: &AllocatedNode,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.bump();
        let k = key(&node.namespace().unwrap_or_default(), &node.name_any());
        let Some(stored) = state.nodes.get_mut(&k) else {
            return Ok(());
        };
        stored.finalizers_mut().retain(|f| f != finalizer);
        if stored.finalizers().is_empty() && stored.metadata.deletion_timestamp.is_some() {
            state.nodes.remove(&k);
        }
        Ok(())
    }

    async fn claim_host(&self, host: &PhysicalHost, patch: &Value) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(&host.namespace().unwrap_or_default(), &host.name_any());
        let current = state
            .hosts
            .get(&k)
            .and_then(|h| h.resource_version())
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if host.resource_version().as_deref() != Some(current.as_str()) {
            return Err(api_error(409, "Conflict"));
        }
        let rv = state.bump();
        if let Some(stored) = state.hosts.get_mut(&k) {
            *stored = patched(&*stored, patch);
            stored.metadata.resource_version = Some(rv);
        }
        Ok(())
    }

    async fn patch_host(&self, host: &ObjectRef, patch: &Value) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let Some(stored) = state.hosts.get_mut(&key(&host.namespace, &host.name)) else {
            return Err(api_error(404, "NotFound"));
        };
        *stored = patched(&*stored, patch);
        stored.metadata.resource_version = Some(rv);
        Ok(())
    }

    async fn remove_image_label(&self, host: &ObjectRef, label: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.bump();
        state
            .image_labels_removed
            .push((host.clone(), label.to_string()));
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Request with a one-host controller group and a two-host worker group
pub fn sample_request(name: &str) -> AllocationRequest {
    let mut request = AllocationRequest::new(
        name,
        AllocationRequestSpec {
            cluster_id: name.to_string(),
            site: "ottawa".to_string(),
            location: None,
            node_group: vec![
                NodeGroup {
                    name: "controller".to_string(),
                    hw_profile: "profile-ctrl-v1".to_string(),
                    resource_pool_id: Some("pool-a".to_string()),
                    size: 1,
                    ..Default::default()
                },
                NodeGroup {
                    name: "worker".to_string(),
                    hw_profile: "profile-wkr-v1".to_string(),
                    resource_pool_id: Some("pool-a".to_string()),
                    size: 2,
                    ..Default::default()
                },
            ],
            hardware_provisioning_timeout: None,
            callback: None,
            boot_interface_label: None,
            extensions: BTreeMap::new(),
        },
    );
    request.metadata.namespace = Some(REQUEST_NAMESPACE.to_string());
    request.metadata.generation = Some(1);
    request.metadata.uid = Some(format!("uid-{name}"));
    request.metadata.labels = Some(BTreeMap::from([(
        PLUGIN_LABEL.to_string(),
        DEFAULT_PLUGIN_ID.to_string(),
    )]));
    request
}

/// Sample request carrying the given conditions and generations
pub fn request_with(conditions: Vec<Condition>, generation: i64, observed: i64) -> AllocationRequest {
    let mut request = sample_request("cluster-a");
    request.metadata.generation = Some(generation);
    request.status = Some(AllocationRequestStatus {
        conditions,
        observed_generation: Some(observed),
        ..Default::default()
    });
    request
}

/// Unclaimed host in the sample site and pool
pub fn free_host(name: &str) -> PhysicalHost {
    let mut host = PhysicalHost::new(name, PhysicalHostSpec::default());
    host.metadata.namespace = Some(HOST_NAMESPACE.to_string());
    host.metadata.labels = Some(BTreeMap::from([
        (SITE_LABEL.to_string(), "ottawa".to_string()),
        (RESOURCE_POOL_LABEL.to_string(), "pool-a".to_string()),
    ]));
    host.status = Some(PhysicalHostStatus {
        provisioning: ProvisioningStatus {
            state: "available".to_string(),
        },
        hostname: Some(format!("{name}.example.com")),
        boot_mac_address: Some("52:54:00:00:00:01".to_string()),
        ..Default::default()
    });
    host
}

/// Report the host's requested profile as applied
pub fn apply_profile(host: &mut PhysicalHost) {
    let desired = host.spec.hardware_profile.clone();
    if let Some(status) = host.status.as_mut() {
        status.applied_profile = desired;
    }
}

/// Move a host to the given provisioning state
pub fn set_state(host: &mut PhysicalHost, state: &str) {
    if let Some(status) = host.status.as_mut() {
        status.provisioning.state = state.to_string();
    }
}

/// Member cluster access that must never be consulted
pub fn no_members() -> Arc<MockMemberClusterAccess> {
    Arc::new(MockMemberClusterAccess::new())
}
