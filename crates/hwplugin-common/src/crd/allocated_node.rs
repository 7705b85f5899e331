//! AllocatedNode CRD: the binding between one group slot and one host

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions;
use super::types::{Condition, ConditionType, ObjectRef};
use crate::{CONFIG_IN_PROGRESS_ANNOTATION, REQUEST_LABEL};

/// Specification of an allocated node
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hwplugin.dev",
    version = "v1alpha1",
    kind = "AllocatedNode",
    namespaced,
    status = "AllocatedNodeStatus",
    printcolumn = r#"{"name":"Request","type":"string","jsonPath":".spec.allocationRequest"}"#,
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.groupName"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.hostRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNodeSpec {
    /// Name of the owning AllocationRequest
    pub allocation_request: String,

    /// Node group within the request
    pub group_name: String,

    /// Hardware profile the host should carry
    pub hw_profile: String,

    /// The PhysicalHost wrapped by this node
    pub host_ref: ObjectRef,
}

/// Observed state of an allocated node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNodeStatus {
    /// Per-node Provisioned and Configured conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Hostname reported by the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Boot MAC address reported by the host
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "bootMACAddress")]
    pub boot_mac_address: Option<String>,

    /// Profile last confirmed as applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_profile: Option<String>,
}

impl AllocatedNode {
    /// Current status, or an empty one before the first update
    pub fn status_or_default(&self) -> AllocatedNodeStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| conditions::find(&s.conditions, type_))
    }

    /// Request name from the reverse index label, falling back to the spec
    pub fn request_name(&self) -> &str {
        self.labels()
            .get(REQUEST_LABEL)
            .map(String::as_str)
            .unwrap_or(&self.spec.allocation_request)
    }

    /// Whether a profile update is being applied to this node
    pub fn config_in_progress(&self) -> bool {
        self.annotations().contains_key(CONFIG_IN_PROGRESS_ANNOTATION)
    }

    /// Whether the node has been marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
