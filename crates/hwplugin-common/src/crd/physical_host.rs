//! PhysicalHost CRD: a bare-metal host owned by the inventory system
//!
//! The plugin never creates or deletes hosts. It claims them with labels,
//! points them at a hardware profile, and resets them on release. How a
//! host is actually imaged or reconfigured is outside this crate; only the
//! fields below are read or written.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ObjectRef;
use crate::{
    DEALLOCATION_COMPLETE_ANNOTATION, HOST_ALLOCATED_LABEL, HOST_PROFILE_LABEL,
    RESOURCE_POOL_LABEL, SITE_LABEL, SKIP_CLEANUP_ANNOTATION,
};

/// Desired state of a physical host
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hwplugin.dev",
    version = "v1alpha1",
    kind = "PhysicalHost",
    namespaced,
    status = "PhysicalHostStatus",
    shortname = "phost",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioning.state"}"#,
    printcolumn = r#"{"name":"Online","type":"boolean","jsonPath":".spec.online"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".metadata.labels.hwplugin\\.dev/allocated-node"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalHostSpec {
    /// Whether the host should be powered on
    #[serde(default)]
    pub online: bool,

    /// Image to deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<HostImage>,

    /// Custom deployment descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_deploy: Option<CustomDeploy>,

    /// Hardware profile the host should converge to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_profile: Option<String>,

    /// Cleaning mode applied when the host is deprovisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated_cleaning_mode: Option<String>,

    /// Network data secret used while preprovisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprovisioning_network_data_name: Option<String>,
}

/// Boot image reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HostImage {
    /// Image URL
    pub url: String,
    /// Image checksum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Custom deployment descriptor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CustomDeploy {
    /// Deployment method name
    pub method: String,
}

/// Observed state of a physical host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalHostStatus {
    /// Provisioning progress
    #[serde(default)]
    pub provisioning: ProvisioningStatus,

    /// Whether the host is currently powered on
    #[serde(default)]
    pub powered_on: bool,

    /// Profile the host reports as applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_profile: Option<String>,

    /// Hostname discovered on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// MAC address of the boot interface
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "bootMACAddress")]
    pub boot_mac_address: Option<String>,

    /// Last error reported by the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Provisioning progress of a host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProvisioningStatus {
    /// Raw provisioning state reported by the inventory system
    #[serde(default)]
    pub state: String,
}

/// Provisioning states the plugin acts on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Free and ready to be claimed
    Available,
    /// Being imaged
    Provisioning,
    /// Imaged and running a workload
    Provisioned,
    /// Being wiped
    Deprovisioning,
    /// Reporting an error
    Error,
    /// Any state the plugin does not distinguish
    Other,
}

impl ProvisioningState {
    fn parse(raw: &str) -> Self {
        match raw {
            "available" | "ready" => Self::Available,
            "provisioning" => Self::Provisioning,
            "provisioned" => Self::Provisioned,
            "deprovisioning" => Self::Deprovisioning,
            "error" | "provisioning error" => Self::Error,
            _ => Self::Other,
        }
    }
}

impl PhysicalHost {
    /// Namespaced reference to this host
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            name: self.name_any(),
            namespace: self.namespace().unwrap_or_default(),
        }
    }

    /// Parsed provisioning state
    pub fn state(&self) -> ProvisioningState {
        self.status
            .as_ref()
            .map(|s| ProvisioningState::parse(&s.provisioning.state))
            .unwrap_or(ProvisioningState::Other)
    }

    /// Whether the host carries the allocated label
    pub fn is_allocated(&self) -> bool {
        self.labels()
            .get(HOST_ALLOCATED_LABEL)
            .is_some_and(|v| v == "true")
    }

    /// Whether the host satisfies the site, pool, selector and profile criteria
    pub fn matches(
        &self,
        site: &str,
        pool: Option<&str>,
        selector: &BTreeMap<String, String>,
        profile: &str,
    ) -> bool {
        let labels = self.labels();
        if labels.get(SITE_LABEL).map(String::as_str) != Some(site) {
            return false;
        }
        if let Some(pool) = pool {
            if labels.get(RESOURCE_POOL_LABEL).map(String::as_str) != Some(pool) {
                return false;
            }
        }
        if let Some(allowed) = labels.get(HOST_PROFILE_LABEL) {
            if allowed != profile {
                return false;
            }
        }
        selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Whether the first release phase has already run
    pub fn deallocation_complete(&self) -> bool {
        self.annotations()
            .get(DEALLOCATION_COMPLETE_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// Whether release should leave the host powered
    pub fn skip_cleanup(&self) -> bool {
        self.annotations().contains_key(SKIP_CLEANUP_ANNOTATION)
    }

    /// Whether the profile the host reports matches the one it was asked for
    pub fn profile_applied(&self) -> bool {
        let desired = self.spec.hardware_profile.as_deref();
        let applied = self.status.as_ref().and_then(|s| s.applied_profile.as_deref());
        desired.is_none() || desired == applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(labels: &[(&str, &str)], state: &str) -> PhysicalHost {
        let mut h = PhysicalHost::new("host-0", PhysicalHostSpec::default());
        h.metadata.namespace = Some("metal".to_string());
        h.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        h.status = Some(PhysicalHostStatus {
            provisioning: ProvisioningStatus {
                state: state.to_string(),
            },
            ..Default::default()
        });
        h
    }

    #[test]
    fn state_parsing() {
        assert_eq!(host(&[], "available").state(), ProvisioningState::Available);
        assert_eq!(host(&[], "provisioned").state(), ProvisioningState::Provisioned);
        assert_eq!(host(&[], "error").state(), ProvisioningState::Error);
        assert_eq!(host(&[], "inspecting").state(), ProvisioningState::Other);
    }

    #[test]
    fn matching_requires_site_pool_and_selector() {
        let h = host(
            &[
                (SITE_LABEL, "ottawa"),
                (RESOURCE_POOL_LABEL, "pool-a"),
                ("resourceselector.hwplugin.dev/rack", "r1"),
            ],
            "available",
        );
        let selector = BTreeMap::from([(
            "resourceselector.hwplugin.dev/rack".to_string(),
            "r1".to_string(),
        )]);
        assert!(h.matches("ottawa", Some("pool-a"), &selector, "p1"));
        assert!(h.matches("ottawa", None, &BTreeMap::new(), "p1"));
        assert!(!h.matches("montreal", Some("pool-a"), &selector, "p1"));
        assert!(!h.matches("ottawa", Some("pool-b"), &selector, "p1"));

        let other = BTreeMap::from([(
            "resourceselector.hwplugin.dev/rack".to_string(),
            "r2".to_string(),
        )]);
        assert!(!h.matches("ottawa", Some("pool-a"), &other, "p1"));
    }

    #[test]
    fn profile_label_restricts_matching() {
        let h = host(&[(SITE_LABEL, "ottawa"), (HOST_PROFILE_LABEL, "p1")], "available");
        assert!(h.matches("ottawa", None, &BTreeMap::new(), "p1"));
        assert!(!h.matches("ottawa", None, &BTreeMap::new(), "p2"));
    }

    #[test]
    fn profile_applied_compares_spec_and_status() {
        let mut h = host(&[], "provisioned");
        assert!(h.profile_applied());

        h.spec.hardware_profile = Some("p2".to_string());
        assert!(!h.profile_applied());

        if let Some(status) = h.status.as_mut() {
            status.applied_profile = Some("p2".to_string());
        }
        assert!(h.profile_applied());
    }

    #[test]
    fn allocated_label_must_be_true() {
        assert!(host(&[(HOST_ALLOCATED_LABEL, "true")], "available").is_allocated());
        assert!(!host(&[(HOST_ALLOCATED_LABEL, "false")], "available").is_allocated());
        assert!(!host(&[], "available").is_allocated());
    }
}
