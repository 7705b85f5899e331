//! AllocationRequest CRD: a declarative ask for hosts across node groups
//!
//! Requests are created by the provisioning orchestrator. The plugin only
//! writes their status subresource and their finalizer list.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions;
use super::types::{Condition, ConditionType};
use crate::{Error, DEFAULT_HARDWARE_TIMEOUT, PLUGIN_LABEL};

/// Specification of an allocation request
///
/// Example:
/// ```yaml
/// apiVersion: hwplugin.dev/v1alpha1
/// kind: AllocationRequest
/// metadata:
///   name: cluster-a
///   labels:
///     hwplugin.dev/plugin: metal3-hwplugin
/// spec:
///   clusterId: cluster-a
///   site: ottawa
///   nodeGroup:
///     - name: controller
///       hwProfile: profile-ctrl-v1
///       resourcePoolId: pool-a
///       size: 1
///     - name: worker
///       hwProfile: profile-wkr-v1
///       resourcePoolId: pool-a
///       size: 2
///   callback:
///     callbackURL: https://orchestrator/nar-callback/v1/provisioning-requests/cluster-a
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hwplugin.dev",
    version = "v1alpha1",
    kind = "AllocationRequest",
    namespaced,
    status = "AllocationRequestStatus",
    shortname = "areq",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"Provisioned","type":"string","jsonPath":".status.conditions[?(@.type==\"Provisioned\")].reason"}"#,
    printcolumn = r#"{"name":"Configured","type":"string","jsonPath":".status.conditions[?(@.type==\"Configured\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequestSpec {
    /// Identifier of the member cluster the hosts will join
    pub cluster_id: String,

    /// Site the hosts must be located at
    pub site: String,

    /// Free-form location hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Node groups to satisfy
    pub node_group: Vec<NodeGroup>,

    /// Deadline for provisioning or configuration, e.g. "90m" or "1h30m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_provisioning_timeout: Option<String>,

    /// Where to report condition changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<Callback>,

    /// Label of the boot interface on allocated hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_interface_label: Option<String>,

    /// Opaque key/value extensions passed through from the orchestrator
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

/// One group of identically-profiled hosts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    /// Group name, unique within the request
    pub name: String,

    /// Role the hosts play in the member cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Hardware profile to apply to every host in the group
    pub hw_profile: String,

    /// Resource pool the hosts must belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool_id: Option<String>,

    /// Extra label criteria hosts must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_selector: BTreeMap<String, String>,

    /// Number of hosts wanted
    pub size: u32,
}

/// Callback target for condition change notifications
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Callback {
    /// URL receiving POSTed status payloads
    #[serde(rename = "callbackURL")]
    pub callback_url: String,
}

/// Names of the AllocatedNodes created for a request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    /// AllocatedNode names in creation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_names: Vec<String>,
}

/// Observed state of an allocation request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequestStatus {
    /// Composite conditions (Provisioned, Configured)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last fully handled by the plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Allocation bookkeeping
    #[serde(default)]
    pub properties: Properties,

    /// Start of the provisioning or configuration cycle being timed.
    ///
    /// Serialized as null when unset so a merge patch clears it.
    #[serde(default)]
    pub hardware_operation_start_time: Option<DateTime<Utc>>,
}

impl AllocationRequestStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        conditions::find(&self.conditions, type_)
    }
}

impl AllocationRequest {
    /// Current status, or an empty one before the first reconcile
    pub fn status_or_default(&self) -> AllocationRequestStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| s.condition(type_))
    }

    /// Metadata generation, zero when the store has not assigned one
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// Generation last fully handled by the plugin
    pub fn observed_generation(&self) -> i64 {
        self.status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .unwrap_or(0)
    }

    /// Plugin identity label value
    pub fn plugin_id(&self) -> Option<&str> {
        self.labels().get(PLUGIN_LABEL).map(String::as_str)
    }

    /// Callback URL when one is configured
    pub fn callback_url(&self) -> Option<&str> {
        self.spec
            .callback
            .as_ref()
            .map(|c| c.callback_url.as_str())
            .filter(|u| !u.is_empty())
    }

    /// Node group by name
    pub fn group(&self, name: &str) -> Option<&NodeGroup> {
        self.spec.node_group.iter().find(|g| g.name == name)
    }

    /// Parsed hardware timeout, falling back to the default when unset
    pub fn hardware_timeout(&self) -> Result<Duration, Error> {
        match self.spec.hardware_provisioning_timeout.as_deref() {
            None | Some("") => Ok(DEFAULT_HARDWARE_TIMEOUT),
            Some(raw) => match parse_duration(raw) {
                Some(d) if !d.is_zero() => Ok(d),
                Some(_) => Err(Error::validation_for_field(
                    self.name_any(),
                    "spec.hardwareProvisioningTimeout",
                    format!("timeout must be positive, got {raw:?}"),
                )),
                None => Err(Error::validation_for_field(
                    self.name_any(),
                    "spec.hardwareProvisioningTimeout",
                    format!("invalid duration {raw:?}"),
                )),
            },
        }
    }

    /// Validate the spec before any host is touched
    pub fn validate(&self) -> Result<(), Error> {
        let name = self.name_any();
        if self.spec.cluster_id.is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.clusterId",
                "cluster ID must not be empty",
            ));
        }
        if self.spec.site.is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.site",
                "site must not be empty",
            ));
        }

        let mut seen = BTreeSet::new();
        for (i, group) in self.spec.node_group.iter().enumerate() {
            if group.name.is_empty() {
                return Err(Error::validation_for_field(
                    &name,
                    format!("spec.nodeGroup[{i}].name"),
                    "node group name must not be empty",
                ));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(Error::validation_for_field(
                    &name,
                    format!("spec.nodeGroup[{i}].name"),
                    format!("duplicate node group {}", group.name),
                ));
            }
            if group.size > 0 && group.hw_profile.is_empty() {
                return Err(Error::validation_for_field(
                    &name,
                    format!("spec.nodeGroup[{i}].hwProfile"),
                    format!("node group {} has no hardware profile", group.name),
                ));
            }
        }

        self.hardware_timeout().map(|_| ())
    }
}

/// Parse durations of the form `90m`, `1h30m`, `45s` or `250ms`.
///
/// A bare `0` is accepted so that it can be rejected as non-positive with
/// a clearer message than "invalid".
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(spec: AllocationRequestSpec) -> AllocationRequest {
        let mut req = AllocationRequest::new("cluster-a", spec);
        req.metadata.namespace = Some("hwplugin".to_string());
        req
    }

    fn spec() -> AllocationRequestSpec {
        AllocationRequestSpec {
            cluster_id: "cluster-a".to_string(),
            site: "ottawa".to_string(),
            location: None,
            node_group: vec![NodeGroup {
                name: "worker".to_string(),
                hw_profile: "profile-wkr-v1".to_string(),
                size: 2,
                ..Default::default()
            }],
            hardware_provisioning_timeout: None,
            callback: None,
            boot_interface_label: None,
            extensions: BTreeMap::new(),
        }
    }

    mod durations {
        use super::*;

        #[test]
        fn parses_single_and_compound_units() {
            assert_eq!(parse_duration("90m"), Some(Duration::from_secs(5400)));
            assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
            assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
            assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        }

        #[test]
        fn rejects_garbage() {
            assert_eq!(parse_duration("ninety"), None);
            assert_eq!(parse_duration("10"), None);
            assert_eq!(parse_duration("10d"), None);
            assert_eq!(parse_duration("m"), None);
        }

        #[test]
        fn default_timeout_when_unset() {
            let req = request(spec());
            assert_eq!(req.hardware_timeout().unwrap(), DEFAULT_HARDWARE_TIMEOUT);
        }

        #[test]
        fn zero_timeout_is_input_error() {
            let mut s = spec();
            s.hardware_provisioning_timeout = Some("0s".to_string());
            let err = request(s).hardware_timeout().unwrap_err();
            assert!(err.is_input_error());
            assert!(err.to_string().contains("must be positive"));
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn accepts_well_formed_request() {
            assert!(request(spec()).validate().is_ok());
        }

        #[test]
        fn rejects_duplicate_groups() {
            let mut s = spec();
            s.node_group.push(s.node_group[0].clone());
            let err = request(s).validate().unwrap_err();
            assert!(err.to_string().contains("duplicate node group worker"));
        }

        #[test]
        fn rejects_group_without_profile() {
            let mut s = spec();
            s.node_group[0].hw_profile.clear();
            assert!(request(s).validate().unwrap_err().is_input_error());
        }

        #[test]
        fn rejects_bad_timeout() {
            let mut s = spec();
            s.hardware_provisioning_timeout = Some("soon".to_string());
            assert!(request(s).validate().is_err());
        }
    }

    #[test]
    fn status_serializes_cleared_start_time_as_null() {
        let status = AllocationRequestStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert!(json["hardwareOperationStartTime"].is_null());
        assert!(json.as_object().unwrap().contains_key("hardwareOperationStartTime"));
    }

    #[test]
    fn callback_url_ignores_empty_value() {
        let mut s = spec();
        s.callback = Some(Callback {
            callback_url: String::new(),
        });
        assert_eq!(request(s).callback_url(), None);
    }

    #[test]
    fn crd_uses_plugin_group() {
        use kube::CustomResourceExt;
        let crd = AllocationRequest::crd();
        assert_eq!(crd.spec.group, "hwplugin.dev");
        assert_eq!(crd.spec.names.kind, "AllocationRequest");
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("nodeGroup"));
    }
}
