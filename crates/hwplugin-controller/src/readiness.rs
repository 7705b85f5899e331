//! Cross-cluster readiness: is the host a Ready node in its member cluster?
//!
//! The hostname is looked up in the orchestrator's ProvisioningRequest
//! (named by the callback URL), then the member cluster is queried with a
//! kubeconfig read from its namespace. A client is built per check; checks
//! are rare and paced by medium requeues.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

#[cfg(test)]
use mockall::automock;

use hwplugin_common::crd::{AllocatedNode, AllocationRequest};
use hwplugin_common::kube_utils::client_from_kubeconfig_yaml;
use hwplugin_common::Error;

/// Path prefix of orchestrator callback URLs; the next segment names the
/// ProvisioningRequest
pub const CALLBACK_PATH_PREFIX: &str = "/nar-callback/v1/provisioning-requests/";

/// Label selecting the admin kubeconfig secret in a member cluster namespace
const KUBECONFIG_SECRET_SELECTOR: &str = "hive.openshift.io/secret-type=kubeconfig";

/// Key holding the kubeconfig inside the secret
const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Outcome of a readiness check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The member node is Ready with networking up
    Ready,
    /// Not yet; carries what is missing
    NotReady(String),
}

/// Lookups against the hub's orchestrator objects and member clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberClusterAccess: Send + Sync {
    /// Fetch a cluster-scoped ProvisioningRequest as raw JSON
    async fn get_provisioning_request(&self, name: &str) -> Result<Option<Value>, Error>;

    /// Fetch a node from a member cluster by name
    async fn get_member_node(&self, cluster_id: &str, hostname: &str)
        -> Result<Option<Node>, Error>;
}

/// Kubernetes-backed member cluster access
pub struct KubeMemberClusters {
    client: Client,
}

impl KubeMemberClusters {
    /// Create access backed by the hub client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn member_client(&self, cluster_id: &str) -> Result<Client, Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), cluster_id);
        let list = secrets
            .list(&ListParams::default().labels(KUBECONFIG_SECRET_SELECTOR))
            .await?;

        let secret = list.items.into_iter().next().ok_or_else(|| {
            Error::internal_with_context(
                "member_client",
                format!("no kubeconfig secret found for cluster {cluster_id}"),
            )
        })?;

        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                Error::internal_with_context(
                    "member_client",
                    format!(
                        "secret {} has no {} key",
                        secret.name_any(),
                        KUBECONFIG_SECRET_KEY
                    ),
                )
            })?;
        let yaml = String::from_utf8(bytes.0.clone()).map_err(|e| {
            Error::serialization_for_kind("Secret", format!("kubeconfig is not UTF-8: {e}"))
        })?;

        client_from_kubeconfig_yaml(&yaml).await
    }
}

fn provisioning_request_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "clcm.openshift.io",
        "v1alpha1",
        "ProvisioningRequest",
    ))
}

#[async_trait]
impl MemberClusterAccess for KubeMemberClusters {
    async fn get_provisioning_request(&self, name: &str) -> Result<Option<Value>, Error> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &provisioning_request_resource());
        let Some(obj) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let value = serde_json::to_value(obj).map_err(|e| {
            Error::serialization_for_kind("ProvisioningRequest", e.to_string())
        })?;
        Ok(Some(value))
    }

    async fn get_member_node(
        &self,
        cluster_id: &str,
        hostname: &str,
    ) -> Result<Option<Node>, Error> {
        let member = self.member_client(cluster_id).await?;
        let nodes: Api<Node> = Api::all(member);
        Ok(nodes.get_opt(hostname).await?)
    }
}

/// Extract the ProvisioningRequest name from a callback URL
pub fn provisioning_request_name(callback_url: &str) -> Result<String, &'static str> {
    let url = Url::parse(callback_url).map_err(|_| "callback URL does not match expected pattern")?;
    let rest = url
        .path()
        .strip_prefix(CALLBACK_PATH_PREFIX)
        .ok_or("callback URL does not match expected pattern")?;
    let name = rest.trim_end_matches('/');
    if name.is_empty() || name.contains('/') {
        return Err("could not extract provisioning request name");
    }
    Ok(name.to_string())
}

/// Hostname recorded for an AllocatedNode in a ProvisioningRequest
pub fn hostname_for_node(provisioning_request: &Value, node: &str) -> Option<String> {
    provisioning_request
        .pointer("/status/extensions/allocatedNodeHostMap")
        .and_then(|m| m.get(node))
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

fn condition_is_true(node: &Node, type_: &str) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == type_))
        .is_some_and(|c| c.status == "True")
}

/// Ready is True and NetworkUnavailable is absent or not True
pub fn node_is_ready(node: &Node) -> bool {
    condition_is_true(node, "Ready") && !condition_is_true(node, "NetworkUnavailable")
}

/// Check whether the host behind `node` has joined its member cluster
pub async fn check_readiness(
    access: &dyn MemberClusterAccess,
    request: &AllocationRequest,
    node: &AllocatedNode,
) -> Result<Readiness, Error> {
    let node_name = node.name_any();
    let callback_url = request
        .callback_url()
        .ok_or_else(|| Error::readiness(&node_name, "no callback configured"))?;
    let pr_name =
        provisioning_request_name(callback_url).map_err(|m| Error::readiness(&node_name, m))?;

    let Some(pr) = access.get_provisioning_request(&pr_name).await? else {
        return Err(Error::readiness(
            &node_name,
            format!("ProvisioningRequest {pr_name} not found"),
        ));
    };

    let hostname = hostname_for_node(&pr, &node_name).ok_or_else(|| {
        Error::readiness(
            &node_name,
            format!("hostname not found for AllocatedNode {node_name} in ProvisioningRequest {pr_name}"),
        )
    })?;

    let cluster_id = &request.spec.cluster_id;
    let Some(member) = access.get_member_node(cluster_id, &hostname).await? else {
        debug!(node = %node_name, %hostname, cluster = %cluster_id, "member node not registered yet");
        return Ok(Readiness::NotReady(format!(
            "node {hostname} not found in cluster {cluster_id}"
        )));
    };

    if node_is_ready(&member) {
        Ok(Readiness::Ready)
    } else {
        info!(node = %node_name, %hostname, cluster = %cluster_id, "member node not ready yet");
        Ok(Readiness::NotReady(format!(
            "node {hostname} is not ready in cluster {cluster_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_request;
    use hwplugin_common::crd::{AllocatedNodeSpec, Callback};
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use serde_json::json;

    fn member_node(conditions: &[(&str, &str)]) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|(t, s)| NodeCondition {
                            type_: t.to_string(),
                            status: s.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn allocated_node() -> AllocatedNode {
        AllocatedNode::new("node-a", AllocatedNodeSpec::default())
    }

    fn request_with_callback() -> AllocationRequest {
        let mut req = sample_request("cluster-a");
        req.spec.callback = Some(Callback {
            callback_url: "https://hub.example.com/nar-callback/v1/provisioning-requests/pr-1"
                .to_string(),
        });
        req
    }

    mod callback_urls {
        use super::*;

        #[test]
        fn extracts_name_from_well_formed_url() {
            assert_eq!(
                provisioning_request_name(
                    "https://hub:8443/nar-callback/v1/provisioning-requests/pr-1"
                ),
                Ok("pr-1".to_string())
            );
        }

        #[test]
        fn rejects_foreign_paths() {
            assert_eq!(
                provisioning_request_name("https://hub/other/pr-1"),
                Err("callback URL does not match expected pattern")
            );
            assert_eq!(
                provisioning_request_name("not a url"),
                Err("callback URL does not match expected pattern")
            );
        }

        #[test]
        fn rejects_missing_name() {
            assert_eq!(
                provisioning_request_name("https://hub/nar-callback/v1/provisioning-requests/"),
                Err("could not extract provisioning request name")
            );
        }
    }

    mod node_conditions {
        use super::*;

        #[test]
        fn ready_with_network() {
            assert!(node_is_ready(&member_node(&[
                ("Ready", "True"),
                ("NetworkUnavailable", "False"),
            ])));
            assert!(node_is_ready(&member_node(&[("Ready", "True")])));
        }

        #[test]
        fn not_ready_without_ready_condition_or_network() {
            assert!(!node_is_ready(&member_node(&[])));
            assert!(!node_is_ready(&member_node(&[("Ready", "False")])));
            assert!(!node_is_ready(&member_node(&[
                ("Ready", "True"),
                ("NetworkUnavailable", "True"),
            ])));
        }
    }

    #[test]
    fn hostname_lookup_reads_extensions_map() {
        let pr = json!({"status": {"extensions": {"allocatedNodeHostMap": {"node-a": "master-0"}}}});
        assert_eq!(hostname_for_node(&pr, "node-a"), Some("master-0".to_string()));
        assert_eq!(hostname_for_node(&pr, "node-b"), None);
        assert_eq!(hostname_for_node(&json!({}), "node-a"), None);
    }

    #[tokio::test]
    async fn ready_member_node_passes() {
        let mut access = MockMemberClusterAccess::new();
        access
            .expect_get_provisioning_request()
            .withf(|name| name == "pr-1")
            .returning(|_| {
                Ok(Some(json!({"status": {"extensions": {"allocatedNodeHostMap": {"node-a": "master-0"}}}})))
            });
        access
            .expect_get_member_node()
            .withf(|cluster, host| cluster == "cluster-a" && host == "master-0")
            .returning(|_, _| Ok(Some(member_node(&[("Ready", "True")]))));

        let result = check_readiness(&access, &request_with_callback(), &allocated_node())
            .await
            .unwrap();
        assert_eq!(result, Readiness::Ready);
    }

    #[tokio::test]
    async fn unregistered_member_node_is_not_ready() {
        let mut access = MockMemberClusterAccess::new();
        access.expect_get_provisioning_request().returning(|_| {
            Ok(Some(json!({"status": {"extensions": {"allocatedNodeHostMap": {"node-a": "master-0"}}}})))
        });
        access.expect_get_member_node().returning(|_, _| Ok(None));

        let result = check_readiness(&access, &request_with_callback(), &allocated_node())
            .await
            .unwrap();
        assert!(matches!(result, Readiness::NotReady(_)));
    }

    #[tokio::test]
    async fn missing_hostname_is_an_error() {
        let mut access = MockMemberClusterAccess::new();
        access
            .expect_get_provisioning_request()
            .returning(|_| Ok(Some(json!({"status": {}}))));

        let err = check_readiness(&access, &request_with_callback(), &allocated_node())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("hostname not found for AllocatedNode node-a in ProvisioningRequest pr-1"));
    }

    #[tokio::test]
    async fn no_callback_is_an_error() {
        let access = MockMemberClusterAccess::new();
        let err = check_readiness(&access, &sample_request("cluster-a"), &allocated_node())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no callback configured"));
    }
}
