//! Kubernetes client construction and CRD installation

use std::path::Path;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tracing::info;

use crate::{Error, FIELD_MANAGER};

/// Default connect timeout for API server clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for API server clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            config_from_kubeconfig(kubeconfig).await?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to infer config: {}", e),
            )
        })?,
    };
    client_with_timeouts(config)
}

/// Create a kube client from kubeconfig YAML, e.g. read out of a Secret
pub async fn client_from_kubeconfig_yaml(yaml: &str) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| {
        Error::internal_with_context(
            "client_from_kubeconfig",
            format!("failed to parse kubeconfig: {}", e),
        )
    })?;
    client_with_timeouts(config_from_kubeconfig(kubeconfig).await?)
}

async fn config_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })
}

fn client_with_timeouts(mut config: Config) -> Result<Client, Error> {
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Install or update a CRD with server-side apply
pub async fn apply_crd(client: &Client, crd: &CustomResourceDefinition) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let name = crd.name_any();
    info!(crd = %name, "Installing CRD");
    crds.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(crd))
        .await?;
    Ok(())
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable across toolchains and can be
/// persisted in object names.
pub fn deterministic_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Map a kube 404 to `None`
pub fn ok_if_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn not_found_becomes_none() {
        let result: Result<u8, kube::Error> = Err(api_error(404));
        assert!(matches!(ok_if_not_found(result), Ok(None)));
    }

    #[test]
    fn other_errors_propagate() {
        let result: Result<u8, kube::Error> = Err(api_error(500));
        assert!(ok_if_not_found(result).is_err());
        assert!(matches!(ok_if_not_found(Ok(3u8)), Ok(Some(3))));
    }

    #[test]
    fn hash_is_stable_and_short() {
        let a = deterministic_hash("metal3-hwplugin-cluster-a-metal-host-0");
        assert_eq!(a.len(), 16);
        assert_eq!(a, deterministic_hash("metal3-hwplugin-cluster-a-metal-host-0"));
        assert_ne!(a, deterministic_hash("metal3-hwplugin-cluster-a-metal-host-1"));
    }

    #[tokio::test]
    async fn malformed_kubeconfig_is_rejected() {
        let err = client_from_kubeconfig_yaml("not: [valid").await.err().unwrap();
        assert!(err.to_string().contains("failed to parse kubeconfig"));
    }
}
