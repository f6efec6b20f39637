use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    KeyToPath, LocalObjectReference, PodSpec, ProjectedVolumeSource, Secret, SecretProjection, Volume,
    VolumeMount, VolumeProjection,
};
use kube::{api::Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::util::errors::{Error, Result, StdError};
use crate::workload::SECRETS_MOUNT_PATH;

const DOCKER_CFG_SECRET_TYPE: &str = "kubernetes.io/dockercfg";
const DOCKER_CONFIG_JSON_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Read access to the Secrets a Function references.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretsClient: Send + Sync {
    /// Returns the named Secrets that exist, keyed by name. Missing names are
    /// simply absent from the map.
    async fn get_secrets(&self, namespace: &str, names: &[String]) -> Result<BTreeMap<String, Secret>>;
}

pub struct KubeSecretsClient {
    client: Client,
}

impl KubeSecretsClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretsClient for KubeSecretsClient {
    async fn get_secrets(&self, namespace: &str, names: &[String]) -> Result<BTreeMap<String, Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let mut found = BTreeMap::new();

        for name in names {
            if found.contains_key(name) {
                continue;
            }
            match secrets
                .get_opt(name)
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?
            {
                Some(secret) => {
                    found.insert(name.clone(), secret);
                }
                None => debug!("secret {}/{} does not exist", namespace, name),
            }
        }

        Ok(found)
    }
}

pub fn projected_secrets_volume_name(function_name: &str) -> String {
    format!("{function_name}-projected-secrets")
}

fn is_registry_credential(secret: &Secret) -> bool {
    matches!(
        secret.type_.as_deref(),
        Some(DOCKER_CFG_SECRET_TYPE) | Some(DOCKER_CONFIG_JSON_SECRET_TYPE)
    )
}

fn secret_keys(secret: &Secret) -> Vec<String> {
    let mut keys: Vec<String> = secret
        .data
        .iter()
        .flat_map(|data| data.keys())
        .chain(secret.string_data.iter().flat_map(|data| data.keys()))
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Wires the requested Secrets into the pod.
///
/// Registry credentials become image pull secrets; every other Secret is
/// projected key by key into the single `<function>-projected-secrets` volume
/// mounted on each container. Any previous instance of that volume and its
/// mounts is removed first, so the result only depends on `requested`.
/// Nothing is touched when a requested Secret is missing.
pub fn project_secrets(
    function_name: &str,
    requested: &[String],
    existing: &BTreeMap<String, Secret>,
    pod_spec: &mut PodSpec,
) -> Result<()> {
    let mut pull_secrets = Vec::new();
    let mut projections = Vec::new();

    for name in requested {
        let secret = existing
            .get(name)
            .ok_or_else(|| Error::StdError(StdError::SecretNotFound(name.clone())))?;

        if is_registry_credential(secret) {
            if !pull_secrets.contains(name) {
                pull_secrets.push(name.clone());
            }
            continue;
        }

        let items = secret_keys(secret)
            .into_iter()
            .map(|key| KeyToPath {
                path: key.clone(),
                key,
                ..Default::default()
            })
            .collect();
        projections.push(VolumeProjection {
            secret: Some(SecretProjection {
                name: name.clone(),
                items: Some(items),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    for name in pull_secrets {
        let references = pod_spec.image_pull_secrets.get_or_insert_with(Vec::new);
        if !references.iter().any(|r| r.name == name) {
            references.push(LocalObjectReference { name });
        }
    }

    let volume_name = projected_secrets_volume_name(function_name);
    remove_volume(pod_spec, &volume_name);

    if projections.is_empty() {
        return Ok(());
    }

    pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: volume_name.clone(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(projections),
            ..Default::default()
        }),
        ..Default::default()
    });
    for container in pod_spec.containers.iter_mut() {
        container.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
            name: volume_name.clone(),
            mount_path: SECRETS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Ok(())
}

/// Drops the named volume and every container mount of it, leaving `None`
/// instead of empty lists.
pub(crate) fn remove_volume(pod_spec: &mut PodSpec, volume_name: &str) {
    if let Some(volumes) = pod_spec.volumes.as_mut() {
        volumes.retain(|v| v.name != volume_name);
        if volumes.is_empty() {
            pod_spec.volumes = None;
        }
    }
    for container in pod_spec.containers.iter_mut() {
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| m.name != volume_name);
            if mounts.is_empty() {
                container.volume_mounts = None;
            }
        }
    }
}
