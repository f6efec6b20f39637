use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Generate the Kubernetes wrapper struct `Function` from our Spec
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Function", group = "openfaas.com", version = "v1", namespaced)]
#[kube(shortname = "fn")]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Name of the generated Deployment and Service
    pub name: String,
    pub image: String,

    /// Overrides the process the watchdog forks, exposed as `fprocess`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Node selector expressions in `key=value` form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<FunctionResources>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<FunctionResources>,

    #[serde(default)]
    pub read_only_root_filesystem: bool,
}

/// CPU and memory as Kubernetes quantity strings, e.g. `100m` and `128Mi`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct FunctionResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl FunctionSpec {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.as_ref()?.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_camel_case_manifest() {
        let spec: FunctionSpec = serde_json::from_value(json!({
            "name": "echo",
            "image": "ghcr.io/x/echo:latest",
            "readOnlyRootFilesystem": true,
            "secrets": ["pullsecret"],
            "limits": { "memory": "128Mi" },
            "annotations": { "com.openfaas.profile": "gpu" }
        }))
        .unwrap();

        assert_eq!(spec.name, "echo");
        assert!(spec.read_only_root_filesystem);
        assert_eq!(spec.secrets, vec!["pullsecret".to_string()]);
        assert_eq!(spec.limits.as_ref().unwrap().memory.as_deref(), Some("128Mi"));
        assert_eq!(spec.annotation("com.openfaas.profile"), Some("gpu"));
        assert!(spec.constraints.is_empty());
    }

    #[test]
    fn omits_empty_optional_fields() {
        let spec = FunctionSpec {
            name: "echo".into(),
            image: "echo:1".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            value,
            json!({ "name": "echo", "image": "echo:1", "readOnlyRootFilesystem": false })
        );
    }
}
