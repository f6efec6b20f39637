use k8s_openapi::api::core::v1::{PodSecurityContext, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::{preserve_unknown_array_schema, preserve_unknown_object_schema};

/// A named bundle of scheduling and security settings merged into Function pods
/// that reference it through the `com.openfaas.profile` annotation.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Profile", group = "openfaas.com", version = "v1", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_array_schema")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object_schema")]
    pub pod_security_context: Option<PodSecurityContext>,
}
