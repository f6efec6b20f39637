use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::api::v1::Function;
use crate::util::errors::{Error, Result, StdError};
use crate::workload::deployment::function_annotations;
use crate::workload::{FUNCTION_LABEL, WATCHDOG_PORT};

/// The ClusterIP Service fronting a Function's pods on the watchdog port.
pub fn materialize_service(function: &Function) -> Result<Service> {
    let spec = &function.spec;
    let owner = function.controller_owner_ref(&()).ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing(format!(
            "Function {} has no uid to own its Service",
            function.name_any()
        )))
    })?;
    let selector = BTreeMap::from([(FUNCTION_LABEL.to_string(), spec.name.clone())]);

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: function.namespace(),
            annotations: Some(function_annotations(spec)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                port: WATCHDOG_PORT,
                target_port: Some(IntOrString::Int(WATCHDOG_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::FunctionSpec;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    #[test]
    fn service_selects_function_pods() {
        let mut function = Function::new(
            "echo",
            FunctionSpec {
                name: "echo".into(),
                image: "ghcr.io/x/echo:latest".into(),
                annotations: Some(BTreeMap::from([("topic".to_string(), "cron".to_string())])),
                ..Default::default()
            },
        );
        function.metadata.namespace = Some("openfaas-fn".into());
        function.metadata.uid = Some("uid-1".into());

        let service = materialize_service(&function).unwrap();
        assert_json_include!(
            actual: serde_json::to_value(&service).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "echo",
                    "namespace": "openfaas-fn",
                    "annotations": { "prometheus.io.scrape": "false", "topic": "cron" },
                    "ownerReferences": [{ "kind": "Function", "name": "echo", "uid": "uid-1" }]
                },
                "spec": {
                    "type": "ClusterIP",
                    "selector": { "faas_function": "echo" },
                    "ports": [{ "name": "http", "port": 8080, "targetPort": 8080, "protocol": "TCP" }]
                }
            })
        );
    }

    #[test]
    fn function_without_uid_cannot_own_service() {
        let function = Function::new("echo", FunctionSpec::default());
        assert_eq!(materialize_service(&function).unwrap_err().metric_label(), "metadatamissing");
    }
}
