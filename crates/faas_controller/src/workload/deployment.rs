use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec, Secret, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::api::v1::{Function, FunctionSpec};
use crate::util::errors::{Error, Result, StdError};
use crate::workload::secrets::{project_secrets, remove_volume};
use crate::workload::{
    desired_replicas, replicas::min_replicas, resources::resource_requirements, FunctionFactory,
    LastAppliedSpec, ProfileChanges, FUNCTION_LABEL, FUNCTION_SPEC_ANNOTATION, HANDLER_ENV_VAR,
    NON_ROOT_USER_ID, SCRAPE_ANNOTATION, SERVICE_ACCOUNT_ANNOTATION, WATCHDOG_PORT,
};

pub const TMP_VOLUME_NAME: &str = "temp";
const TMP_MOUNT_PATH: &str = "/tmp";
const REVISION_HISTORY_LIMIT: i32 = 5;

/// Builds the complete Deployment a Function should converge to.
///
/// `existing` is the live Deployment on the update path. Only its replica
/// count, resource version and the profile-managed pod fields (tolerations,
/// runtime class and pod security context) are carried over; everything else
/// is rebuilt, so an error here never leaves a half-edited object behind.
pub fn materialize_deployment(
    function: &Function,
    existing: Option<&Deployment>,
    secrets: &BTreeMap<String, Secret>,
    profiles: &ProfileChanges,
    factory: &FunctionFactory,
) -> Result<Deployment> {
    let spec = &function.spec;
    let owner = function.controller_owner_ref(&()).ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing(format!(
            "Function {} has no uid to own its workload",
            function.name_any()
        )))
    })?;

    let probes = factory.make_probes(spec)?;
    let resources = resource_requirements(spec)?;

    let live_replicas = existing.and_then(|d| d.spec.as_ref()).and_then(|s| s.replicas);
    let replicas = desired_replicas(min_replicas(spec), live_replicas);

    let mut deployment_annotations = function_annotations(spec);
    deployment_annotations.insert(
        FUNCTION_SPEC_ANNOTATION.to_string(),
        LastAppliedSpec::new(spec.clone()).encode()?,
    );

    let container = Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some(factory.config.image_pull_policy.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: WATCHDOG_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env_vars(spec)),
        resources,
        liveness_probe: Some(probes.liveness),
        readiness_probe: Some(probes.readiness),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut pod_spec = PodSpec {
        containers: vec![container],
        node_selector: node_selector(&spec.constraints),
        service_account_name: spec.annotation(SERVICE_ACCOUNT_ANNOTATION).map(str::to_string),
        enable_service_links: Some(false),
        ..Default::default()
    };
    if let Some(live) = existing.and_then(|d| d.spec.as_ref()).and_then(|s| s.template.spec.as_ref()) {
        pod_spec.tolerations = live.tolerations.clone();
        pod_spec.runtime_class_name = live.runtime_class_name.clone();
        pod_spec.security_context = live.security_context.clone();
    }

    configure_read_only_root_filesystem(spec.read_only_root_filesystem, &mut pod_spec);
    configure_container_user(factory.config.set_non_root_user, &mut pod_spec);
    project_secrets(&spec.name, &spec.secrets, secrets, &mut pod_spec)?;
    profiles.run(&mut pod_spec);

    let selector = BTreeMap::from([(FUNCTION_LABEL.to_string(), spec.name.clone())]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: function.namespace(),
            labels: Some(selector.clone()),
            annotations: Some(deployment_annotations),
            owner_references: Some(vec![owner]),
            resource_version: existing.and_then(|d| d.resource_version()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(0)),
                    max_surge: Some(IntOrString::Int(1)),
                }),
            }),
            revision_history_limit: Some(REVISION_HISTORY_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(spec.name.clone()),
                    labels: Some(pod_labels(function)),
                    annotations: Some(function_annotations(spec)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// User annotations on top of a disabled Prometheus scrape; the user may
/// re-enable scraping explicitly.
pub fn function_annotations(spec: &FunctionSpec) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([(SCRAPE_ANNOTATION.to_string(), "false".to_string())]);
    if let Some(user) = &spec.annotations {
        annotations.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    annotations
}

/// Pod labels: the user's, with the identity labels always winning.
pub fn pod_labels(function: &Function) -> BTreeMap<String, String> {
    let spec = &function.spec;
    let mut labels = spec.labels.clone().unwrap_or_default();
    labels.insert(FUNCTION_LABEL.to_string(), spec.name.clone());
    labels.insert("app".to_string(), spec.name.clone());
    labels.insert("controller".to_string(), function.name_any());
    labels
}

fn env_vars(spec: &FunctionSpec) -> Vec<EnvVar> {
    let handler = spec.handler.iter().map(|handler| EnvVar {
        name: HANDLER_ENV_VAR.to_string(),
        value: Some(handler.clone()),
        ..Default::default()
    });
    let user = spec.environment.iter().flatten().map(|(name, value)| EnvVar {
        name: name.clone(),
        value: Some(value.clone()),
        ..Default::default()
    });
    handler.chain(user).collect()
}

/// `key=value` constraints as a node selector; anything else is skipped.
pub fn node_selector(constraints: &[String]) -> Option<BTreeMap<String, String>> {
    let selector: BTreeMap<String, String> = constraints
        .iter()
        .filter_map(|constraint| {
            let parts: Vec<&str> = constraint.split('=').collect();
            match parts.as_slice() {
                [key, value] if !key.trim().is_empty() => {
                    Some((key.trim().to_string(), value.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect();
    (!selector.is_empty()).then_some(selector)
}

/// Sets the containers' root filesystem mode and keeps a writable `/tmp`
/// exactly when the root filesystem is read-only. Safe to run repeatedly.
pub fn configure_read_only_root_filesystem(read_only: bool, pod_spec: &mut PodSpec) {
    remove_volume(pod_spec, TMP_VOLUME_NAME);

    for container in pod_spec.containers.iter_mut() {
        container
            .security_context
            .get_or_insert_with(Default::default)
            .read_only_root_filesystem = Some(read_only);
    }

    if !read_only {
        return;
    }

    pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: TMP_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    for container in pod_spec.containers.iter_mut() {
        container.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
            name: TMP_VOLUME_NAME.to_string(),
            mount_path: TMP_MOUNT_PATH.to_string(),
            read_only: Some(false),
            ..Default::default()
        });
    }
}

/// Pins the containers to a fixed non-root UID when enabled; otherwise the
/// image's user applies.
pub fn configure_container_user(set_non_root_user: bool, pod_spec: &mut PodSpec) {
    if !set_non_root_user {
        return;
    }
    for container in pod_spec.containers.iter_mut() {
        container
            .security_context
            .get_or_insert_with(Default::default)
            .run_as_user = Some(NON_ROOT_USER_ID);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::{FunctionResources, ProfileSpec};
    use crate::workload::{FactoryConfig, PROBE_INITIAL_DELAY_ANNOTATION};
    use assert_json_diff::assert_json_include;
    use k8s_openapi::api::core::v1::{LocalObjectReference, Toleration};
    use k8s_openapi::ByteString;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn function(spec: FunctionSpec) -> Function {
        let mut function = Function::new("echo", spec);
        function.metadata.namespace = Some("openfaas-fn".into());
        function.metadata.uid = Some("0b6c3c1e-uid".into());
        function
    }

    fn echo_spec() -> FunctionSpec {
        FunctionSpec {
            name: "echo".into(),
            image: "ghcr.io/x/echo:latest".into(),
            ..Default::default()
        }
    }

    fn pod(deployment: &Deployment) -> &PodSpec {
        deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn materialize(function: &Function, existing: Option<&Deployment>) -> Result<Deployment> {
        materialize_deployment(
            function,
            existing,
            &BTreeMap::new(),
            &ProfileChanges::default(),
            &FunctionFactory::default(),
        )
    }

    #[test]
    fn registry_secret_becomes_pull_secret_only() {
        let mut spec = echo_spec();
        spec.secrets = vec!["pullsecret".into()];
        let secrets = BTreeMap::from([(
            "pullsecret".to_string(),
            Secret {
                type_: Some("kubernetes.io/dockerconfigjson".into()),
                data: Some(BTreeMap::from([(
                    ".dockerconfigjson".to_string(),
                    ByteString(b"{}".to_vec()),
                )])),
                ..Default::default()
            },
        )]);

        let deployment = materialize_deployment(
            &function(spec),
            None,
            &secrets,
            &ProfileChanges::default(),
            &FunctionFactory::default(),
        )
        .unwrap();

        let pod = pod(&deployment);
        assert_eq!(
            pod.image_pull_secrets,
            Some(vec![LocalObjectReference {
                name: "pullsecret".into()
            }])
        );
        assert!(pod.volumes.is_none());
    }

    #[test]
    fn builds_owned_deployment_with_identity() {
        let deployment = materialize(&function(echo_spec()), None).unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&deployment).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "echo",
                    "namespace": "openfaas-fn",
                    "labels": { "faas_function": "echo" },
                    "annotations": { "prometheus.io.scrape": "false" },
                    "ownerReferences": [{
                        "apiVersion": "openfaas.com/v1",
                        "kind": "Function",
                        "name": "echo",
                        "uid": "0b6c3c1e-uid",
                        "controller": true
                    }]
                },
                "spec": {
                    "selector": { "matchLabels": { "faas_function": "echo" } },
                    "revisionHistoryLimit": 5,
                    "template": {
                        "spec": {
                            "enableServiceLinks": false,
                            "containers": [{
                                "name": "echo",
                                "image": "ghcr.io/x/echo:latest",
                                "imagePullPolicy": "Always",
                                "ports": [{ "containerPort": 8080, "name": "http", "protocol": "TCP" }]
                            }]
                        }
                    }
                }
            })
        );
        assert!(deployment.spec.unwrap().replicas.is_none());
        let fingerprint = LastAppliedSpec::from_deployment(&materialize(&function(echo_spec()), None).unwrap());
        assert_eq!(fingerprint.unwrap().spec(), &echo_spec());
    }

    #[test]
    fn env_is_sorted_after_handler() {
        let mut spec = echo_spec();
        spec.handler = Some("node index.js".into());
        spec.environment = Some(BTreeMap::from([
            ("write_debug".to_string(), "true".to_string()),
            ("content_type".to_string(), "text/plain".to_string()),
        ]));

        let deployment = materialize(&function(spec), None).unwrap();
        let names: Vec<String> = pod(&deployment).containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, vec!["fprocess", "content_type", "write_debug"]);
    }

    #[test]
    fn user_labels_cannot_override_identity() {
        let mut spec = echo_spec();
        spec.labels = Some(BTreeMap::from([
            ("faas_function".to_string(), "other".to_string()),
            ("team".to_string(), "payments".to_string()),
        ]));

        let deployment = materialize(&function(spec), None).unwrap();
        let labels = deployment.spec.unwrap().template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels.get("faas_function").map(String::as_str), Some("echo"));
        assert_eq!(labels.get("team").map(String::as_str), Some("payments"));
    }

    #[test]
    fn scrape_annotation_can_be_overridden() {
        let mut spec = echo_spec();
        spec.annotations = Some(BTreeMap::from([(
            SCRAPE_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        let deployment = materialize(&function(spec), None).unwrap();
        let annotations = deployment.metadata.annotations.unwrap();
        assert_eq!(annotations.get(SCRAPE_ANNOTATION).map(String::as_str), Some("true"));
        assert!(annotations.contains_key(FUNCTION_SPEC_ANNOTATION));
    }

    #[test]
    fn malformed_constraints_are_skipped() {
        let constraints = vec![
            "node.kubernetes.io/instance-type=m5.large".to_string(),
            "bad".to_string(),
            "a=b=c".to_string(),
        ];
        assert_eq!(
            node_selector(&constraints),
            Some(BTreeMap::from([(
                "node.kubernetes.io/instance-type".to_string(),
                "m5.large".to_string()
            )]))
        );
        assert_eq!(node_selector(&["bad".to_string()]), None);
    }

    #[test]
    fn read_only_toggle_is_idempotent() {
        let mut spec = echo_spec();
        spec.read_only_root_filesystem = true;
        let deployment = materialize(&function(spec), None).unwrap();
        let mut pod = pod(&deployment).clone();

        configure_read_only_root_filesystem(true, &mut pod);
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(pod.containers[0].volume_mounts.as_ref().unwrap().len(), 1);
        assert_eq!(
            pod.containers[0].volume_mounts.as_ref().unwrap()[0].mount_path,
            "/tmp"
        );

        configure_read_only_root_filesystem(false, &mut pod);
        assert!(pod.volumes.is_none());
        assert!(pod.containers[0].volume_mounts.is_none());
        assert_eq!(
            pod.containers[0].security_context.as_ref().unwrap().read_only_root_filesystem,
            Some(false)
        );
    }

    #[test]
    fn non_root_user_is_forced_when_configured() {
        let factory = FunctionFactory::new(FactoryConfig {
            set_non_root_user: true,
            ..Default::default()
        });
        let deployment = materialize_deployment(
            &function(echo_spec()),
            None,
            &BTreeMap::new(),
            &ProfileChanges::default(),
            &factory,
        )
        .unwrap();
        let context = pod(&deployment).containers[0].security_context.clone().unwrap();
        assert_eq!(context.run_as_user, Some(12000));

        let default = materialize(&function(echo_spec()), None).unwrap();
        assert_eq!(
            pod(&default).containers[0].security_context.as_ref().unwrap().run_as_user,
            None
        );
    }

    #[test]
    fn update_keeps_live_replicas_and_resource_version() {
        let mut live = materialize(&function(echo_spec()), None).unwrap();
        live.metadata.resource_version = Some("42".into());
        live.spec.as_mut().unwrap().replicas = Some(0);

        let mut spec = echo_spec();
        spec.image = "ghcr.io/x/echo:v2".into();
        let updated = materialize(&function(spec), Some(&live)).unwrap();

        assert_eq!(updated.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(updated.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn update_removes_stale_profile_before_applying_new_one() {
        let spot = ProfileSpec {
            tolerations: Some(vec![Toleration {
                key: Some("spot".into()),
                operator: Some("Exists".into()),
                ..Default::default()
            }]),
            runtime_class_name: Some("gvisor".into()),
            ..Default::default()
        };
        let gpu = ProfileSpec {
            runtime_class_name: Some("nvidia".into()),
            ..Default::default()
        };

        let first = materialize_deployment(
            &function(echo_spec()),
            None,
            &BTreeMap::new(),
            &ProfileChanges {
                remove: vec![],
                apply: vec![spot.clone()],
            },
            &FunctionFactory::default(),
        )
        .unwrap();
        assert_eq!(pod(&first).tolerations.as_ref().unwrap().len(), 1);

        let second = materialize_deployment(
            &function(echo_spec()),
            Some(&first),
            &BTreeMap::new(),
            &ProfileChanges {
                remove: vec![spot],
                apply: vec![gpu],
            },
            &FunctionFactory::default(),
        )
        .unwrap();
        assert!(pod(&second).tolerations.is_none());
        assert_eq!(pod(&second).runtime_class_name.as_deref(), Some("nvidia"));
    }

    #[test]
    fn repeated_updates_keep_profile_tolerations_stable() {
        let gpu = ProfileSpec {
            tolerations: Some(vec![Toleration {
                key: Some("nvidia.com/gpu".into()),
                operator: Some("Exists".into()),
                effect: Some("NoSchedule".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let mut current = materialize_deployment(
            &function(echo_spec()),
            None,
            &BTreeMap::new(),
            &ProfileChanges {
                remove: vec![],
                apply: vec![gpu.clone()],
            },
            &FunctionFactory::default(),
        )
        .unwrap();

        for tag in ["v2", "v3", "v4"] {
            let mut spec = echo_spec();
            spec.image = format!("ghcr.io/openfaas/echo:{tag}");
            current = materialize_deployment(
                &function(spec),
                Some(&current),
                &BTreeMap::new(),
                &ProfileChanges {
                    remove: vec![gpu.clone()],
                    apply: vec![gpu.clone()],
                },
                &FunctionFactory::default(),
            )
            .unwrap();
            assert_eq!(pod(&current).tolerations.as_ref().unwrap().len(), 1, "after {tag}");
        }
    }

    #[test]
    fn malformed_inputs_abort_materialization() {
        let mut spec = echo_spec();
        spec.limits = Some(FunctionResources {
            cpu: None,
            memory: Some("lots".into()),
        });
        assert_eq!(
            materialize(&function(spec), None).unwrap_err().metric_label(),
            "invalidquantity"
        );

        let mut spec = echo_spec();
        spec.annotations = Some(BTreeMap::from([(
            PROBE_INITIAL_DELAY_ANNOTATION.to_string(),
            "later".to_string(),
        )]));
        assert_eq!(
            materialize(&function(spec), None).unwrap_err().metric_label(),
            "invalidduration"
        );

        let mut spec = echo_spec();
        spec.secrets = vec!["missing".into()];
        assert_eq!(
            materialize(&function(spec), None).unwrap_err().metric_label(),
            "secretnotfound"
        );
    }

    #[test]
    fn min_replicas_label_sets_initial_count() {
        let mut spec = echo_spec();
        spec.labels = Some(BTreeMap::from([(
            "com.openfaas.scale.min".to_string(),
            "2".to_string(),
        )]));
        let deployment = materialize(&function(spec), None).unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(2));
    }
}
