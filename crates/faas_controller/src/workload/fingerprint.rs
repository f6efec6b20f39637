use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

use crate::api::v1::{Function, FunctionResources, FunctionSpec};
use crate::util::errors::{Error, Result, StdError};
use crate::workload::FUNCTION_SPEC_ANNOTATION;

/// The Function spec a Deployment was last materialized from.
///
/// It travels with the Deployment as a JSON annotation, but is compared as a
/// typed value so that convergence does not depend on serialization details.
#[derive(Clone, Debug, PartialEq)]
pub struct LastAppliedSpec(FunctionSpec);

impl LastAppliedSpec {
    pub fn new(spec: FunctionSpec) -> Self {
        Self(spec)
    }

    /// Decodes the fingerprint annotation; `None` when it is absent or unreadable.
    pub fn from_deployment(deployment: &Deployment) -> Option<Self> {
        let raw = deployment
            .metadata
            .annotations
            .as_ref()?
            .get(FUNCTION_SPEC_ANNOTATION)?;

        match serde_json::from_str::<FunctionSpec>(raw) {
            Ok(spec) => Some(Self(spec)),
            Err(e) => {
                debug!("ignoring unreadable {} annotation: {}", FUNCTION_SPEC_ANNOTATION, e);
                None
            }
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(&self.0).map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.0
    }
}

/// Equality of two specs once empty collections and unset values are treated alike.
pub fn specs_equal(a: &FunctionSpec, b: &FunctionSpec) -> bool {
    normalized(a) == normalized(b)
}

/// Whether the Deployment was generated from a different spec than the Function's current one.
pub fn deployment_needs_update(function: &Function, deployment: &Deployment) -> bool {
    match LastAppliedSpec::from_deployment(deployment) {
        Some(previous) => !specs_equal(previous.spec(), &function.spec),
        None => true,
    }
}

fn normalized(spec: &FunctionSpec) -> FunctionSpec {
    FunctionSpec {
        environment: non_empty_map(&spec.environment),
        labels: non_empty_map(&spec.labels),
        annotations: non_empty_map(&spec.annotations),
        limits: non_empty_resources(&spec.limits),
        requests: non_empty_resources(&spec.requests),
        ..spec.clone()
    }
}

fn non_empty_map(map: &Option<BTreeMap<String, String>>) -> Option<BTreeMap<String, String>> {
    map.clone().filter(|m| !m.is_empty())
}

fn non_empty_resources(resources: &Option<FunctionResources>) -> Option<FunctionResources> {
    resources
        .clone()
        .filter(|r| r.cpu.is_some() || r.memory.is_some())
}
