use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube_quantity::ParsedQuantity;

use crate::api::v1::{FunctionResources, FunctionSpec};
use crate::util::errors::{Error, Result, StdError};

/// Parses a Kubernetes quantity string (`250m`, `128Mi`) into a `Quantity`.
pub fn parse_quantity(field: &str, value: &str) -> Result<Quantity> {
    ParsedQuantity::try_from(value.trim())
        .map(Quantity::from)
        .map_err(|e| {
            Error::StdError(StdError::InvalidQuantity {
                field: field.to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })
        })
}

fn resource_list(kind: &str, resources: &FunctionResources) -> Result<Option<BTreeMap<String, Quantity>>> {
    let mut list = BTreeMap::new();
    if let Some(cpu) = &resources.cpu {
        list.insert("cpu".to_string(), parse_quantity(&format!("{kind}.cpu"), cpu)?);
    }
    if let Some(memory) = &resources.memory {
        list.insert("memory".to_string(), parse_quantity(&format!("{kind}.memory"), memory)?);
    }
    Ok((!list.is_empty()).then_some(list))
}

/// Container resources from the Function's limits and requests. A malformed
/// quantity aborts materialization.
pub fn resource_requirements(spec: &FunctionSpec) -> Result<Option<ResourceRequirements>> {
    let limits = match &spec.limits {
        Some(limits) => resource_list("limits", limits)?,
        None => None,
    };
    let requests = match &spec.requests {
        Some(requests) => resource_list("requests", requests)?,
        None => None,
    };

    if limits.is_none() && requests.is_none() {
        return Ok(None);
    }

    Ok(Some(ResourceRequirements {
        limits,
        requests,
        ..Default::default()
    }))
}
