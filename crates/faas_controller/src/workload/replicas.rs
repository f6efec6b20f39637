use crate::api::v1::FunctionSpec;
use crate::workload::MIN_REPLICAS_LABEL;

/// The user-declared minimum from the `com.openfaas.scale.min` label.
///
/// Values that are not positive integers are treated as absent.
pub fn min_replicas(spec: &FunctionSpec) -> Option<i32> {
    spec.label(MIN_REPLICAS_LABEL)
        .and_then(|value| value.trim().parse::<i32>().ok())
        .filter(|min| *min > 0)
}

/// Arbitrates the replica count between the declared minimum and the live Deployment.
///
/// `live` is `None` when no Deployment exists yet. A live count of zero is a
/// scale-to-zero decision and is never raised; a live count above the minimum
/// belongs to an autoscaler and is left alone.
pub fn desired_replicas(min: Option<i32>, live: Option<i32>) -> Option<i32> {
    match (min, live) {
        (None, None) => None,
        (Some(min), None) => Some(min),
        (_, Some(0)) => Some(0),
        (None, Some(live)) => Some(live),
        (Some(min), Some(live)) if live >= min => Some(live),
        (Some(min), Some(_)) => Some(min),
    }
}
