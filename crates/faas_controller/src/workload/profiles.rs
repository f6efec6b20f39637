use k8s_openapi::api::core::v1::{PodSecurityContext, PodSpec, Toleration};
use kube::runtime::reflector::{ObjectRef, Store};

use crate::api::v1::{Profile, ProfileSpec};
use crate::util::errors::{Error, Result, StdError};

/// Looks up one Profile in the informer cache of the profile namespace.
pub fn find_profile(store: &Store<Profile>, namespace: &str, name: &str) -> Result<ProfileSpec> {
    store
        .get(&ObjectRef::new(name).within(namespace))
        .map(|profile| profile.spec.clone())
        .ok_or_else(|| {
            Error::StdError(StdError::ProfileNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        })
}

/// Resolves every named Profile, failing on the first one that does not exist.
pub fn find_profiles(store: &Store<Profile>, namespace: &str, names: &[String]) -> Result<Vec<ProfileSpec>> {
    names
        .iter()
        .map(|name| find_profile(store, namespace, name))
        .collect()
}

/// Parses the comma separated `com.openfaas.profile` annotation value.
pub fn parse_profile_names(value: Option<&str>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in value.unwrap_or_default().split(',').map(str::trim) {
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// The profile edits for one materialization: removals run before applications.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfileChanges {
    pub remove: Vec<ProfileSpec>,
    pub apply: Vec<ProfileSpec>,
}

impl ProfileChanges {
    pub fn run(&self, pod_spec: &mut PodSpec) {
        for profile in &self.remove {
            remove_profile(profile, pod_spec);
        }
        for profile in &self.apply {
            apply_profile(profile, pod_spec);
        }
    }
}

/// Field-wise equality of two tolerations.
pub fn tolerations_equal(a: &Toleration, b: &Toleration) -> bool {
    a.key == b.key
        && a.operator == b.operator
        && a.value == b.value
        && a.effect == b.effect
        && a.toleration_seconds == b.toleration_seconds
}

// Pod security context fields a profile may set.
macro_rules! security_context_fields {
    ($macro:ident, $($args:tt)*) => {
        $macro!($($args)*; app_armor_profile, fs_group, fs_group_change_policy, run_as_group,
            run_as_non_root, run_as_user, se_linux_options, seccomp_profile, supplemental_groups,
            sysctls, windows_options)
    };
}

macro_rules! overlay_fields {
    ($target:expr, $source:expr; $($field:ident),*) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field.clone();
            }
        )*
    };
}

macro_rules! clear_matching_fields {
    ($target:expr, $source:expr; $($field:ident),*) => {
        $(
            if $source.$field.is_some() && $target.$field == $source.$field {
                $target.$field = None;
            }
        )*
    };
}

fn is_empty_security_context(context: &PodSecurityContext) -> bool {
    context == &PodSecurityContext::default()
}

/// Merges a profile into the pod: tolerations are appended, set security
/// context fields overwrite the pod's, and the runtime class is replaced.
pub fn apply_profile(profile: &ProfileSpec, pod_spec: &mut PodSpec) {
    if let Some(runtime_class) = &profile.runtime_class_name {
        pod_spec.runtime_class_name = Some(runtime_class.clone());
    }

    if let Some(tolerations) = profile.tolerations.as_ref().filter(|t| !t.is_empty()) {
        pod_spec
            .tolerations
            .get_or_insert_with(Vec::new)
            .extend(tolerations.iter().cloned());
    }

    if let Some(source) = &profile.pod_security_context {
        let target = pod_spec.security_context.get_or_insert_with(Default::default);
        security_context_fields!(overlay_fields, target, source);
    }
}

/// Undoes [`apply_profile`] for values that still match the profile, leaving
/// anything another actor changed in place.
pub fn remove_profile(profile: &ProfileSpec, pod_spec: &mut PodSpec) {
    if profile.runtime_class_name.is_some() && pod_spec.runtime_class_name == profile.runtime_class_name {
        pod_spec.runtime_class_name = None;
    }

    if let (Some(remove), Some(current)) = (&profile.tolerations, pod_spec.tolerations.as_mut()) {
        current.retain(|t| !remove.iter().any(|r| tolerations_equal(t, r)));
        if current.is_empty() {
            pod_spec.tolerations = None;
        }
    }

    if let (Some(source), Some(target)) = (&profile.pod_security_context, pod_spec.security_context.as_mut()) {
        security_context_fields!(clear_matching_fields, target, source);
        if is_empty_security_context(target) {
            pod_spec.security_context = None;
        }
    }
}
