use kube::{Resource, ResourceExt};

use crate::api::v1::Function;

/// True iff `resource` carries an owner reference pointing at this exact Function:
/// same kind, same apiVersion and same UID.
pub fn is_owned<K: Resource>(resource: &K, function: &Function) -> bool {
    let Some(uid) = function.uid() else {
        return false;
    };
    let kind = Function::kind(&());
    let api_version = Function::api_version(&());

    resource
        .owner_references()
        .iter()
        .any(|oref| oref.kind == kind && oref.api_version == api_version && oref.uid == uid)
}
