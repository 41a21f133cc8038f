use crate::key::ObjectKey;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt, api::GroupVersionKind};

/// Returns the controller owner reference of `object` if it is of kind `owner`.
///
/// Only the reference flagged with `controller: true` is considered, so an
/// object has at most one controlling parent.
pub fn controller_of<'a, K: Resource>(
    object: &'a K,
    owner: &GroupVersionKind,
) -> Option<&'a OwnerReference> {
    let api_version = owner.api_version();
    object.owner_references().iter().find(|r| {
        r.controller == Some(true) && r.kind == owner.kind && r.api_version == api_version
    })
}

/// Resolve the key of the object's controlling parent of kind `owner`.
///
/// Owner references are namespace local, so the parent's namespace is the
/// object's own namespace.
pub fn resolve_owner_key<K: Resource>(object: &K, owner: &GroupVersionKind) -> Option<ObjectKey> {
    controller_of(object, owner).map(|r| ObjectKey {
        namespace: object.namespace().unwrap_or_else(|| "".to_string()),
        name: r.name.clone(),
    })
}
