use kube::{
    Resource, ResourceExt,
    api::{ApiResource, DynamicObject},
};
use kube_runtime::reflector::ObjectRef;
use std::str::FromStr;

/// The unit of work of the dispatch core: identifies a reconcilable object
/// within the kind owned by the controller.
///
/// The work queue only ever holds keys, never object snapshots; the current
/// state is read from the cache when the key is processed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("invalid object key {0:?}, expected <namespace>/<name> or <name>")]
pub struct InvalidKey(pub String);

impl FromStr for ObjectKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split("/").collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(ns, name)),
            _ => Err(InvalidKey(s.to_string())),
        }
    }
}

impl From<&DynamicObject> for ObjectKey {
    fn from(o: &DynamicObject) -> Self {
        Self::from_resource(o)
    }
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn from_resource<K: Resource>(o: &K) -> Self {
        Self {
            name: o.name_any(),
            namespace: o.namespace().unwrap_or_else(|| "".to_string()),
        }
    }

    /// Cache lookup reference for this key within the given resource type.
    pub fn object_ref(&self, ar: &ApiResource) -> ObjectRef<DynamicObject> {
        let obj_ref = ObjectRef::<DynamicObject>::new_with(self.name.as_str(), ar.clone());
        if self.namespace.is_empty() {
            obj_ref
        } else {
            obj_ref.within(self.namespace.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn display_and_parse() {
        let key = ObjectKey::new("ns", "a");
        assert_eq!("ns/a", key.to_string());
        assert_eq!(Ok(key), "ns/a".parse::<ObjectKey>());
        assert_eq!(Ok(ObjectKey::new("", "a")), "a".parse::<ObjectKey>());
        assert_eq!("a", ObjectKey::new("", "a").to_string());
        assert!("ns/a/b".parse::<ObjectKey>().is_err());
        assert!("ns/".parse::<ObjectKey>().is_err());
        assert!("".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn same_object_same_key() {
        let ar = ApiResource::from_gvk(&kube::api::GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let mut a = DynamicObject::new("x", &ar).within("ns");
        let b = a.clone();
        a.metadata = ObjectMeta {
            resource_version: Some("42".to_string()),
            ..a.metadata
        };
        assert_eq!(ObjectKey::from(&a), ObjectKey::from(&b));
        assert_eq!(ObjectKey::new("ns", "x"), ObjectKey::from(&a));
    }
}
