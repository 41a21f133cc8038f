use crate::owner_index::controller_of;

use kube::api::{DynamicObject, GroupVersionKind};
use std::sync::Arc;

/// A change observed on a watched resource.
#[derive(Clone, Debug)]
pub enum Notification {
    Added(Arc<DynamicObject>),
    Updated {
        old: Arc<DynamicObject>,
        new: Arc<DynamicObject>,
    },
    /// Carries the last known state of the deleted object.
    Deleted(Arc<DynamicObject>),
}

impl Notification {
    /// The current snapshot of the affected object.
    pub fn object(&self) -> &DynamicObject {
        match self {
            Notification::Added(o) => o,
            Notification::Updated { new, .. } => new,
            Notification::Deleted(o) => o,
        }
    }
}

/// Group/version/kind of an object as recorded in its type metadata.
pub(crate) fn object_gvk(object: &DynamicObject) -> Option<GroupVersionKind> {
    object.types.as_ref().map(|t| {
        let (group, version) = match t.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", t.api_version.as_str()),
        };
        GroupVersionKind::gvk(group, version, t.kind.as_str())
    })
}

/// Predicate selecting the notifications relevant to this controller.
#[derive(Clone, Debug, PartialEq)]
pub enum EventFilter {
    /// Objects of the kind owned by the controller.
    Direct { kind: GroupVersionKind },
    /// Objects controlled by an object of the given kind.
    ControlledBy { owner: GroupVersionKind },
}

impl EventFilter {
    pub fn accepts_object(&self, object: &DynamicObject) -> bool {
        match self {
            EventFilter::Direct { kind } => object_gvk(object).as_ref() == Some(kind),
            EventFilter::ControlledBy { owner } => controller_of(object, owner).is_some(),
        }
    }

    /// An update passes if either snapshot does, so an object leaving the
    /// filtered set (e.g. losing its controller) is still reported.
    pub fn accepts(&self, notification: &Notification) -> bool {
        match notification {
            Notification::Updated { old, new } => {
                self.accepts_object(new) || self.accepts_object(old)
            }
            other => self.accepts_object(other.object()),
        }
    }
}
