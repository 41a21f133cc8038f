use crate::{
    enqueuer::Enqueuer,
    filter::{EventFilter, Notification},
    key::ObjectKey,
    owner_index::resolve_owner_key,
};

use kube::api::{DynamicObject, GroupVersionKind};
use log::debug;
use std::{collections::HashMap, sync::Arc};

/// How a notification which passed its filter is mapped to a key.
#[derive(Clone, Debug, PartialEq)]
pub enum KeyExtractor {
    /// The object's own key.
    Own,
    /// The key of the object's controlling parent of the given kind.
    ControllerOf(GroupVersionKind),
}

impl KeyExtractor {
    pub fn extract(&self, object: &DynamicObject) -> Option<ObjectKey> {
        match self {
            KeyExtractor::Own => Some(ObjectKey::from(object)),
            KeyExtractor::ControllerOf(owner) => resolve_owner_key(object, owner),
        }
    }
}

/// Filter and key extraction for one watched kind.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub filter: EventFilter,
    pub extractor: KeyExtractor,
}

impl Route {
    /// Route for the kind owned by the controller, enqueueing the object itself.
    pub fn direct(kind: GroupVersionKind) -> Self {
        Self {
            filter: EventFilter::Direct { kind },
            extractor: KeyExtractor::Own,
        }
    }

    /// Route for objects controlled by `owner`, enqueueing their owner.
    pub fn controlled_by(owner: GroupVersionKind) -> Self {
        Self {
            filter: EventFilter::ControlledBy {
                owner: owner.clone(),
            },
            extractor: KeyExtractor::ControllerOf(owner),
        }
    }

    /// For updates the new snapshot wins. The old one is only used when the
    /// object no longer passes the filter, so its former parent is told.
    pub fn route(&self, notification: &Notification) -> Option<ObjectKey> {
        match notification {
            Notification::Updated { old, new } => {
                if self.filter.accepts_object(new) {
                    self.extractor.extract(new)
                } else if self.filter.accepts_object(old) {
                    self.extractor.extract(old)
                } else {
                    None
                }
            }
            other if self.filter.accepts_object(other.object()) => {
                self.extractor.extract(other.object())
            }
            _ => None,
        }
    }
}

/// Mapping of every watched kind to its [`Route`], built once at startup.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: HashMap<GroupVersionKind, Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with(mut self, kind: GroupVersionKind, route: Route) -> Self {
        self.routes.insert(kind, route);
        self
    }

    pub fn get(&self, kind: &GroupVersionKind) -> Option<&Route> {
        self.routes.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.routes.keys()
    }

    /// The key to reconcile for a notification on a watched `kind`, if any.
    pub fn route(&self, kind: &GroupVersionKind, notification: &Notification) -> Option<ObjectKey> {
        self.routes
            .get(kind)
            .and_then(|route| route.route(notification))
    }
}

/// Routes watch notifications into the work queue.
///
/// Runs on the notification delivery path, so it never blocks: routing is a
/// pure lookup and enqueueing only takes the queue's lock.
#[derive(Clone)]
pub struct EnqueueRouter {
    table: Arc<RouteTable>,
    enqueuer: Enqueuer,
}

impl EnqueueRouter {
    pub fn new(table: RouteTable, enqueuer: Enqueuer) -> Self {
        Self {
            table: Arc::new(table),
            enqueuer,
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn handle(&self, kind: &GroupVersionKind, notification: &Notification) {
        match self.table.route(kind, notification) {
            Some(key) => self.enqueuer.enqueue_key(key),
            None => {
                let object = notification.object();
                debug!(
                    "dropping notification for {}/{}/{} {} as it does not map to any key",
                    kind.group,
                    kind.version,
                    kind.kind,
                    ObjectKey::from(object)
                );
            }
        }
    }
}
