use crate::{filter::Notification, router::EnqueueRouter};

use futures::StreamExt;
use kube::{
    Api, Client,
    api::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
};
use kube_runtime::{
    WatchStreamExt,
    reflector::{
        ObjectRef,
        store::{Store, Writer},
    },
    watcher::{self, Event},
};
use log::{debug, info, warn};
use std::{collections::HashSet, pin::pin, sync::Arc};

/// Translates raw watch events into [`Notification`]s while keeping a local
/// cache of the watched objects up to date.
pub(crate) struct NotificationAdapter {
    api_resource: ApiResource,
    writer: Writer<DynamicObject>,
    reader: Store<DynamicObject>,
    /// Notifications of an ongoing (re-)list, released once the cache is
    /// swapped so that reconcilers always find the objects they are told about.
    init_batch: Vec<Notification>,
    init_seen: HashSet<ObjectRef<DynamicObject>>,
}

impl NotificationAdapter {
    pub(crate) fn new(api_resource: ApiResource) -> Self {
        let writer = Writer::new(api_resource.clone());
        let reader = writer.as_reader();
        Self {
            api_resource,
            writer,
            reader,
            init_batch: Default::default(),
            init_seen: Default::default(),
        }
    }

    pub(crate) fn store(&self) -> Store<DynamicObject> {
        self.reader.clone()
    }

    /// List responses do not carry type information, add it so that filters
    /// can rely on it.
    fn with_types(&self, mut object: DynamicObject) -> DynamicObject {
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: self.api_resource.api_version.clone(),
                kind: self.api_resource.kind.clone(),
            });
        }
        object
    }

    fn object_ref(&self, object: &DynamicObject) -> ObjectRef<DynamicObject> {
        ObjectRef::from_obj_with(object, self.api_resource.clone())
    }

    fn changed(&self, object: DynamicObject) -> Notification {
        let previous = self.reader.get(&self.object_ref(&object));
        let new = Arc::new(object);
        match previous {
            Some(old) => Notification::Updated { old, new },
            None => Notification::Added(new),
        }
    }

    pub(crate) fn apply(&mut self, event: Event<DynamicObject>) -> Vec<Notification> {
        match event {
            Event::Apply(object) => {
                let object = self.with_types(object);
                let notification = self.changed(object.clone());
                self.writer.apply_watcher_event(&Event::Apply(object));
                vec![notification]
            }
            Event::Delete(object) => {
                let object = self.with_types(object);
                self.writer.apply_watcher_event(&Event::Delete(object.clone()));
                vec![Notification::Deleted(Arc::new(object))]
            }
            Event::Init => {
                self.init_batch.clear();
                self.init_seen.clear();
                self.writer.apply_watcher_event(&Event::Init);
                vec![]
            }
            Event::InitApply(object) => {
                let object = self.with_types(object);
                self.init_seen.insert(self.object_ref(&object));
                self.init_batch.push(self.changed(object.clone()));
                self.writer.apply_watcher_event(&Event::InitApply(object));
                vec![]
            }
            Event::InitDone => {
                // Objects which vanished while we were not watching.
                let mut notifications: Vec<Notification> = self
                    .reader
                    .state()
                    .into_iter()
                    .filter(|o| !self.init_seen.contains(&self.object_ref(o)))
                    .map(Notification::Deleted)
                    .collect();
                self.writer.apply_watcher_event(&Event::InitDone);
                notifications.append(&mut self.init_batch);
                self.init_seen.clear();
                notifications
            }
        }
    }
}

/// Watches one kind and feeds its notifications into an [`EnqueueRouter`].
pub struct Informer {
    gvk: GroupVersionKind,
    api: Api<DynamicObject>,
    adapter: NotificationAdapter,
}

impl Informer {
    pub fn new(client: Client, gvk: &GroupVersionKind, namespace: Option<&str>) -> Self {
        let api_resource = ApiResource::from_gvk(gvk);
        let api = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &api_resource),
            None => Api::all_with(client, &api_resource),
        };
        Self {
            gvk: gvk.clone(),
            api,
            adapter: NotificationAdapter::new(api_resource),
        }
    }

    /// Read-only view of the watched objects.
    pub fn store(&self) -> Store<DynamicObject> {
        self.adapter.store()
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub async fn run(mut self, router: EnqueueRouter) {
        info!(
            "start watching {}/{}/{}",
            self.gvk.group, self.gvk.version, self.gvk.kind
        );
        let mut events = pin!(watcher::watcher(self.api.clone(), watcher::Config::default()).default_backoff());
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    for notification in self.adapter.apply(event) {
                        router.handle(&self.gvk, &notification);
                    }
                }
                Err(e) => warn!(
                    "watch of {}/{}/{} failed: {}",
                    self.gvk.group, self.gvk.version, self.gvk.kind, e
                ),
            }
        }
        debug!(
            "watch of {}/{}/{} terminated",
            self.gvk.group, self.gvk.version, self.gvk.kind
        );
    }
}
