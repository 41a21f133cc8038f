use crate::{
    enqueuer::Enqueuer,
    errors::{ControllerError, ExtKubeApiError},
    key::ObjectKey,
};

use futures::StreamExt;
use kube::{
    Api, Client,
    api::{ApiResource, DynamicObject, GroupVersionKind},
};
use kube_runtime::{WatchStreamExt, watcher};
use log::{debug, info, warn};
use prometheus_source_apis::Destination;
use std::{
    collections::{HashMap, HashSet},
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::task::JoinHandle;

/// An object some reconciled (parent) object depends on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackedReference {
    pub gvk: GroupVersionKind,
    pub key: ObjectKey,
}

impl std::fmt::Display for TrackedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{} {}",
            self.gvk.group, self.gvk.version, self.gvk.kind, self.key
        )
    }
}

/// Remembers which parents depend on which referenced objects and re-enqueues
/// the parents whenever a referenced object changes.
pub struct Tracker {
    enqueuer: Enqueuer,
    /// reference -> parents
    references: Mutex<HashMap<TrackedReference, HashSet<ObjectKey>>>,
}

impl Tracker {
    pub fn new(enqueuer: Enqueuer) -> Self {
        Self {
            enqueuer,
            references: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TrackedReference, HashSet<ObjectKey>>> {
        self.references.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track(&self, reference: TrackedReference, parent: ObjectKey) {
        self.lock().entry(reference).or_default().insert(parent);
    }

    /// Forget everything `parent` depends on.
    pub fn untrack_parent(&self, parent: &ObjectKey) {
        let mut guard = self.lock();
        guard.retain(|_, parents| {
            parents.remove(parent);
            !parents.is_empty()
        });
    }

    pub fn parents(&self, reference: &TrackedReference) -> HashSet<ObjectKey> {
        self.lock().get(reference).cloned().unwrap_or_default()
    }

    /// Re-enqueue all parents depending on `reference`.
    pub fn on_changed(&self, reference: &TrackedReference) {
        let parents = self.parents(reference);
        for parent in parents {
            debug!("{} changed, enqueue {}", reference, parent);
            self.enqueuer.enqueue_key(parent);
        }
    }
}

/// The URI of a destination which does not need any lookup.
///
/// Returns `Ok(None)` if the destination references an object.
pub fn static_uri(destination: &Destination) -> Result<Option<String>, ControllerError> {
    match (&destination.ref_, &destination.uri) {
        (Some(_), _) => Ok(None),
        (None, Some(uri)) if is_absolute(uri) => Ok(Some(uri.clone())),
        (None, Some(uri)) => Err(ControllerError::InvalidSpec(format!(
            "sink uri {} must be absolute if no ref is given",
            uri
        ))),
        (None, None) => Err(ControllerError::InvalidSpec(
            "sink must define either ref or uri".to_string(),
        )),
    }
}

fn is_absolute(uri: &str) -> bool {
    match uri.split_once("://") {
        Some((scheme, rest)) => !scheme.is_empty() && !rest.is_empty(),
        None => false,
    }
}

/// Append a relative uri to the address of a referenced object.
pub(crate) fn join_uri(base: &str, relative: Option<&str>) -> String {
    match relative {
        Some(relative) if !relative.is_empty() => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            relative.trim_start_matches('/')
        ),
        _ => base.to_string(),
    }
}

/// The `status.address.url` of an addressable object.
pub(crate) fn address_url(object: &DynamicObject) -> Option<String> {
    object
        .data
        .get("status")
        .and_then(|v| v.get("address"))
        .and_then(|v| v.get("url"))
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Resolves [`Destination`]s to URIs.
///
/// Every referenced object is tracked for the parent asking for it and its
/// kind is watched, so the parent is reconciled again as soon as the
/// referenced object appears or becomes addressable.
pub struct SinkResolver {
    client: Client,
    tracker: Arc<Tracker>,
    watches: tokio::sync::Mutex<HashMap<GroupVersionKind, JoinHandle<()>>>,
}

impl Drop for SinkResolver {
    fn drop(&mut self) {
        for (_, handle) in self.watches.get_mut().drain() {
            handle.abort();
        }
    }
}

impl SinkResolver {
    pub fn new(client: Client, enqueuer: Enqueuer) -> Self {
        Self {
            client,
            tracker: Arc::new(Tracker::new(enqueuer)),
            watches: Default::default(),
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Resolve the sink of `parent`, replacing whatever `parent` tracked before.
    pub async fn resolve(
        &self,
        destination: Option<&Destination>,
        parent: &ObjectKey,
    ) -> Result<String, ControllerError> {
        self.tracker.untrack_parent(parent);
        let destination = destination.ok_or_else(|| {
            ControllerError::InvalidSpec(format!("{} does not define a sink", parent))
        })?;
        if let Some(uri) = static_uri(destination)? {
            return Ok(uri);
        }
        let r = match &destination.ref_ {
            Some(r) => r,
            None => return Err(ControllerError::InvalidSpec("sink has no ref".to_string())),
        };
        let namespace = r.namespace.as_deref().unwrap_or(parent.namespace.as_str());
        let reference = TrackedReference {
            gvk: r.gvk(),
            key: ObjectKey::new(namespace, r.name.as_str()),
        };
        self.tracker.track(reference.clone(), parent.clone());
        self.ensure_watch(&reference.gvk).await;
        let address = self.address_of(&reference).await?;
        Ok(join_uri(&address, destination.uri.as_deref()))
    }

    async fn address_of(&self, reference: &TrackedReference) -> Result<String, ControllerError> {
        let gvk = &reference.gvk;
        if gvk.group.is_empty() && gvk.kind == "Service" {
            return Ok(format!(
                "http://{}.{}.svc.cluster.local/",
                reference.key.name, reference.key.namespace
            ));
        }
        let api_resource = ApiResource::from_gvk(gvk);
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            reference.key.namespace.as_str(),
            &api_resource,
        );
        match api.get(reference.key.name.as_str()).await {
            Ok(object) => address_url(&object).ok_or_else(|| {
                ControllerError::SinkNotResolved(format!("{} does not have an address yet", reference))
            }),
            Err(e) if e.is_not_found() => Err(ControllerError::SinkNotResolved(format!(
                "{} does not exist",
                reference
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_watch(&self, gvk: &GroupVersionKind) {
        let mut watches = self.watches.lock().await;
        if watches.get(gvk).map_or(false, |h| !h.is_finished()) {
            return;
        }
        info!(
            "start watching sink resources {}/{}/{}",
            gvk.group, gvk.version, gvk.kind
        );
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ApiResource::from_gvk(gvk));
        let tracker = self.tracker.clone();
        let watched = gvk.clone();
        let handle = tokio::spawn(async move {
            let mut objects = pin!(
                watcher::watcher(api, watcher::Config::default())
                    .default_backoff()
                    .touched_objects()
            );
            while let Some(object) = objects.next().await {
                match object {
                    Ok(object) => tracker.on_changed(&TrackedReference {
                        gvk: watched.clone(),
                        key: ObjectKey::from(&object),
                    }),
                    Err(e) => warn!(
                        "watch of sink resources {}/{}/{} failed: {}",
                        watched.group, watched.version, watched.kind, e
                    ),
                }
            }
        });
        watches.insert(gvk.clone(), handle);
    }
}
