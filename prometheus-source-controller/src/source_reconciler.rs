use crate::{
    dispatcher::Action,
    errors::ControllerError,
    key::ObjectKey,
    resolver::SinkResolver,
    router::{Route, RouteTable},
    source_modifications::SourceModifications,
};

use kube::{
    Client,
    api::{ApiResource, DynamicObject, GroupVersionKind},
};
use kube_runtime::reflector::Store;
use log::{debug, info, warn};
use prometheus_source_apis::{Condition, PrometheusSource, READY, SINK_PROVIDED};
use std::{sync::Arc, time::Duration};

pub fn deployment_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apps", "v1", "Deployment")
}

pub fn event_type_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("eventing.knative.dev", "v1alpha1", "EventType")
}

/// The kinds watched by the controller: sources themselves plus the
/// deployments and event types they control.
pub fn route_table() -> RouteTable {
    let source = PrometheusSource::gvk();
    RouteTable::new()
        .with(source.clone(), Route::direct(source.clone()))
        .with(deployment_gvk(), Route::controlled_by(source.clone()))
        .with(event_type_gvk(), Route::controlled_by(source))
}

/// Reconciles [`PrometheusSource`] objects: resolves their sink and reports
/// the outcome in their status.
pub struct SourceReconciler {
    client: Client,
    cache: Store<DynamicObject>,
    api_resource: ApiResource,
    resolver: SinkResolver,
    resync_period: Option<Duration>,
}

impl SourceReconciler {
    pub fn new(
        client: Client,
        cache: Store<DynamicObject>,
        resolver: SinkResolver,
        resync_period: Option<Duration>,
    ) -> Self {
        Self {
            client,
            cache,
            api_resource: ApiResource::from_gvk(&PrometheusSource::gvk()),
            resolver,
            resync_period,
        }
    }

    fn cached(&self, key: &ObjectKey) -> Result<Option<PrometheusSource>, ControllerError> {
        match self.cache.get(&key.object_ref(&self.api_resource)) {
            Some(object) => Ok(Some(parse_source(object.as_ref())?)),
            None => Ok(None),
        }
    }

    fn on_success(&self) -> Action {
        match self.resync_period {
            Some(period) => Action::requeue(period),
            None => Action::await_change(),
        }
    }

    pub async fn reconcile(key: ObjectKey, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let source = match ctx.cached(&key)? {
            Some(source) => source,
            None => {
                debug!("PrometheusSource {} no longer exists", key);
                ctx.resolver.tracker().untrack_parent(&key);
                return Ok(Action::await_change());
            }
        };
        let mut event = SourceModifications::new(source);
        if event.is_deleted() {
            debug!("PrometheusSource {} is being deleted", key);
            ctx.resolver.tracker().untrack_parent(&key);
            return Ok(Action::await_change());
        }
        let sink = event.spec.sink.clone();
        let outcome = ctx.resolver.resolve(sink.as_ref(), &key).await;
        apply_sink_outcome(&mut event, &outcome);
        event.replace_status(ctx.client.clone()).await?;
        match outcome {
            Ok(uri) => {
                info!("PrometheusSource {} delivers to {}", key, uri);
                Ok(ctx.on_success())
            }
            Err(e) => {
                warn!("PrometheusSource {} sink not resolved: {}", key, e);
                Err(e)
            }
        }
    }
}

pub(crate) fn parse_source(object: &DynamicObject) -> Result<PrometheusSource, ControllerError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Record the sink resolution outcome in the status.
pub(crate) fn apply_sink_outcome(
    source: &mut PrometheusSource,
    outcome: &Result<String, ControllerError>,
) {
    let generation = source.metadata.generation;
    let (sink_provided, ready) = match outcome {
        Ok(uri) => {
            source.update_sink_uri(Some(uri.clone()));
            (
                Condition::new(SINK_PROVIDED, Some(true), "SinkResolved", String::new()),
                Condition::new(READY, Some(true), "SinkResolved", String::new()),
            )
        }
        Err(e) => {
            source.update_sink_uri(None);
            let reason = match e {
                ControllerError::InvalidSpec(_) => "SinkMissing",
                _ => "SinkNotFound",
            };
            (
                Condition::new(SINK_PROVIDED, Some(false), reason, format!("{}", e)),
                Condition::new(READY, Some(false), reason, format!("{}", e)),
            )
        }
    };
    for mut c in [sink_provided, ready] {
        c.observed_generation = generation;
        source.update_condition(c);
    }
}
