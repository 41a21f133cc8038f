#[macro_use]
extern crate log;

use anyhow::anyhow;
use kube::Client;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus_source_apis::PrometheusSource;
use prometheus_source_controller::{
    configuration::Configuration,
    dispatcher::Dispatcher,
    enqueuer::Enqueuer,
    informer::Informer,
    prometheus_exporter::start_prometheus_metrics_server,
    resolver::SinkResolver,
    router::EnqueueRouter,
    source_reconciler::{SourceReconciler, route_table},
    workqueue::WorkQueue,
};
use std::sync::Arc;

/// Name of the work queue, also used in log lines and metric labels.
const RECONCILER_NAME: &'static str = "PrometheusSource";

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for SIGINT: {}", e);
            futures::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => (),
        _ = terminate => (),
    };
    info!("received shutdown signal, stopping controller ...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("a rustls crypto provider is already installed");
    }
    let configuration = Configuration::from_env()?;

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider.clone());
    let prometheus_metrics_exporter =
        start_prometheus_metrics_server(configuration.metrics_addr, registry);

    let client = Client::try_default().await?;
    let queue = WorkQueue::new(RECONCILER_NAME, configuration.rate_limiter());
    let enqueuer = Enqueuer::new(&queue);
    let router = EnqueueRouter::new(route_table(), enqueuer.clone());
    let informers: Vec<Informer> = router
        .table()
        .kinds()
        .map(|kind| Informer::new(client.clone(), kind, configuration.watch_namespace.as_deref()))
        .collect();
    let source_cache = informers
        .iter()
        .find(|i| i.gvk() == &PrometheusSource::gvk())
        .map(|i| i.store())
        .ok_or_else(|| anyhow!("{} is not watched", RECONCILER_NAME))?;
    let watches: Vec<_> = informers
        .into_iter()
        .map(|informer| tokio::spawn(informer.run(router.clone())))
        .collect();

    let reconciler = SourceReconciler::new(
        client.clone(),
        source_cache.clone(),
        SinkResolver::new(client, enqueuer),
        configuration.resync_period,
    );
    info!("waiting for the {} cache to sync ...", RECONCILER_NAME);
    source_cache.wait_until_ready().await?;

    info!("start controllers ...");
    let dispatcher = Dispatcher::new(queue.clone(), configuration.workers)
        .graceful_shutdown_on(shutdown_signal());
    let result = tokio::select! {
        _ = dispatcher.run(SourceReconciler::reconcile, Arc::new(reconciler)) => Ok(()),
        r = prometheus_metrics_exporter => r,
    };
    for watch in watches {
        watch.abort();
    }
    if let Err(e) = provider.shutdown() {
        warn!("failed to shut down meter provider: {}", e);
    }
    result
}
