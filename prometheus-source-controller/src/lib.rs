//! Dispatch core of the PrometheusSource controller: watch notifications are
//! filtered and routed to the key of the object to reconcile, collapsed in a
//! rate limited work queue and handed to a fixed pool of workers.

pub mod configuration;
pub mod dispatcher;
pub mod enqueuer;
pub mod errors;
pub mod filter;
pub mod informer;
pub mod key;
pub mod owner_index;
pub mod prometheus_exporter;
pub mod resolver;
pub mod router;
pub mod source_reconciler;
pub mod workqueue;

mod source_modifications;
mod utils;

/// The K8s field manager name.
pub const MANAGER: &'static str = "prometheus-source-controller";
