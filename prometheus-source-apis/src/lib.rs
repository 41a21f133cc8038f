use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::{CustomResource, api::GroupVersionKind};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "sources.knative.dev";

pub const API_VERSION: &'static str = "v1alpha1";

pub const KIND: &'static str = "PrometheusSource";

/// Condition type reporting whether the sink could be resolved to an URI.
pub const SINK_PROVIDED: &'static str = "SinkProvided";

/// Condition type summarizing the overall readiness of a [`PrometheusSource`].
pub const READY: &'static str = "Ready";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another. This should be when the underlying condition changed.  If that is not known, then using the time when the API field changed is acceptable.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon. For instance, if .metadata.generation is currently 12, but the .status.conditions\[x\].observedGeneration is 9, the condition is out of date with respect to the current state of the instance.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition. Producers of specific condition types may define expected values and meanings for this field, and whether the values are considered a guaranteed API. The value should be a CamelCase string. This field may not be empty.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// A Prometheus event source, periodically running a PromQL query against a
/// Prometheus server and sending the results as CloudEvents to a sink.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sources.knative.dev",
    version = "v1alpha1",
    kind = "PrometheusSource",
    derive = "PartialEq",
    status = "PrometheusSourceStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the PrometheusSource is ready to deliver events."
    }"#,
    printcolumn = r#"{
        "name":"Sink",
        "type": "string",
        "jsonPath": ".status.sinkUri",
        "description": "The resolved URI events are delivered to."
    }"#
)]
pub struct PrometheusSourceSpec {
    /// The URL of the Prometheus server.
    #[serde(rename = "serverURL")]
    pub server_url: String,
    /// The PromQL query to run.
    #[serde(rename = "promQL")]
    pub prom_ql: String,
    /// Path to the file containing the bearer token used to authenticate against
    /// the Prometheus server.
    #[serde(rename = "authTokenFile", skip_serializing_if = "Option::is_none")]
    pub auth_token_file: Option<String>,
    /// Name of the ConfigMap holding the CA certificate of the Prometheus server.
    #[serde(rename = "caCertConfigMap", skip_serializing_if = "Option::is_none")]
    pub ca_cert_config_map: Option<String>,
    /// Crontab-style schedule at which the query is run.
    pub schedule: String,
    /// Query resolution step width for range queries, e.g. `15s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Service account used by the receive adapter.
    #[serde(rename = "serviceAccountName", skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Where to send the events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink: Option<Destination>,
}

/// Reference to an addressable Kubernetes object.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct KReference {
    /// The Kubernetes API version including the API Group, e.g. `serving.knative.dev/v1`.
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// The Kubernetes API Kind name.
    pub kind: String,
    /// The Kubernetes object's name (`metadata.name`)
    pub name: String,
    /// The Kubernetes object's namespace (`metadata.namespace`) defaults to the namespace
    /// of the referencing object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl KReference {
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        };
        GroupVersionKind::gvk(group, version, self.kind.as_str())
    }
}

/// Event delivery target, either an addressable object reference, an absolute
/// URI or an object reference plus a URI relative to the object's address.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct Destination {
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_: Option<KReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct PrometheusSourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// The URI the sink was resolved to.
    #[serde(rename = "sinkUri", skip_serializing_if = "Option::is_none")]
    pub sink_uri: Option<String>,
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl PrometheusSource {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(API_GROUP, API_VERSION, KIND)
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|v| v.conditions.as_ref())
            .and_then(|v| v.iter().find(|c| c.type_ == tpe))
    }

    pub fn update_condition(&mut self, c: Condition) {
        let mut status = self.status.take().unwrap_or_default();
        status.update_condition(c);
        self.status = Some(status);
    }

    pub fn update_sink_uri(&mut self, sink_uri: Option<String>) {
        let mut status = self.status.take().unwrap_or_default();
        status.sink_uri = sink_uri;
        status.observed_generation = self.metadata.generation;
        self.status = Some(status);
    }
}

impl PrometheusSourceStatus {
    pub fn update_condition(&mut self, mut c: Condition) {
        let time = Utc::now();
        c.last_transition_time = Some(time.to_rfc3339_opts(SecondsFormat::Secs, true));
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_else(|| vec![]);
        if let Some(existing) = conditions.iter().find(|v| v.type_ == c.type_) {
            if existing.status != c.status
                || existing.reason != c.reason
                || existing.message != c.message
                || existing.observed_generation != c.observed_generation
            {
                conditions.retain(|v| v.type_ != c.type_);
                conditions.push(c);
            }
        } else {
            conditions.push(c);
        };
        self.conditions = Some(conditions);
    }
}
