use crate::{MANAGER, errors::ControllerError};
use json_patch::diff;
use kube::{Api, Client, ResourceExt, api::PostParams};
use log::debug;
use prometheus_source_apis::PrometheusSource;
use std::ops::DerefMut;

/// Helper construct to simplify updating the status of [`PrometheusSource`] objects.
pub(crate) struct SourceModifications {
    original: PrometheusSource,
    pub modified: PrometheusSource,
}

impl std::ops::Deref for SourceModifications {
    type Target = PrometheusSource;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for SourceModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl SourceModifications {
    pub(crate) fn new(original: PrometheusSource) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    fn api(&self, client: Client) -> Api<PrometheusSource> {
        match self.original.namespace() {
            Some(ns) => Api::namespaced(client, ns.as_str()),
            None => Api::all(client),
        }
    }

    pub(crate) fn status_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &serde_json::to_value(&self.original.status)?,
            &serde_json::to_value(&self.modified.status)?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    pub(crate) fn status_has_changed(&self) -> Result<bool, ControllerError> {
        Ok(self.status_patch()?.is_some())
    }

    /// Write the modified status back, a no-op if it did not change.
    pub(crate) async fn replace_status(&mut self, client: Client) -> Result<(), ControllerError> {
        if !self.status_has_changed()? {
            return Ok(());
        }
        let api = self.api(client);
        let name = self.modified.name_any();
        let latest = api.get_status(name.as_str()).await?;
        self.modified.metadata.resource_version = latest.metadata.resource_version.clone();
        let pp = PostParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        };
        debug!(
            "Replace status of {} ({:?})",
            self.modified.id(),
            self.modified.resource_version()
        );
        self.modified = api
            .replace_status(name.as_str(), &pp, serde_json::to_vec(&self.modified)?)
            .await?;
        self.original = self.modified.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_source_apis::{Condition, PrometheusSourceSpec, SINK_PROVIDED};

    fn source() -> PrometheusSource {
        let mut source = PrometheusSource::new(
            "source",
            PrometheusSourceSpec {
                server_url: "http://prometheus:9090".to_string(),
                prom_ql: "up".to_string(),
                auth_token_file: None,
                ca_cert_config_map: None,
                schedule: "* * * * *".to_string(),
                step: None,
                service_account_name: None,
                sink: None,
            },
        );
        source.metadata.namespace = Some("ns".to_string());
        source
    }

    #[test]
    fn status_changes_are_detected() {
        let mut event = SourceModifications::new(source());
        assert!(!event.status_has_changed().unwrap());
        assert!(!event.is_deleted());

        event.update_sink_uri(Some("http://sink".to_string()));
        event.update_condition(Condition::new(SINK_PROVIDED, Some(true), "SinkResolved", String::new()));
        assert!(event.status_has_changed().unwrap());
        assert!(event.status_patch().unwrap().is_some());
    }

    #[test]
    fn spec_changes_are_not_status_changes() {
        let mut event = SourceModifications::new(source());
        event.spec.prom_ql = "rate(up[5m])".to_string();
        assert!(!event.status_has_changed().unwrap());
    }
}
