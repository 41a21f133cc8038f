pub(crate) fn metric_name(name: &str) -> String {
    format!("prometheus_source_{}", name)
}
