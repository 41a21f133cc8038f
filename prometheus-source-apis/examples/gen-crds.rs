use kube::CustomResourceExt;
use prometheus_source_apis::PrometheusSource;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&PrometheusSource::crd()).unwrap());
}
