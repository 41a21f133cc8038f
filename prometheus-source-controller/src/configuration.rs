use crate::{
    errors::ControllerError,
    workqueue::{BucketRateLimiter, DefaultRateLimiter, ItemExponentialRateLimiter},
};

use log::info;
use std::{fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

/// Controller tunables, read once at startup from environment variables.
#[derive(Clone, Debug, PartialEq)]
pub struct Configuration {
    /// Restrict all watches to this namespace, `None` watches all namespaces.
    pub watch_namespace: Option<String>,
    /// Number of concurrent dispatch workers.
    pub workers: usize,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
    pub queue_qps: f64,
    pub queue_burst: u32,
    /// Periodic requeue after a successful reconcile, `None` to disable.
    pub resync_period: Option<Duration>,
    pub metrics_addr: SocketAddr,
}

pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(v) => v
            .parse()
            .map_err(|e| ControllerError::Configuration(format!("invalid value {:?} for {}: {}", v, name, e))),
        None => Ok(default),
    }
}

impl Configuration {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(env_var)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|v| v != "*");
        match &watch_namespace {
            Some(ns) => info!("Controller is only watching resources in namespace {}", ns),
            None => info!("Controller is watching resources in all namespaces"),
        }
        let workers: usize = parse(&lookup, "WORKERS", 1)?;
        if workers == 0 {
            return Err(ControllerError::Configuration(
                "WORKERS must be at least 1".to_string(),
            ));
        }
        let queue_base_delay = Duration::from_millis(parse(&lookup, "QUEUE_BASE_DELAY_MS", 5)?);
        if queue_base_delay.is_zero() {
            return Err(ControllerError::Configuration(
                "QUEUE_BASE_DELAY_MS must be at least 1".to_string(),
            ));
        }
        let queue_max_delay = Duration::from_secs(parse(&lookup, "QUEUE_MAX_DELAY_SECS", 1000)?);
        if queue_max_delay < queue_base_delay {
            return Err(ControllerError::Configuration(format!(
                "QUEUE_MAX_DELAY_SECS ({:?}) must not be smaller than QUEUE_BASE_DELAY_MS ({:?})",
                queue_max_delay, queue_base_delay
            )));
        }
        let queue_qps: f64 = parse(&lookup, "QUEUE_QPS", 10.0)?;
        if !queue_qps.is_finite() || queue_qps <= 0.0 {
            return Err(ControllerError::Configuration(format!(
                "QUEUE_QPS must be a positive number, got {}",
                queue_qps
            )));
        }
        let queue_burst: u32 = parse(&lookup, "QUEUE_BURST", 100)?;
        if queue_burst == 0 {
            return Err(ControllerError::Configuration(
                "QUEUE_BURST must be at least 1".to_string(),
            ));
        }
        let resync_period: u64 = parse(&lookup, "RESYNC_PERIOD_SECS", 3600)?;
        let metrics_addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse()
            .map_err(|e| ControllerError::Configuration(format!("invalid metrics listen address: {}", e)))?;
        Ok(Self {
            watch_namespace,
            workers,
            queue_base_delay,
            queue_max_delay,
            queue_qps,
            queue_burst,
            resync_period: Some(Duration::from_secs(resync_period)).filter(|d| !d.is_zero()),
            metrics_addr,
        })
    }

    pub fn rate_limiter(&self) -> DefaultRateLimiter {
        DefaultRateLimiter::new(
            ItemExponentialRateLimiter::new(self.queue_base_delay, self.queue_max_delay),
            BucketRateLimiter::new(self.queue_qps, self.queue_burst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let c = Configuration::from_lookup(lookup(&[])).unwrap();
        assert_eq!(None, c.watch_namespace);
        assert_eq!(1, c.workers);
        assert_eq!(Duration::from_millis(5), c.queue_base_delay);
        assert_eq!(Duration::from_secs(1000), c.queue_max_delay);
        assert_eq!(10.0, c.queue_qps);
        assert_eq!(100, c.queue_burst);
        assert_eq!(Some(Duration::from_secs(3600)), c.resync_period);
        assert_eq!("0.0.0.0:9000".parse::<SocketAddr>().unwrap(), c.metrics_addr);
    }

    #[test]
    fn overrides() {
        let c = Configuration::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", "sources"),
            ("WORKERS", "4"),
            ("QUEUE_BASE_DELAY_MS", "100"),
            ("QUEUE_MAX_DELAY_SECS", "60"),
            ("RESYNC_PERIOD_SECS", "0"),
            ("METRICS_LISTEN_PORT", "9090"),
        ]))
        .unwrap();
        assert_eq!(Some("sources".to_string()), c.watch_namespace);
        assert_eq!(4, c.workers);
        assert_eq!(Duration::from_millis(100), c.queue_base_delay);
        assert_eq!(Duration::from_secs(60), c.queue_max_delay);
        assert_eq!(None, c.resync_period);
        assert_eq!(9090, c.metrics_addr.port());

        let all = Configuration::from_lookup(lookup(&[("WATCH_NAMESPACE", "*")])).unwrap();
        assert_eq!(None, all.watch_namespace);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for vars in [
            &[("WORKERS", "many")][..],
            &[("WORKERS", "0")][..],
            &[("QUEUE_BASE_DELAY_MS", "0")][..],
            &[("QUEUE_QPS", "NaN")][..],
            &[("QUEUE_QPS", "inf")][..],
            &[("QUEUE_QPS", "-1")][..],
            &[("QUEUE_QPS", "0")][..],
            &[("QUEUE_BURST", "0")][..],
            &[("QUEUE_BASE_DELAY_MS", "5000"), ("QUEUE_MAX_DELAY_SECS", "1")][..],
            &[("METRICS_LISTEN_ADDR", "not an address")][..],
        ] {
            let e = Configuration::from_lookup(lookup(vars)).unwrap_err();
            assert!(!e.is_temporary(), "{}", e);
        }
    }
}
