use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use crystal_protocol::MetricSample;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Receiver of metric samples for one tenant.
///
/// Implementations must return quickly; evaluation belongs on the
/// observer's own task.
pub trait SampleObserver: Send + Sync {
    fn policy_id(&self) -> u64;

    fn on_sample(&self, sample: &MetricSample) -> Result<(), String>;
}

/// Routes parsed metric samples to every observer subscribed under the
/// sample's tenant id.
#[derive(Clone, Default)]
pub struct MetricFanout {
    observers: Arc<RwLock<HashMap<String, Vec<Arc<dyn SampleObserver>>>>>,
}

const TENANT_METRIC_SUFFIX: &str = "_tenant";

#[derive(Debug, Deserialize)]
struct JsonSample {
    tenant_id: String,
    metric_name: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    value: f64,
}

impl MetricFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a collectd `PUTVAL` line or a JSON sample object.
    pub fn parse(line: &str) -> Result<MetricSample, EngineError> {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            let sample: JsonSample = serde_json::from_str(trimmed)
                .map_err(|err| EngineError::MalformedSample(err.to_string()))?;
            return Ok(MetricSample {
                tenant_id: sample.tenant_id,
                metric_name: sample.metric_name,
                timestamp: sample.timestamp.unwrap_or_else(Utc::now),
                value: sample.value,
            });
        }
        parse_putval(trimmed)
    }

    pub fn attach(&self, tenant_id: &str, observer: Arc<dyn SampleObserver>) {
        debug!(tenant = %tenant_id, policy_id = observer.policy_id(), "observer attached");
        self.observers
            .write()
            .entry(tenant_id.to_string())
            .or_default()
            .push(observer);
    }

    /// Returns whether an observer was removed.
    pub fn detach(&self, tenant_id: &str, policy_id: u64) -> bool {
        let mut observers = self.observers.write();
        let Some(list) = observers.get_mut(tenant_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|observer| observer.policy_id() != policy_id);
        let removed = list.len() != before;
        if list.is_empty() {
            observers.remove(tenant_id);
        }
        removed
    }

    pub fn subscribers(&self, tenant_id: &str) -> usize {
        self.observers.read().get(tenant_id).map_or(0, Vec::len)
    }

    /// Delivers the sample to every observer of its tenant and returns how
    /// many accepted it. Failing or panicking observers are logged and skipped.
    pub fn notify(&self, sample: &MetricSample) -> usize {
        let snapshot: Vec<Arc<dyn SampleObserver>> = match self.observers.read().get(&sample.tenant_id) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for observer in snapshot {
            match catch_unwind(AssertUnwindSafe(|| observer.on_sample(sample))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => warn!(
                    policy_id = observer.policy_id(),
                    tenant = %sample.tenant_id,
                    error = %err,
                    "observer rejected sample"
                ),
                Err(_) => warn!(
                    policy_id = observer.policy_id(),
                    tenant = %sample.tenant_id,
                    "observer panicked while handling sample"
                ),
            }
        }
        delivered
    }

    /// Parses and notifies in one step.
    pub fn ingest(&self, line: &str) -> Result<usize, EngineError> {
        let sample = Self::parse(line)?;
        Ok(self.notify(&sample))
    }
}

// PUT VAL <host>/groupingtail-swift_metrics*<tenant>*<metric>/<type> interval=<s> <timestamp>:<value>
fn parse_putval(line: &str) -> Result<MetricSample, EngineError> {
    let malformed = |reason: &str| EngineError::MalformedSample(format!("{}: `{}`", reason, line));

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let rest = match tokens.as_slice() {
        ["PUTVAL", rest @ ..] => rest,
        ["PUT", "VAL", rest @ ..] => rest,
        _ => return Err(malformed("expected PUTVAL")),
    };
    let (identifier, data) = match rest {
        [identifier, .., data] => (*identifier, *data),
        _ => return Err(malformed("missing identifier or value")),
    };

    let mut parts = identifier.split('*');
    let (tenant_id, metric) = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(tenant), Some(metric)) if !tenant.is_empty() => (tenant, metric),
        _ => return Err(malformed("identifier has no tenant")),
    };
    let metric = metric.split('/').next().unwrap_or(metric);
    let metric_name = metric.strip_suffix(TENANT_METRIC_SUFFIX).unwrap_or(metric);
    if metric_name.is_empty() {
        return Err(malformed("identifier has no metric"));
    }

    let (raw_time, raw_value) = data
        .split_once(':')
        .ok_or_else(|| malformed("value must be <timestamp>:<value>"))?;
    let value: f64 = raw_value.parse().map_err(|_| malformed("value is not a number"))?;
    let timestamp = parse_timestamp(raw_time).ok_or_else(|| malformed("invalid timestamp"))?;

    Ok(MetricSample {
        tenant_id: tenant_id.to_string(),
        metric_name: metric_name.to_string(),
        timestamp,
        value,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw == "N" {
        return Some(Utc::now());
    }
    let seconds: f64 = raw.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds.fract()) * 1e9).round() as u32;
    Utc.timestamp_opt(whole, nanos.min(999_999_999)).single()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Recorder {
        id: u64,
        seen: AtomicUsize,
    }

    impl Recorder {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                seen: AtomicUsize::new(0),
            })
        }
    }

    impl SampleObserver for Recorder {
        fn policy_id(&self) -> u64 {
            self.id
        }

        fn on_sample(&self, _sample: &MetricSample) -> Result<(), String> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing {
        id: u64,
        panic: bool,
    }

    impl SampleObserver for Failing {
        fn policy_id(&self) -> u64 {
            self.id
        }

        fn on_sample(&self, _sample: &MetricSample) -> Result<(), String> {
            if self.panic {
                panic!("corrupted monitor state");
            }
            Err("evaluation failed".into())
        }
    }

    #[test]
    fn parses_collectd_putval() {
        let sample = MetricFanout::parse(
            "PUT VAL swift_mdw/groupingtail-swift_metrics*4f0279da74ef4584a29dc72c835fe2c9*put_bw_tenant/counter interval=5.000 1448964179.433:198",
        )
        .unwrap();

        assert_eq!(sample.tenant_id, "4f0279da74ef4584a29dc72c835fe2c9");
        assert_eq!(sample.metric_name, "put_bw");
        assert_eq!(sample.value, 198.0);
        assert_eq!(sample.timestamp.timestamp(), 1448964179);
    }

    #[test]
    fn parses_json_sample() {
        let sample = MetricFanout::parse(r#"{"tenant_id":"t1","metric_name":"put_bw","value":150}"#).unwrap();
        assert_eq!(sample.tenant_id, "t1");
        assert_eq!(sample.value, 150.0);
    }

    #[test]
    fn rejects_garbage() {
        for line in [
            "hello world",
            "PUTVAL host/metrics*t1*put_bw/counter 1448964179:abc",
            "PUTVAL host/no-tenant/counter 1448964179:1",
            "{\"tenant_id\":\"t1\"}",
        ] {
            assert!(
                matches!(MetricFanout::parse(line), Err(EngineError::MalformedSample(_))),
                "accepted `{}`",
                line
            );
        }
    }

    #[test]
    fn failing_observers_do_not_block_others() {
        let fanout = MetricFanout::new();
        let first = Recorder::new(1);
        let third = Recorder::new(3);
        fanout.attach("t1", first.clone());
        fanout.attach("t1", Arc::new(Failing { id: 2, panic: true }));
        fanout.attach("t1", third.clone());
        fanout.attach("t1", Arc::new(Failing { id: 4, panic: false }));

        let delivered = fanout.notify(&MetricSample::new("t1", "put_bw", 150.0));

        assert_eq!(delivered, 2);
        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(third.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn samples_only_reach_their_tenant() {
        let fanout = MetricFanout::new();
        let observer = Recorder::new(1);
        fanout.attach("t1", observer.clone());

        assert_eq!(fanout.notify(&MetricSample::new("t2", "put_bw", 1.0)), 0);
        assert_eq!(observer.seen.load(Ordering::SeqCst), 0);

        assert!(fanout.detach("t1", 1));
        assert!(!fanout.detach("t1", 1));
        assert_eq!(fanout.subscribers("t1"), 0);
    }
}
