use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single observation taken from the metric stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub tenant_id: String,
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl MetricSample {
    pub fn new(tenant_id: impl Into<String>, metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            metric_name: metric_name.into(),
            timestamp: Utc::now(),
            value,
        }
    }
}
