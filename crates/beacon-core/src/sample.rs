// Metric sample, batch envelope, and stored row types.
//
// `MetricSample` is what instrumented clients send, `MetricBatch` is the
// ingest request body, and `StoredRow` is the unit the bus carries and the
// columnar store persists. Aggregated rollup rows reuse `StoredRow` with the
// `aggregated` flag set and the summary fields populated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of measurement a sample carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
        }
    }
}

impl std::str::FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricType::Counter),
            "gauge" => Ok(MetricType::Gauge),
            "histogram" => Ok(MetricType::Histogram),
            "summary" => Ok(MetricType::Summary),
            other => Err(format!("unknown metric type: {other}")),
        }
    }
}

/// One measurement emitted by an instrumented process.
///
/// `timestamp` is milliseconds since the Unix epoch, wall clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: i64,
    pub service_name: String,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl MetricSample {
    /// A request sample is an error when its status code is server-side.
    pub fn is_error(&self) -> bool {
        matches!(self.status_code, Some(code) if code >= 500)
    }
}

/// Ingest request body: a batch of samples plus source metadata.
///
/// `received_at` is assigned by the gateway, never trusted from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBatch {
    pub metrics: Vec<MetricSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<i64>,
}

/// Persisted form of a sample.
///
/// Raw rows have `aggregated = false` and `resolution_minutes = 0`; rollup
/// rows carry the pre-computed summary in the `agg_*` fields and use `value`
/// for the window average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: u64,
    pub timestamp: i64,
    pub service_name: String,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default)]
    pub aggregated: bool,
    #[serde(default)]
    pub resolution_minutes: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_error_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_p50: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_p95: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_p99: Option<f64>,
}

impl StoredRow {
    /// Build a raw row from a validated sample.
    pub fn from_sample(id: u64, sample: MetricSample, environment: Option<&str>) -> Self {
        let environment = sample
            .environment
            .clone()
            .or_else(|| environment.map(str::to_owned));
        Self {
            id,
            timestamp: sample.timestamp,
            service_name: sample.service_name,
            metric_name: sample.metric_name,
            metric_type: sample.metric_type,
            value: sample.value,
            endpoint: sample.endpoint,
            method: sample.method,
            status_code: sample.status_code,
            duration_ms: sample.duration_ms,
            tags: sample.tags,
            trace_id: sample.trace_id,
            span_id: sample.span_id,
            environment,
            aggregated: false,
            resolution_minutes: 0,
            agg_count: None,
            agg_sum: None,
            agg_min: None,
            agg_max: None,
            agg_error_count: None,
            agg_p50: None,
            agg_p95: None,
            agg_p99: None,
        }
    }

    /// Number of underlying observations this row represents.
    pub fn observation_count(&self) -> u64 {
        if self.aggregated {
            self.agg_count.unwrap_or(1)
        } else {
            1
        }
    }
}

/// Wire payload published to the bus: one record set per partition key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSet {
    pub rows: Vec<StoredRow>,
}

impl RecordSet {
    pub fn new(rows: Vec<StoredRow>) -> Self {
        Self { rows }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricSample {
        MetricSample {
            timestamp: 1_700_000_000_000,
            service_name: "api".into(),
            metric_name: "http.duration".into(),
            metric_type: MetricType::Gauge,
            value: 42.0,
            endpoint: Some("/users".into()),
            method: Some("GET".into()),
            status_code: Some(200),
            duration_ms: Some(42.0),
            tags: None,
            trace_id: None,
            span_id: None,
            environment: None,
        }
    }

    #[test]
    fn test_metric_type_round_trip() {
        for t in [
            MetricType::Counter,
            MetricType::Gauge,
            MetricType::Histogram,
            MetricType::Summary,
        ] {
            assert_eq!(t.as_str().parse::<MetricType>().unwrap(), t);
        }
        assert!("timer".parse::<MetricType>().is_err());
    }

    #[test]
    fn test_record_set_round_trip() {
        let row = StoredRow::from_sample(7, sample(), Some("prod"));
        let set = RecordSet::new(vec![row.clone()]);
        let decoded = RecordSet::from_bytes(&set.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.rows, vec![row]);
    }

    #[test]
    fn test_row_environment_falls_back_to_envelope() {
        let row = StoredRow::from_sample(1, sample(), Some("staging"));
        assert_eq!(row.environment.as_deref(), Some("staging"));

        let mut tagged = sample();
        tagged.environment = Some("prod".into());
        let row = StoredRow::from_sample(1, tagged, Some("staging"));
        assert_eq!(row.environment.as_deref(), Some("prod"));
    }

    #[test]
    fn test_is_error_threshold() {
        let mut s = sample();
        assert!(!s.is_error());
        s.status_code = Some(499);
        assert!(!s.is_error());
        s.status_code = Some(500);
        assert!(s.is_error());
    }

    #[test]
    fn test_batch_deserializes_without_envelope_metadata() {
        let body = r#"{"metrics":[{"timestamp":1,"service_name":"a","metric_name":"m","metric_type":"counter","value":1.0}]}"#;
        let batch: MetricBatch = serde_json::from_str(body).unwrap();
        assert_eq!(batch.metrics.len(), 1);
        assert!(batch.service_name.is_none());
    }
}
