// Batch validation.
//
// Validation collects every violation instead of failing on the first so the
// 400 response can list them all with sample indices. A batch is accepted or
// rejected as a whole; partial admission would break the all-or-nothing
// publish contract.

use serde::Serialize;

use crate::sample::{MetricBatch, MetricSample};
use crate::{MAX_IDENT_LEN, MAX_TAGS, MAX_TAG_LEN};

/// One violation inside an ingest batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleError {
    pub index: usize,
    pub field: &'static str,
    pub code: &'static str,
}

impl SampleError {
    fn new(index: usize, field: &'static str, code: &'static str) -> Self {
        Self { index, field, code }
    }
}

/// Validate a batch envelope against the schema and range rules.
///
/// Returns an empty vector when the batch is admissible. Batch-size overflow
/// is not reported here; the gateway maps it to 413 before validation runs.
pub fn validate_batch(batch: &MetricBatch) -> Vec<SampleError> {
    let mut errors = Vec::new();

    if batch.metrics.is_empty() {
        errors.push(SampleError::new(0, "metrics", "empty"));
        return errors;
    }

    for (index, sample) in batch.metrics.iter().enumerate() {
        validate_sample(index, sample, &mut errors);
    }

    errors
}

fn validate_sample(index: usize, sample: &MetricSample, errors: &mut Vec<SampleError>) {
    validate_ident(index, "service_name", &sample.service_name, errors);
    validate_ident(index, "metric_name", &sample.metric_name, errors);

    if !sample.value.is_finite() {
        errors.push(SampleError::new(index, "value", "non_finite"));
    }

    if sample.timestamp <= 0 {
        errors.push(SampleError::new(index, "timestamp", "out_of_range"));
    }

    if let Some(code) = sample.status_code {
        if !(100..=599).contains(&code) {
            errors.push(SampleError::new(index, "status_code", "out_of_range"));
        }
    }

    if let Some(duration) = sample.duration_ms {
        if !duration.is_finite() || duration < 0.0 {
            errors.push(SampleError::new(index, "duration_ms", "out_of_range"));
        }
    }

    if let Some(tags) = &sample.tags {
        if tags.len() > MAX_TAGS {
            errors.push(SampleError::new(index, "tags", "too_many_tags"));
        }
        for (key, value) in tags {
            if key.is_empty() {
                errors.push(SampleError::new(index, "tags", "empty"));
            }
            if key.len() > MAX_TAG_LEN || value.len() > MAX_TAG_LEN {
                errors.push(SampleError::new(index, "tags", "too_long"));
            }
        }
    }
}

fn validate_ident(
    index: usize,
    field: &'static str,
    value: &str,
    errors: &mut Vec<SampleError>,
) {
    if value.is_empty() {
        errors.push(SampleError::new(index, field, "empty"));
        return;
    }
    if value.len() > MAX_IDENT_LEN {
        errors.push(SampleError::new(index, field, "too_long"));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        errors.push(SampleError::new(index, field, "bad_chars"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::MetricType;

    fn sample() -> MetricSample {
        MetricSample {
            timestamp: 1_700_000_000_000,
            service_name: "api".into(),
            metric_name: "http.duration".into(),
            metric_type: MetricType::Gauge,
            value: 1.0,
            endpoint: None,
            method: None,
            status_code: None,
            duration_ms: None,
            tags: None,
            trace_id: None,
            span_id: None,
            environment: None,
        }
    }

    fn batch(samples: Vec<MetricSample>) -> MetricBatch {
        MetricBatch {
            metrics: samples,
            service_name: None,
            environment: None,
            agent_version: None,
            received_at: None,
        }
    }

    #[test]
    fn test_valid_batch_passes() {
        assert!(validate_batch(&batch(vec![sample()])).is_empty());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let errors = validate_batch(&batch(vec![]));
        assert_eq!(errors, vec![SampleError::new(0, "metrics", "empty")]);
    }

    #[test]
    fn test_nan_value_reported_with_index() {
        let mut bad = sample();
        bad.value = f64::NAN;
        let errors = validate_batch(&batch(vec![sample(), bad]));
        assert_eq!(errors, vec![SampleError::new(1, "value", "non_finite")]);
    }

    #[test]
    fn test_infinite_value_rejected() {
        let mut bad = sample();
        bad.value = f64::INFINITY;
        let errors = validate_batch(&batch(vec![bad]));
        assert_eq!(errors[0].code, "non_finite");
    }

    #[test]
    fn test_identifier_rules() {
        let mut bad = sample();
        bad.service_name = String::new();
        bad.metric_name = "bad name!".into();
        let errors = validate_batch(&batch(vec![bad]));
        assert!(errors.contains(&SampleError::new(0, "service_name", "empty")));
        assert!(errors.contains(&SampleError::new(0, "metric_name", "bad_chars")));

        let mut long = sample();
        long.metric_name = "m".repeat(MAX_IDENT_LEN + 1);
        let errors = validate_batch(&batch(vec![long]));
        assert!(errors.contains(&SampleError::new(0, "metric_name", "too_long")));
    }

    #[test]
    fn test_status_code_range() {
        let mut bad = sample();
        bad.status_code = Some(99);
        let errors = validate_batch(&batch(vec![bad]));
        assert_eq!(errors, vec![SampleError::new(0, "status_code", "out_of_range")]);

        let mut bad = sample();
        bad.status_code = Some(600);
        assert!(!validate_batch(&batch(vec![bad])).is_empty());
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut bad = sample();
        bad.duration_ms = Some(-1.0);
        let errors = validate_batch(&batch(vec![bad]));
        assert_eq!(errors, vec![SampleError::new(0, "duration_ms", "out_of_range")]);
    }

    #[test]
    fn test_tag_limits() {
        let mut bad = sample();
        let tags = (0..MAX_TAGS + 1)
            .map(|i| (format!("k{i}"), "v".to_string()))
            .collect();
        bad.tags = Some(tags);
        let errors = validate_batch(&batch(vec![bad]));
        assert!(errors.contains(&SampleError::new(0, "tags", "too_many_tags")));

        let mut bad = sample();
        bad.tags = Some(
            [("k".to_string(), "v".repeat(MAX_TAG_LEN + 1))]
                .into_iter()
                .collect(),
        );
        let errors = validate_batch(&batch(vec![bad]));
        assert!(errors.contains(&SampleError::new(0, "tags", "too_long")));
    }
}
