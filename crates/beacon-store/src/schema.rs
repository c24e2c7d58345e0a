// Arrow schema for the metrics table and row <-> batch conversion.
//
// Column order is fixed; readers address columns by index. Rows are sorted
// by (service_name, metric_name, timestamp) before encoding so Parquet row
// groups stay clustered for the query path's predicate pruning.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray,
    TimestampMillisecondArray, UInt16Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use beacon_core::{MetricType, StoredRow};
use once_cell::sync::Lazy;

use crate::error::{Result, StoreError};

static METRICS_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::UInt64, false),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
        Field::new("service_name", DataType::Utf8, false),
        Field::new("metric_name", DataType::Utf8, false),
        Field::new("metric_type", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("endpoint", DataType::Utf8, true),
        Field::new("method", DataType::Utf8, true),
        Field::new("status_code", DataType::UInt16, true),
        Field::new("duration_ms", DataType::Float64, true),
        Field::new("tags", DataType::Utf8, true),
        Field::new("trace_id", DataType::Utf8, true),
        Field::new("span_id", DataType::Utf8, true),
        Field::new("environment", DataType::Utf8, true),
        Field::new("aggregated", DataType::Boolean, false),
        Field::new("resolution_minutes", DataType::UInt16, false),
        Field::new("agg_count", DataType::UInt64, true),
        Field::new("agg_sum", DataType::Float64, true),
        Field::new("agg_min", DataType::Float64, true),
        Field::new("agg_max", DataType::Float64, true),
        Field::new("agg_error_count", DataType::UInt64, true),
        Field::new("agg_p50", DataType::Float64, true),
        Field::new("agg_p95", DataType::Float64, true),
        Field::new("agg_p99", DataType::Float64, true),
    ]))
});

pub fn metrics_schema() -> SchemaRef {
    Arc::clone(&METRICS_SCHEMA)
}

/// Sort order applied before encoding: primary key of the table.
pub fn sort_rows(rows: &mut [StoredRow]) {
    rows.sort_by(|a, b| {
        (&a.service_name, &a.metric_name, a.timestamp, a.id).cmp(&(
            &b.service_name,
            &b.metric_name,
            b.timestamp,
            b.id,
        ))
    });
}

pub fn rows_to_batch(rows: &[StoredRow]) -> Result<RecordBatch> {
    let tags_json: Vec<Option<String>> = rows
        .iter()
        .map(|r| {
            r.tags
                .as_ref()
                .map(|t| serde_json::to_string(t).unwrap_or_default())
        })
        .collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(
            rows.iter().map(|r| r.id).collect::<Vec<_>>(),
        )),
        Arc::new(TimestampMillisecondArray::from(
            rows.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.service_name.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.metric_name.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.metric_type.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.value).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.endpoint.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.method.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt16Array::from(
            rows.iter().map(|r| r.status_code).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.duration_ms).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(tags_json)),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.trace_id.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.span_id.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.environment.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            rows.iter().map(|r| r.aggregated).collect::<Vec<_>>(),
        )),
        Arc::new(UInt16Array::from(
            rows.iter().map(|r| r.resolution_minutes).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            rows.iter().map(|r| r.agg_count).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.agg_sum).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.agg_min).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.agg_max).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            rows.iter().map(|r| r.agg_error_count).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.agg_p50).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.agg_p95).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.agg_p99).collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(metrics_schema(), columns).map_err(StoreError::from)
}

fn col<'a, T: 'static>(batch: &'a RecordBatch, index: usize, name: &str) -> Result<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| StoreError::fatal(format!("column {name} has unexpected type")))
}

fn opt_str(array: &StringArray, row: usize) -> Option<String> {
    if array.is_valid(row) {
        Some(array.value(row).to_string())
    } else {
        None
    }
}

fn opt_f64(array: &Float64Array, row: usize) -> Option<f64> {
    if array.is_valid(row) {
        Some(array.value(row))
    } else {
        None
    }
}

fn opt_u64(array: &UInt64Array, row: usize) -> Option<u64> {
    if array.is_valid(row) {
        Some(array.value(row))
    } else {
        None
    }
}

pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<StoredRow>> {
    let ids = col::<UInt64Array>(batch, 0, "id")?;
    let timestamps = col::<TimestampMillisecondArray>(batch, 1, "timestamp")?;
    let services = col::<StringArray>(batch, 2, "service_name")?;
    let metrics = col::<StringArray>(batch, 3, "metric_name")?;
    let types = col::<StringArray>(batch, 4, "metric_type")?;
    let values = col::<Float64Array>(batch, 5, "value")?;
    let endpoints = col::<StringArray>(batch, 6, "endpoint")?;
    let methods = col::<StringArray>(batch, 7, "method")?;
    let statuses = col::<UInt16Array>(batch, 8, "status_code")?;
    let durations = col::<Float64Array>(batch, 9, "duration_ms")?;
    let tags = col::<StringArray>(batch, 10, "tags")?;
    let trace_ids = col::<StringArray>(batch, 11, "trace_id")?;
    let span_ids = col::<StringArray>(batch, 12, "span_id")?;
    let environments = col::<StringArray>(batch, 13, "environment")?;
    let aggregated = col::<BooleanArray>(batch, 14, "aggregated")?;
    let resolutions = col::<UInt16Array>(batch, 15, "resolution_minutes")?;
    let agg_counts = col::<UInt64Array>(batch, 16, "agg_count")?;
    let agg_sums = col::<Float64Array>(batch, 17, "agg_sum")?;
    let agg_mins = col::<Float64Array>(batch, 18, "agg_min")?;
    let agg_maxs = col::<Float64Array>(batch, 19, "agg_max")?;
    let agg_errors = col::<UInt64Array>(batch, 20, "agg_error_count")?;
    let agg_p50s = col::<Float64Array>(batch, 21, "agg_p50")?;
    let agg_p95s = col::<Float64Array>(batch, 22, "agg_p95")?;
    let agg_p99s = col::<Float64Array>(batch, 23, "agg_p99")?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let metric_type: MetricType = types
            .value(i)
            .parse()
            .map_err(|e: String| StoreError::fatal(e))?;
        let tags_map: Option<BTreeMap<String, String>> = match opt_str(tags, i) {
            Some(json) if !json.is_empty() => serde_json::from_str(&json)
                .map_err(|e| StoreError::fatal(format!("tags column: {e}")))?,
            _ => None,
        };
        rows.push(StoredRow {
            id: ids.value(i),
            timestamp: timestamps.value(i),
            service_name: services.value(i).to_string(),
            metric_name: metrics.value(i).to_string(),
            metric_type,
            value: values.value(i),
            endpoint: opt_str(endpoints, i),
            method: opt_str(methods, i),
            status_code: if statuses.is_valid(i) {
                Some(statuses.value(i))
            } else {
                None
            },
            duration_ms: opt_f64(durations, i),
            tags: tags_map,
            trace_id: opt_str(trace_ids, i),
            span_id: opt_str(span_ids, i),
            environment: opt_str(environments, i),
            aggregated: aggregated.value(i),
            resolution_minutes: resolutions.value(i),
            agg_count: opt_u64(agg_counts, i),
            agg_sum: opt_f64(agg_sums, i),
            agg_min: opt_f64(agg_mins, i),
            agg_max: opt_f64(agg_maxs, i),
            agg_error_count: opt_u64(agg_errors, i),
            agg_p50: opt_f64(agg_p50s, i),
            agg_p95: opt_f64(agg_p95s, i),
            agg_p99: opt_f64(agg_p99s, i),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::MetricSample;

    fn row(id: u64, service: &str, metric: &str, ts: i64, value: f64) -> StoredRow {
        StoredRow::from_sample(
            id,
            MetricSample {
                timestamp: ts,
                service_name: service.into(),
                metric_name: metric.into(),
                metric_type: MetricType::Gauge,
                value,
                endpoint: Some("/x".into()),
                method: None,
                status_code: Some(200),
                duration_ms: Some(value),
                tags: Some([("region".to_string(), "eu".to_string())].into_iter().collect()),
                trace_id: None,
                span_id: None,
                environment: Some("prod".into()),
            },
            None,
        )
    }

    #[test]
    fn test_round_trip_preserves_rows() {
        let rows = vec![row(1, "api", "m", 1_000, 1.5), row(2, "web", "m", 2_000, 2.5)];
        let batch = rows_to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let decoded = batch_to_rows(&batch).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_sort_rows_orders_by_primary_key() {
        let mut rows = vec![
            row(3, "web", "m", 1_000, 1.0),
            row(1, "api", "z", 2_000, 1.0),
            row(2, "api", "a", 3_000, 1.0),
            row(4, "api", "a", 1_000, 1.0),
        ];
        sort_rows(&mut rows);
        let order: Vec<u64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![4, 2, 1, 3]);
    }

    #[test]
    fn test_aggregated_fields_survive() {
        let mut r = row(9, "api", "m", 60_000, 10.0);
        r.aggregated = true;
        r.resolution_minutes = 1;
        r.agg_count = Some(4);
        r.agg_sum = Some(40.0);
        r.agg_min = Some(5.0);
        r.agg_max = Some(15.0);
        r.agg_error_count = Some(1);
        r.agg_p95 = Some(14.0);
        let batch = rows_to_batch(std::slice::from_ref(&r)).unwrap();
        let decoded = batch_to_rows(&batch).unwrap();
        assert_eq!(decoded[0], r);
    }
}
