// beacon-core - shared data model for the beacon metrics pipeline
//
// Everything in this crate is pure: no async, no I/O, no global state.
// The gateway, worker, store and query service all speak these types.

mod aggregate;
mod alert;
mod error;
mod id;
mod sample;
mod validate;

pub use aggregate::{
    floor_to_minute, quantile_of_sorted, AggregateSummary, AggregationKey, Accumulator, Reservoir,
};
pub use alert::{Alert, AlertSeverity, AlertStatus};
pub use error::{ErrorBody, Fault};
pub use id::IdGenerator;
pub use sample::{MetricBatch, MetricSample, MetricType, RecordSet, StoredRow};
pub use validate::{validate_batch, SampleError};

/// Identifier constraints shared by `service_name` and `metric_name`.
pub const MAX_IDENT_LEN: usize = 255;
/// Upper bound on tag map cardinality per sample.
pub const MAX_TAGS: usize = 32;
/// Upper bound on tag key/value byte length.
pub const MAX_TAG_LEN: usize = 128;
