// In-memory accumulation between bus poll and store insert.
//
// A pending record keeps its bus position next to its decoded rows; offsets
// commit only after every row they cover is acknowledged by storage.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use beacon_core::StoredRow;

#[derive(Debug)]
pub struct PendingRecord {
    pub partition: i32,
    pub offset: i64,
    pub rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
pub struct Batch {
    records: Vec<PendingRecord>,
    row_count: usize,
    opened_at: Option<Instant>,
}

impl Batch {
    pub fn push(&mut self, record: PendingRecord) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.row_count += record.rows.len();
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn age(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::ZERO)
    }

    /// Flush once the batch is big enough or old enough.
    pub fn should_flush(&self, target_rows: usize, max_age: Duration, now: Instant) -> bool {
        if self.is_empty() {
            return false;
        }
        self.row_count >= target_rows || self.age(now) >= max_age
    }

    /// All rows across pending records, in consumption order.
    pub fn rows(&self) -> Vec<StoredRow> {
        self.records.iter().flat_map(|r| r.rows.clone()).collect()
    }

    /// Highest offset per partition, the commit set for this batch.
    pub fn commit_offsets(&self) -> Vec<(i32, i64)> {
        let mut highest: HashMap<i32, i64> = HashMap::new();
        for record in &self.records {
            let entry = highest.entry(record.partition).or_insert(record.offset);
            *entry = (*entry).max(record.offset);
        }
        let mut out: Vec<(i32, i64)> = highest.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Put a record back at the head after a failed probe.
    pub fn push_front(&mut self, record: PendingRecord) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.row_count += record.rows.len();
        self.records.insert(0, record);
    }

    /// Remove and return the oldest pending record (the probe unit).
    pub fn pop_front(&mut self) -> Option<PendingRecord> {
        if self.records.is_empty() {
            return None;
        }
        let record = self.records.remove(0);
        self.row_count -= record.rows.len();
        if self.records.is_empty() {
            self.opened_at = None;
        }
        Some(record)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.row_count = 0;
        self.opened_at = None;
    }
}
