// Insert path.
//
// Rows are grouped by (resolution, month), sorted by the table's primary
// order, encoded as one zstd-compressed Parquet object per group and named
// by content hash: replaying the same batch overwrites the same object.

use std::collections::HashMap;

use beacon_core::StoredRow;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::error::Result;
use crate::partition::{file_path, month_of};
use crate::schema::{metrics_schema, rows_to_batch, sort_rows};
use crate::Store;

/// Outcome of a successful insert.
#[derive(Debug, Clone, Default)]
pub struct InsertReceipt {
    pub rows_written: usize,
    pub files: Vec<String>,
}

impl Store {
    /// Insert a batch of rows.
    ///
    /// Idempotent from the caller's perspective: identical batches collapse
    /// onto the same object, and rows that survive as duplicates under
    /// different batching are removed by id on read.
    pub async fn insert_rows(&self, rows: &[StoredRow]) -> Result<InsertReceipt> {
        if rows.is_empty() {
            return Ok(InsertReceipt::default());
        }

        let mut groups: HashMap<(u16, i32, u32), Vec<StoredRow>> = HashMap::new();
        for row in rows {
            let (year, month) = month_of(row.timestamp);
            groups
                .entry((row.resolution_minutes, year, month))
                .or_default()
                .push(row.clone());
        }

        let mut receipt = InsertReceipt {
            rows_written: rows.len(),
            files: Vec::with_capacity(groups.len()),
        };

        for ((resolution, year, month), mut group) in groups {
            sort_rows(&mut group);
            let min_ts = group.iter().map(|r| r.timestamp).min().unwrap_or(0);
            let encoded = self.encode_parquet(&group)?;
            let hash = blake3::hash(&encoded).to_hex().to_string();
            let path = file_path(resolution, year, month, min_ts, &hash);

            let _permit = self.permit().await?;
            self.op.write(&path, encoded).await?;
            debug!(path = %path, rows = group.len(), "wrote metrics object");
            receipt.files.push(path);
        }

        Ok(receipt)
    }

    fn encode_parquet(&self, rows: &[StoredRow]) -> Result<Vec<u8>> {
        let batch = rows_to_batch(rows)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .set_max_row_group_size(self.row_group_size)
            .build();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, metrics_schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{memory_store, raw_row};

    #[tokio::test]
    async fn test_insert_writes_one_file_per_partition() {
        let store = memory_store();
        // Two rows in one month, one in the next (raw resolution).
        let rows = vec![
            raw_row(1, "api", "m", 1_700_000_000_000, 1.0),
            raw_row(2, "api", "m", 1_700_000_060_000, 2.0),
            raw_row(3, "api", "m", 1_703_000_000_000, 3.0),
        ];
        let receipt = store.insert_rows(&rows).await.unwrap();
        assert_eq!(receipt.rows_written, 3);
        assert_eq!(receipt.files.len(), 2);
        assert!(receipt.files.iter().all(|f| f.ends_with(".parquet")));
        assert!(receipt
            .files
            .iter()
            .any(|f| f.starts_with("metrics/res=0/month=2023-11/")));
    }

    #[tokio::test]
    async fn test_identical_batch_is_idempotent() {
        let store = memory_store();
        let rows = vec![raw_row(1, "api", "m", 1_700_000_000_000, 1.0)];
        let first = store.insert_rows(&rows).await.unwrap();
        let second = store.insert_rows(&rows).await.unwrap();
        assert_eq!(first.files, second.files);
    }

    #[tokio::test]
    async fn test_empty_insert_is_noop() {
        let store = memory_store();
        let receipt = store.insert_rows(&[]).await.unwrap();
        assert_eq!(receipt.rows_written, 0);
        assert!(receipt.files.is_empty());
    }
}
