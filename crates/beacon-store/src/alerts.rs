// Alert persistence.
//
// Alerts are low-volume, individually mutable records, so they live as JSON
// objects next to the metrics data rather than inside the columnar table.
// Keys embed an inverted first-trigger timestamp: a plain ascending listing
// is already newest-first.

use beacon_core::Alert;
use opendal::ErrorKind;

use crate::error::{Result, StoreError};
use crate::Store;

const ALERTS_PREFIX: &str = "alerts/";
/// Safety cap on a full alert listing.
const LIST_CAP: usize = 10_000;

fn alert_path(alert: &Alert) -> String {
    let inverted = (i64::MAX - alert.first_triggered) as u64;
    format!("{ALERTS_PREFIX}{inverted:020}-{}.json", alert.alert_id)
}

impl Store {
    /// Create or overwrite an alert record. The key is stable across the
    /// alert's lifecycle, so firing updates and resolution overwrite in
    /// place.
    pub async fn put_alert(&self, alert: &Alert) -> Result<()> {
        debug_assert!(alert.invariants_hold());
        let body = serde_json::to_vec(alert)
            .map_err(|e| StoreError::fatal(format!("alert encode: {e}")))?;
        let _permit = self.permit().await?;
        self.op.write(&alert_path(alert), body).await?;
        Ok(())
    }

    /// Alerts, newest first, up to `limit`.
    pub async fn list_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let mut names: Vec<String> = match self.op.list(ALERTS_PREFIX).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.name().ends_with(".json"))
                .map(|e| e.path().to_string())
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        names.sort();
        names.truncate(limit.min(LIST_CAP));

        let mut alerts = Vec::with_capacity(names.len());
        for path in names {
            let _permit = self.permit().await?;
            let buffer = self.op.read(&path).await?;
            let alert: Alert = serde_json::from_slice(&buffer.to_bytes())
                .map_err(|e| StoreError::fatal(format!("alert decode {path}: {e}")))?;
            alerts.push(alert);
        }
        Ok(alerts)
    }

    /// Alerts currently in the firing state, newest first.
    pub async fn active_alerts(&self) -> Result<Vec<Alert>> {
        Ok(self
            .list_alerts(LIST_CAP)
            .await?
            .into_iter()
            .filter(Alert::is_firing)
            .collect())
    }
}
