// Alert records and their lifecycle transitions.
//
// The evaluation loop in the query service decides *when* to transition; the
// methods here guarantee the record-level invariants hold on every path:
// first_triggered <= last_triggered, and resolved_at is present exactly when
// status is resolved.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    /// Severity from the breach z-score magnitude.
    pub fn from_zscore(z: f64) -> Self {
        let z = z.abs();
        if z >= 5.0 {
            AlertSeverity::Critical
        } else if z >= 4.0 {
            AlertSeverity::Warning
        } else {
            AlertSeverity::Info
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// Authoritative record of a threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub service_name: String,
    pub metric_name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub current_value: f64,
    pub expected_min: f64,
    pub expected_max: f64,
    pub threshold_breach_count: u32,
    pub first_triggered: i64,
    pub last_triggered: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
}

impl Alert {
    /// Open a new firing alert for the first breach of a bound.
    pub fn fire(
        service_name: &str,
        metric_name: &str,
        severity: AlertSeverity,
        current_value: f64,
        expected_min: f64,
        expected_max: f64,
        now_ms: i64,
    ) -> Self {
        Self {
            alert_id: Uuid::new_v4().to_string(),
            service_name: service_name.to_owned(),
            metric_name: metric_name.to_owned(),
            severity,
            status: AlertStatus::Firing,
            current_value,
            expected_min,
            expected_max,
            threshold_breach_count: 1,
            first_triggered: now_ms,
            last_triggered: now_ms,
            resolved_at: None,
        }
    }

    /// Record a repeated breach on an already-firing alert.
    pub fn record_breach(
        &mut self,
        severity: AlertSeverity,
        current_value: f64,
        expected_min: f64,
        expected_max: f64,
        now_ms: i64,
    ) {
        debug_assert_eq!(self.status, AlertStatus::Firing);
        self.threshold_breach_count += 1;
        self.last_triggered = now_ms.max(self.first_triggered);
        self.current_value = current_value;
        self.expected_min = expected_min;
        self.expected_max = expected_max;
        // Severity only escalates while firing.
        if severity > self.severity {
            self.severity = severity;
        }
    }

    /// Transition to resolved.
    pub fn resolve(&mut self, now_ms: i64) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now_ms.max(self.last_triggered));
    }

    pub fn is_firing(&self) -> bool {
        self.status == AlertStatus::Firing
    }

    /// Record-level invariant check, used by tests and the persistence layer.
    pub fn invariants_hold(&self) -> bool {
        self.first_triggered <= self.last_triggered
            && (self.status == AlertStatus::Resolved) == self.resolved_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_bands() {
        assert_eq!(AlertSeverity::from_zscore(3.2), AlertSeverity::Info);
        assert_eq!(AlertSeverity::from_zscore(-4.1), AlertSeverity::Warning);
        assert_eq!(AlertSeverity::from_zscore(5.0), AlertSeverity::Critical);
    }

    #[test]
    fn test_fire_breach_resolve_invariants() {
        let mut alert = Alert::fire("api", "latency", AlertSeverity::Info, 9.0, 1.0, 5.0, 100);
        assert!(alert.invariants_hold());
        assert_eq!(alert.threshold_breach_count, 1);

        alert.record_breach(AlertSeverity::Critical, 11.0, 1.0, 5.0, 200);
        assert!(alert.invariants_hold());
        assert_eq!(alert.threshold_breach_count, 2);
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.last_triggered, 200);

        alert.resolve(300);
        assert!(alert.invariants_hold());
        assert_eq!(alert.status, AlertStatus::Resolved);
        assert_eq!(alert.resolved_at, Some(300));
    }

    #[test]
    fn test_severity_never_downgrades_while_firing() {
        let mut alert = Alert::fire("api", "latency", AlertSeverity::Warning, 9.0, 1.0, 5.0, 100);
        alert.record_breach(AlertSeverity::Info, 8.0, 1.0, 5.0, 150);
        assert_eq!(alert.severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_clock_skew_cannot_break_ordering() {
        let mut alert = Alert::fire("api", "latency", AlertSeverity::Info, 9.0, 1.0, 5.0, 500);
        alert.record_breach(AlertSeverity::Info, 9.0, 1.0, 5.0, 400);
        assert!(alert.invariants_hold());
        alert.resolve(100);
        assert!(alert.invariants_hold());
    }

    #[test]
    fn test_new_fire_gets_fresh_id() {
        let a = Alert::fire("api", "latency", AlertSeverity::Info, 9.0, 1.0, 5.0, 1);
        let b = Alert::fire("api", "latency", AlertSeverity::Info, 9.0, 1.0, 5.0, 1);
        assert_ne!(a.alert_id, b.alert_id);
    }
}
