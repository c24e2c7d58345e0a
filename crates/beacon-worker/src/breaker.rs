// Circuit breaker for the storage write path.
//
// Single-writer state machine owned by the consumer loop; health probes
// read a copy of the state. Transitions:
//
//   closed --(threshold consecutive retryable failures)--> open
//   open   --(cooldown elapsed)--> half-open
//   half-open --(probe success)--> closed
//   half-open --(probe failure)--> open (cooldown restarts)
//
// There is no closed -> half-open edge; every recovery passes through open.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// What the consumer loop may do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Normal operation.
    Allow,
    /// Admit one small probe insert.
    Probe,
    /// Stay away from storage; do not consume, do not commit.
    Hold { remaining: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Decide what the loop may do at `now`, promoting open to half-open
    /// once the cooldown has elapsed.
    pub fn gate(&mut self, now: Instant) -> Gate {
        match self.state {
            BreakerState::Closed => Gate::Allow,
            BreakerState::HalfOpen => Gate::Probe,
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.cooldown {
                    self.state = BreakerState::HalfOpen;
                    tracing::info!("circuit breaker: open -> half-open");
                    Gate::Probe
                } else {
                    Gate::Hold {
                        remaining: self.cooldown - elapsed,
                    }
                }
            }
        }
    }

    /// A storage write succeeded.
    pub fn on_success(&mut self) {
        if self.state != BreakerState::Closed {
            tracing::info!(from = self.state.as_str(), "circuit breaker: -> closed");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// A retryable storage write failed (after its in-place retries).
    /// Returns true when this failure tripped the breaker open.
    pub fn on_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        match self.state {
            BreakerState::Closed => {
                if self.consecutive_failures >= self.threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    tracing::warn!(
                        failures = self.consecutive_failures,
                        "circuit breaker: closed -> open"
                    );
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                tracing::warn!("circuit breaker: probe failed, half-open -> open");
                true
            }
            BreakerState::Open => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    #[test]
    fn test_trips_after_threshold_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(5, COOLDOWN);
        let now = Instant::now();
        for _ in 0..4 {
            assert!(!breaker.on_failure(now));
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        assert!(breaker.on_failure(now));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut breaker = CircuitBreaker::new(3, COOLDOWN);
        let now = Instant::now();
        breaker.on_failure(now);
        breaker.on_failure(now);
        breaker.on_success();
        breaker.on_failure(now);
        breaker.on_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_open_holds_until_cooldown_then_probes() {
        let mut breaker = CircuitBreaker::new(1, COOLDOWN);
        let t0 = Instant::now();
        breaker.on_failure(t0);

        match breaker.gate(t0 + Duration::from_secs(30)) {
            Gate::Hold { remaining } => assert!(remaining <= Duration::from_secs(30)),
            other => panic!("expected hold, got {other:?}"),
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        assert_eq!(breaker.gate(t0 + COOLDOWN), Gate::Probe);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_cooldown() {
        let mut breaker = CircuitBreaker::new(1, COOLDOWN);
        let t0 = Instant::now();
        breaker.on_failure(t0);
        assert_eq!(breaker.gate(t0 + COOLDOWN), Gate::Probe);

        let t1 = t0 + COOLDOWN + Duration::from_secs(1);
        breaker.on_failure(t1);
        assert_eq!(breaker.state(), BreakerState::Open);
        // Cooldown measured from the probe failure, not the original trip.
        match breaker.gate(t1 + Duration::from_secs(59)) {
            Gate::Hold { .. } => {}
            other => panic!("expected hold, got {other:?}"),
        }
        assert_eq!(breaker.gate(t1 + COOLDOWN), Gate::Probe);
    }

    #[test]
    fn test_probe_success_closes() {
        let mut breaker = CircuitBreaker::new(1, COOLDOWN);
        let t0 = Instant::now();
        breaker.on_failure(t0);
        assert_eq!(breaker.gate(t0 + COOLDOWN), Gate::Probe);
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.gate(t0 + COOLDOWN), Gate::Allow);
    }

    #[test]
    fn test_closed_never_jumps_to_half_open() {
        let mut breaker = CircuitBreaker::new(3, COOLDOWN);
        let now = Instant::now();
        // However long we wait while closed, the gate stays Allow and the
        // state stays Closed; HalfOpen is reachable only from Open.
        for hours in 0..48 {
            assert_eq!(
                breaker.gate(now + Duration::from_secs(hours * 3_600)),
                Gate::Allow
            );
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
    }
}
