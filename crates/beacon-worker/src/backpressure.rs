// Lag-adaptive batch sizing.
//
// Small backlog, small batches: records reach storage quickly. Large
// backlog, large batches: fewer, bigger inserts maximize write throughput.
// The factor doubles per order of magnitude of lag beyond one thousand.

/// Target batch size for the current consumer lag, clamped to
/// `[batch_min, batch_max]`. Non-decreasing in `lag`.
pub fn target_batch_size(base: usize, lag: u64, batch_min: usize, batch_max: usize) -> usize {
    let factor: usize = if lag < 1_000 {
        1
    } else {
        // lag 1k..10k -> 2, 10k..100k -> 4, 100k..1M -> 8, ...
        let magnitude = ((lag as f64 / 1_000.0).log10().floor() as u32).min(15);
        1 << (magnitude + 1)
    };
    base.saturating_mul(factor).clamp(batch_min, batch_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_lag_uses_base() {
        assert_eq!(target_batch_size(100, 0, 10, 5_000), 100);
        assert_eq!(target_batch_size(100, 999, 10, 5_000), 100);
    }

    #[test]
    fn test_doubles_per_order_of_magnitude() {
        assert_eq!(target_batch_size(100, 1_000, 10, 100_000), 200);
        assert_eq!(target_batch_size(100, 9_999, 10, 100_000), 200);
        assert_eq!(target_batch_size(100, 10_000, 10, 100_000), 400);
        assert_eq!(target_batch_size(100, 100_000, 10, 100_000), 800);
    }

    #[test]
    fn test_clamped_to_bounds() {
        assert_eq!(target_batch_size(100, u64::MAX, 10, 5_000), 5_000);
        assert_eq!(target_batch_size(5, 0, 10, 5_000), 10);
    }

    #[test]
    fn test_non_decreasing_in_lag() {
        let mut last = 0;
        for lag in (0..2_000_000u64).step_by(7_919) {
            let size = target_batch_size(100, lag, 10, 1_000_000);
            assert!(size >= last, "size decreased at lag {lag}");
            last = size;
        }
    }
}
