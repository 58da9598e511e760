//! Token-bucket byte budget used for the per-connection bandwidth caps.

/// Refills at `bytes_per_second` up to one second's worth of burst.
///
/// A budget of zero bytes per second is unlimited. The balance may go negative
/// once, so a single packet larger than the whole budget is still sent instead
/// of stalling the connection forever.
#[derive(Debug, Clone)]
pub struct BandwidthBudget {
    bytes_per_second: usize,
    available: f64,
}

impl BandwidthBudget {
    pub fn new(bytes_per_second: usize) -> Self {
        Self {
            bytes_per_second,
            available: bytes_per_second as f64,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_second == 0
    }

    pub fn refill(&mut self, dt: f64) {
        if self.is_unlimited() {
            return;
        }
        let cap = self.bytes_per_second as f64;
        self.available = (self.available + dt * cap).min(cap);
    }

    /// Spends `bytes` if any budget is left.
    pub fn try_consume(&mut self, bytes: usize) -> bool {
        if self.is_unlimited() {
            return true;
        }
        if self.available <= 0.0 {
            return false;
        }
        self.available -= bytes as f64;
        true
    }

    pub fn available(&self) -> Option<f64> {
        (!self.is_unlimited()).then_some(self.available)
    }
}

impl Default for BandwidthBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_refuses() {
        let mut budget = BandwidthBudget::unlimited();
        for _ in 0..1000 {
            assert!(budget.try_consume(1_000_000));
        }
        assert_eq!(budget.available(), None);
    }

    #[test]
    fn test_budget_drains_and_refills() {
        let mut budget = BandwidthBudget::new(1000);
        assert!(budget.try_consume(600));
        assert!(budget.try_consume(600));
        assert!(!budget.try_consume(1));

        budget.refill(0.5);
        assert_eq!(budget.available(), Some(300.0));
        assert!(budget.try_consume(100));
    }

    #[test]
    fn test_refill_is_capped_at_one_second() {
        let mut budget = BandwidthBudget::new(1000);
        budget.refill(10.0);
        assert_eq!(budget.available(), Some(1000.0));
    }
}
