//! Adversarial weight warmup
//!
//! `weight(t) = target * exp(-7 + 7 * t / warmup_steps)` for `t < warmup_steps`,
//! then `target`.

/// Exponential ramp of the adversarial loss weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdversarialWarmup {
    target: f64,
    warmup_steps: usize,
}

impl AdversarialWarmup {
    pub fn new(target: f64, warmup_steps: usize) -> Self {
        Self { target, warmup_steps }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Weight at iteration `step`
    pub fn weight(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            let progress = step as f64 / self.warmup_steps as f64;
            self.target * (-7.0 + 7.0 * progress).exp()
        } else {
            self.target
        }
    }

    /// Whether `step` is past the ramp
    pub fn is_warm(&self, step: usize) -> bool {
        step >= self.warmup_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ramp_formula() {
        let schedule = AdversarialWarmup::new(2.0, 100);
        for step in [0, 1, 25, 50, 99] {
            let expected = 2.0 * (-7.0 + 7.0 * step as f64 / 100.0).exp();
            assert_relative_eq!(schedule.weight(step), expected, max_relative = 1e-12);
        }
        assert_relative_eq!(schedule.weight(0), 2.0 * (-7.0f64).exp());
    }

    #[test]
    fn test_target_reached_exactly() {
        let schedule = AdversarialWarmup::new(0.3, 10);
        assert_eq!(schedule.weight(10), 0.3);
        assert_eq!(schedule.weight(1_000), 0.3);
        assert!(!schedule.is_warm(9));
        assert!(schedule.is_warm(10));
    }

    #[test]
    fn test_monotone_during_warmup() {
        let schedule = AdversarialWarmup::new(1.0, 50);
        let weights: Vec<f64> = (0..=50).map(|t| schedule.weight(t)).collect();
        assert!(weights.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_no_warmup() {
        let schedule = AdversarialWarmup::new(1.5, 0);
        assert_eq!(schedule.weight(0), 1.5);
    }
}
