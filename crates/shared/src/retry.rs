use std::time::Duration;

/// Exponential backoff for transient network failures: the `n`th retry waits
/// `base_delay * factor^n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            factor: 1.5,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        self.base_delay.mul_f64(self.factor.powi(exponent))
    }
}
