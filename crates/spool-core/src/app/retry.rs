//! Retry policy: decides backoff delays and when to give up.
//!
//! # 学習ポイント
//! - 指数バックオフ: `base * multiplier^(n-1)` を `max_delay` で頭打ちにする
//! - `f64` で計算してから clamp するので、大きな `n` でもオーバーフローしない

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `base_delay * multiplier^(attempts - 1)`, capped at
/// `max_delay`. `max_attempts: None` retries forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay_ms: u64,

    pub multiplier: f64,

    pub max_delay_ms: u64,

    /// Total attempts allowed, the first one included.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: Some(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            multiplier,
            max_delay_ms: max_delay.as_millis() as u64,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before the next try, after `attempts` failed attempts (1-indexed).
    ///
    /// With base=100ms, multiplier=2.0: 100ms, 200ms, 400ms, ... up to `max_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(20))
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    #[case(5, 20)]
    #[case(60, 20)]
    fn exponential_backoff_is_capped(#[case] attempts: u32, #[case] expected_secs: u64) {
        assert_eq!(policy().next_delay(attempts), Duration::from_secs(expected_secs));
    }

    #[rstest]
    #[case(Some(3), 2, true)]
    #[case(Some(3), 3, false)]
    #[case(None, 10_000, true)]
    fn attempt_limit(#[case] max: Option<u32>, #[case] attempts: u32, #[case] expected: bool) {
        let policy = RetryPolicy {
            max_attempts: max,
            ..policy()
        };
        assert_eq!(policy.should_retry(attempts), expected);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let policy: RetryPolicy = toml::from_str("base_delay_ms = 5").unwrap();
        assert_eq!(policy.base_delay_ms, 5);
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_attempts, Some(5));
    }
}
