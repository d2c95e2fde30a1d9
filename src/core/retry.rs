//! 重试退避策略
//!
//! 指数退避：base 1s、倍率 2、上限 16s、抖动 ±20%。
//! 抖动使用可播种的 StdRng，固定 seed 时两次运行产生完全相同的延迟序列。

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 退避策略：delay(attempt) 返回第 attempt 次重试前应等待的时长
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    factor: f64,
    cap: Duration,
    /// 抖动比例（0.2 = ±20%）
    jitter: f64,
    max_retries: u32,
    rng: StdRng,
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: f64, cap: Duration, jitter: f64, max_retries: u32) -> Self {
        Self {
            base,
            factor,
            cap,
            jitter,
            max_retries,
            rng: StdRng::from_entropy(),
        }
    }

    /// 固定随机种子，使抖动序列可复现
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 第 attempt 次（0 起）重试前的延迟：min(base * factor^attempt, cap) 加抖动
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let base_ms = (self.base.as_millis() as f64 * self.factor.powi(attempt as i32))
            .min(self.cap.as_millis() as f64);

        let delay_ms = if self.jitter > 0.0 {
            let jitter_range = base_ms * self.jitter;
            let jitter = self.rng.gen_range(-jitter_range..=jitter_range);
            (base_ms + jitter).max(0.0)
        } else {
            base_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(16), 0.2, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_without_jitter() {
        let mut policy =
            BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(16), 0.0, 3);

        assert_eq!(policy.delay(0).as_millis(), 1000);
        assert_eq!(policy.delay(1).as_millis(), 2000);
        assert_eq!(policy.delay(2).as_millis(), 4000);
        assert_eq!(policy.delay(3).as_millis(), 8000);
        // 封顶在 16s
        assert_eq!(policy.delay(4).as_millis(), 16000);
        assert_eq!(policy.delay(10).as_millis(), 16000);
    }

    #[test]
    fn test_jitter_within_bounds() {
        let mut policy = BackoffPolicy::default().with_seed(7);
        for attempt in 0..6 {
            let base_ms = (1000.0_f64 * 2.0_f64.powi(attempt)).min(16000.0);
            let d = policy.delay(attempt as u32).as_millis() as f64;
            assert!(d >= base_ms * 0.8 - 1.0, "attempt {attempt}: {d} < lower bound");
            assert!(d <= base_ms * 1.2 + 1.0, "attempt {attempt}: {d} > upper bound");
        }
    }

    #[test]
    fn test_seed_makes_delays_reproducible() {
        let mut a = BackoffPolicy::default().with_seed(42);
        let mut b = BackoffPolicy::default().with_seed(42);
        for attempt in 0..5 {
            assert_eq!(a.delay(attempt), b.delay(attempt));
        }
    }
}
