//! 重连退避策略：带上限的指数退避加随机抖动

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 第一次重试的基础延迟
    pub base: Duration,
    /// 指数部分的上限
    pub max_delay: Duration,
    /// 推送通道最多重试次数，用完后切换到降级通道
    pub max_attempts: u32,
    /// 抖动窗口，实际延迟额外加上 `[0, jitter]` 的随机值
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(800),
            max_delay: Duration::from_secs(8),
            max_attempts: 3,
            jitter: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    /// 不重试、不等待（降级通道直接接管）
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重试（从 0 开始）的延迟：`min(max_delay, base * 2^attempt) + random(0, jitter)`
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        self.backoff(attempt) + jitter
    }

    /// 不含抖动的退避部分
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 还能否再重试（`failures` 为推送通道已失败的次数）
    pub fn has_attempts_left(&self, failures: u32) -> bool {
        failures <= self.max_attempts
    }
}
