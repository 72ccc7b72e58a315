use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// 指数退避策略
///
/// 同一个结构同时用于两种场景：任务失败后的重试延迟（`fail` 重新计算
/// `not_before`），以及Broker内部对瞬时传输错误的重试。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 基础重试间隔（毫秒）
    pub base_interval_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval_ms: 10_000,    // 10秒
            max_interval_ms: 3_600_000, // 1小时
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 传输层重试的默认策略：更短的间隔
    pub fn transport_default() -> Self {
        Self {
            base_interval_ms: 200,
            max_interval_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// 无抖动、固定间隔的策略，主要用于测试
    pub fn fixed(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            base_interval_ms: ms,
            max_interval_ms: ms,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// 第 `attempt` 次重试（从1开始）前的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_interval_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_interval_ms as f64);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let delay_ms = if jitter > 0.0 && capped > 0.0 {
            let spread = capped * jitter;
            let offset = rand::rng().random_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(delay_ms as u64)
    }
}
