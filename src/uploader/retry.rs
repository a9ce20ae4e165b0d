//! 重试与退避
//!
//! `RetryPolicy::next_action` 是纯函数：输入失败次数、上次等待、错误类型和抖动，
//! 输出下一步动作。真正的等待通过 [`Sleeper`] 注入，测试中不产生真实延迟。

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::UploadConfig;
use crate::error::RemoteErrorKind;

/// 下一步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// 等待后从最后确认的偏移继续
    RetryAfter(Duration),
    /// 已达到尝试上限，以可重试失败结束
    GiveUp,
}

/// 指数退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 单个文件的最大尝试次数
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 限流时的最小等待
    pub rate_limit_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.retry_count.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            rate_limit_delay: Duration::from_millis(config.rate_limit_delay_ms),
        }
    }

    /// 抖动上限为基础延迟的一半，保证退避序列单调不减
    pub fn max_jitter(&self) -> Duration {
        self.base_delay / 2
    }

    pub fn random_jitter(&self) -> Duration {
        let max_ms = self.max_jitter().as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// 计算下一步动作
    ///
    /// # 参数
    /// * `failed_attempts` - 包括本次在内已失败的尝试次数
    /// * `last_delay` - 上一次退避的等待时间（首次为 0）
    /// * `kind` - 本次失败的错误类型
    /// * `jitter` - 随机抖动，超过 `max_jitter` 的部分被截断
    ///
    /// 延迟序列：`base * 2^(n-1) + jitter`，不超过 `max_delay`，且不小于上一次等待。
    pub fn next_action(
        &self,
        failed_attempts: u32,
        last_delay: Duration,
        kind: RemoteErrorKind,
        jitter: Duration,
    ) -> NextAction {
        if failed_attempts >= self.max_attempts {
            return NextAction::GiveUp;
        }

        let exponent = failed_attempts.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .saturating_add(jitter.min(self.max_jitter()));

        let mut delay = backoff.min(self.max_delay);
        if kind == RemoteErrorKind::RateLimited {
            delay = delay.max(self.rate_limit_delay.min(self.max_delay));
        }
        NextAction::RetryAfter(delay.max(last_delay))
    }
}

/// 可注入的等待
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// 真实等待
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
