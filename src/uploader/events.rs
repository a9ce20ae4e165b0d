//! 上传事件
//!
//! 引擎和编排器通过无界通道发出事件，消费方（命令行）负责展示。
//! 进度事件按时间节流，完成时强制发出最后一次。

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::manager::FileOutcome;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 某个 worker 开始处理文件
    FileStarted { path: PathBuf },
    /// 传输进度
    Progress {
        path: PathBuf,
        uploaded: u64,
        total: u64,
    },
    /// 退避等待
    Retrying {
        path: PathBuf,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// 单个文件结束
    FileFinished { outcome: FileOutcome },
    /// 配额耗尽，不再接收新文件
    Halted { reason: String },
}

/// 事件发送端，未设置时丢弃事件
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<UploadEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<UploadEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.tx {
            // 接收端已关闭时静默丢弃
            let _ = tx.send(event);
        }
    }
}

/// 进度事件节流器
///
/// 每个传输任务独占一个，不需要原子操作。
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    last_emit: Option<Instant>,
    interval: Duration,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: None,
            interval,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布超过间隔时返回 true 并记录时间；首次调用总是 true
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// 强制发布（最后一次更新）
    pub fn force_emit(&mut self) -> bool {
        self.last_emit = Some(Instant::now());
        true
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
