//! 单次传输的状态

use serde::Serialize;

use crate::error::UploadError;

/// 传输状态机
///
/// `Initiating -> Uploading(offset) -> {Completed | Interrupted(offset) | Rejected}`，
/// 从 `Interrupted` 重新查询远端偏移后回到 `Uploading`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum TransferState {
    /// 正在创建上传会话
    Initiating,
    /// 上传中，`offset` 为远端已确认的字节数
    Uploading { offset: u64 },
    /// 完成
    Completed { video_id: String },
    /// 中断，等待退避后恢复
    Interrupted { offset: u64 },
    /// 本次尝试的终态
    Rejected { reason: String },
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Rejected { .. })
    }
}

/// 一次上传的工作状态（不持久化）
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// 远端已确认的字节数
    pub offset: u64,
    pub total_size: u64,
    /// 已失败的尝试次数
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub state: TransferState,
}

impl TransferJob {
    pub fn new(total_size: u64) -> Self {
        Self {
            offset: 0,
            total_size,
            attempt_count: 0,
            last_error: None,
            state: TransferState::Initiating,
        }
    }

    /// 远端确认了新的偏移
    pub fn mark_progress(&mut self, acknowledged: u64) {
        self.offset = acknowledged;
        self.state = TransferState::Uploading { offset: acknowledged };
    }

    pub fn mark_interrupted(&mut self, error: &str) {
        self.attempt_count += 1;
        self.last_error = Some(error.to_string());
        self.state = TransferState::Interrupted { offset: self.offset };
    }

    /// 会话失效，只能从头开始
    pub fn mark_restart(&mut self) {
        self.offset = 0;
        self.state = TransferState::Initiating;
    }

    pub fn mark_completed(&mut self, video_id: &str) {
        self.offset = self.total_size;
        self.state = TransferState::Completed {
            video_id: video_id.to_string(),
        };
    }

    pub fn mark_rejected(&mut self, reason: &str) {
        self.last_error = Some(reason.to_string());
        self.state = TransferState::Rejected {
            reason: reason.to_string(),
        };
    }

    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.offset)
    }
}

/// 传输引擎返回给编排器的结果
///
/// `sessions` 为远端创建的会话数。每创建一次会话远端计一次配额，
/// 会话过期重建时会大于 1。
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Completed { video_id: String, sessions: u32 },
    /// 可稍后重试（含远端配额耗尽）
    Retryable { error: UploadError, sessions: u32 },
    /// 永久失败
    Permanent { error: UploadError, sessions: u32 },
    /// 运行被取消，`offset` 为取消时远端已确认的字节数
    Cancelled { offset: u64, sessions: u32 },
}

impl TransferOutcome {
    pub fn sessions(&self) -> u32 {
        match self {
            Self::Completed { sessions, .. }
            | Self::Retryable { sessions, .. }
            | Self::Permanent { sessions, .. }
            | Self::Cancelled { sessions, .. } => *sessions,
        }
    }

    /// 远端是否已创建会话（即配额已实际消耗）
    pub fn session_created(&self) -> bool {
        self.sessions() > 0
    }

    /// 预留之外额外消耗的会话数
    pub fn extra_sessions(&self) -> u32 {
        self.sessions().saturating_sub(1)
    }
}
