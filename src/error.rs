//! 错误类型
//!
//! `RemoteError` 描述一次远端调用的失败，`UploadError` 是单个文件上传结果中
//! 记录的错误分类，决定账本状态与编排器的后续动作。

use thiserror::Error;

/// 远端错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器 5xx（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 凭证过期或无效
    Unauthorized,
    /// 远端配额耗尽
    QuotaExceeded,
    /// 资源不存在（上传会话过期时出现）
    NotFound,
    /// 请求被拒绝（参数错误、权限不足、策略违规）
    Rejected,
}

impl RemoteErrorKind {
    /// 是否可以退避后重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RemoteErrorKind::Network
                | RemoteErrorKind::Timeout
                | RemoteErrorKind::ServerError
                | RemoteErrorKind::RateLimited
        )
    }

    /// 根据 HTTP 状态码和错误 reason 分类
    ///
    /// 403/400 需要看 reason 才能区分配额耗尽和普通拒绝。
    pub fn from_status(status: u16, reason: Option<&str>) -> Self {
        let reason = reason.unwrap_or_default();
        match status {
            401 => RemoteErrorKind::Unauthorized,
            403 | 400
                if matches!(
                    reason,
                    "quotaExceeded" | "uploadLimitExceeded" | "dailyLimitExceeded"
                ) =>
            {
                RemoteErrorKind::QuotaExceeded
            }
            403 if matches!(reason, "rateLimitExceeded" | "userRateLimitExceeded") => {
                RemoteErrorKind::RateLimited
            }
            429 => RemoteErrorKind::RateLimited,
            408 => RemoteErrorKind::Timeout,
            404 => RemoteErrorKind::NotFound,
            500 | 502 | 503 | 504 => RemoteErrorKind::ServerError,
            _ => RemoteErrorKind::Rejected,
        }
    }
}

/// 一次远端调用的失败
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            RemoteErrorKind::Timeout
        } else if let Some(status) = e.status() {
            RemoteErrorKind::from_status(status.as_u16(), None)
        } else if e.is_decode() {
            RemoteErrorKind::Rejected
        } else {
            RemoteErrorKind::Network
        };
        RemoteError::new(kind, e.to_string())
    }
}

/// 单个文件上传失败的分类
///
/// `Display` 文本会写入账本的 `error_message`，供 retry 的错误过滤使用。
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// 网络瞬时错误，重试次数用尽后进入 failed_retryable
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// 远端永久拒绝
    #[error("rejected by remote: {0}")]
    RemoteRejected(String),
    /// 凭证刷新失败或刷新后仍被拒绝
    #[error("authentication expired: {0}")]
    AuthExpired(String),
    /// 每日配额耗尽（本地预估或远端返回）
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    /// 本地文件不可读或已移动
    #[error("local io error: {0}")]
    LocalIo(String),
    /// 账本认领冲突
    #[error("ledger conflict: {0}")]
    LedgerConflict(String),
    /// 运行被取消
    #[error("cancelled")]
    Cancelled,
}

impl UploadError {
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, UploadError::QuotaExhausted(_))
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::LocalIo(e.to_string())
    }
}

impl From<RemoteError> for UploadError {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            RemoteErrorKind::Network
            | RemoteErrorKind::Timeout
            | RemoteErrorKind::ServerError
            | RemoteErrorKind::RateLimited
            | RemoteErrorKind::NotFound => UploadError::TransientNetwork(e.message),
            RemoteErrorKind::Unauthorized => UploadError::AuthExpired(e.message),
            RemoteErrorKind::QuotaExceeded => UploadError::QuotaExhausted(e.message),
            RemoteErrorKind::Rejected => UploadError::RemoteRejected(e.message),
        }
    }
}
