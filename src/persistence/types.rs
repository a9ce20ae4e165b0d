//! 上传历史数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 上传记录状态
///
/// 使用 snake_case 序列化，与数据库中存储的字符串一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 已创建，尚未开始传输
    Pending,
    /// 某个 worker 已认领并正在传输
    Uploading,
    /// 已成功上传，`remote_video_id` 有值
    Success,
    /// 失败，可通过 retry 重新尝试
    FailedRetryable,
    /// 失败，需要人工处理后 reupload
    FailedPermanent,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Success => "success",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedPermanent => "failed_permanent",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "uploading" => Self::Uploading,
            "success" => Self::Success,
            "failed_retryable" => Self::FailedRetryable,
            "failed_permanent" => Self::FailedPermanent,
            other => anyhow::bail!("未知的上传状态: {}", other),
        })
    }
}

/// 一条上传历史记录，每个内容哈希最多一条
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// 数据库行 ID（导入时忽略）
    #[serde(default)]
    pub id: i64,
    pub file_hash: String,
    /// 最近一次见到该内容的本地路径
    pub file_path: String,
    #[serde(default)]
    pub file_size: u64,
    pub remote_video_id: Option<String>,
    pub status: UploadStatus,
    pub playlist_name: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 失败记录查询条件，各条件之间为"与"关系
#[derive(Debug, Clone, Default)]
pub struct FailedQuery {
    pub limit: Option<usize>,
    /// 只返回该时间之后更新的记录
    pub since: Option<DateTime<Utc>>,
    /// 错误信息包含该子串（不区分大小写）
    pub error_substring: Option<String>,
}

/// 导入结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// 新插入的记录数
    pub imported: usize,
    /// 已有未成功记录被导入的成功记录覆盖的数量
    pub upgraded: usize,
    /// 因冲突跳过的记录数
    pub skipped: usize,
}

/// 各状态的记录数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub pending: usize,
    pub uploading: usize,
    pub success: usize,
    pub failed_retryable: usize,
    pub failed_permanent: usize,
    /// 成功记录的总字节数
    pub uploaded_bytes: u64,
}

impl HistoryStats {
    pub fn total(&self) -> usize {
        self.pending + self.uploading + self.success + self.failed_retryable + self.failed_permanent
    }
}
