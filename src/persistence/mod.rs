//! 持久化模块
//!
//! - `history_db`: 上传历史账本（去重、断点重试、导入导出）
//! - `quota_db`: 每日配额状态
//!
//! 两者共用同一个 SQLite 文件，各自持有连接。

pub mod history_db;
pub mod quota_db;
pub mod types;

pub use history_db::HistoryLedger;
pub use quota_db::SqliteQuotaStore;
pub use types::{FailedQuery, HistoryRecord, HistoryStats, ImportSummary, UploadStatus};
