// Tube Uploader Library
// 视频批量上传核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志
pub mod logging;

// 元数据生成
pub mod metadata;

// 上传历史与配额存储
pub mod persistence;

// 每日配额
pub mod quota;

// 远端能力接口
pub mod remote;

// 对账
pub mod sync;

// 上传引擎模块
pub mod uploader;

// YouTube 实现
pub mod youtube;

// 命令层
pub mod commands;

#[cfg(test)]
pub(crate) mod testing;

// 导出常用类型
pub use config::AppConfig;
pub use error::{RemoteError, RemoteErrorKind, UploadError};
pub use persistence::{HistoryLedger, HistoryRecord, UploadStatus};
pub use quota::QuotaArbiter;
pub use sync::SyncReconciler;
pub use uploader::{ContentHasher, RunOptions, RunReport, TransferEngine, UploadOrchestrator};
