// 上传模块
//
// - 文件扫描与内容哈希
// - 可续传分片传输与退避重试
// - 多 worker 上传编排

pub mod chunk;
pub mod engine;
pub mod events;
pub mod folder;
pub mod hasher;
pub mod manager;
pub mod retry;
pub mod task;

pub use engine::{TransferEngine, TransferSettings};
pub use events::{EventSink, ProgressThrottler, UploadEvent};
pub use folder::{folder_positions, is_video, FolderPosition, ScanOptions, VideoFile, VideoScanner};
pub use hasher::ContentHasher;
pub use manager::{FileOutcome, OutcomeKind, RunOptions, RunReport, UploadOrchestrator};
pub use retry::{NextAction, RetryPolicy, Sleeper, TokioSleeper};
pub use task::{TransferJob, TransferOutcome, TransferState};
