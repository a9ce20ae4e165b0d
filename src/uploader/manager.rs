//! 上传编排器
//!
//! 固定数量的 worker 从共享队列中取文件，每个文件在一个 worker 内完成：
//! 哈希去重 → 认领账本记录 → 预留配额 → 生成元数据 → 传输 → 写回账本 → 添加播放列表。
//!
//! 账本与配额是仅有的共享可变状态，临界区内不发生网络调用。
//! 配额耗尽后不再领取新文件，正在传输的文件继续完成。

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::UploadError;
use crate::metadata::MetadataProvider;
use crate::persistence::{HistoryLedger, HistoryRecord, UploadStatus};
use crate::quota::QuotaArbiter;
use crate::remote::{PlaylistAttacher, VideoMetadata};

use super::engine::TransferEngine;
use super::events::{EventSink, UploadEvent};
use super::folder::{folder_positions, FolderPosition, VideoFile};
use super::hasher::ContentHasher;
use super::task::TransferOutcome;

/// 上传成功后写入账本的尝试次数
const LEDGER_WRITE_ATTEMPTS: u32 = 3;
const LEDGER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 单次运行参数
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 并行 worker 数
    pub concurrency: usize,
    /// 只预览，不写账本、不上传、不动配额
    pub dry_run: bool,
    /// 覆盖默认播放列表（默认使用文件所在文件夹名）
    pub playlist: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            dry_run: false,
            playlist: None,
        }
    }
}

/// 单个文件的结果类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Uploaded,
    /// 远端已上传，但账本未能记为成功，需要 sync 对账
    Unrecorded,
    SkippedDuplicate,
    FailedRetryable,
    FailedPermanent,
    /// 传输中被取消，记录保持 uploading
    Cancelled,
    /// 因取消或配额耗尽未开始
    NotAttempted,
    /// dry-run 预览
    Preview,
}

/// 单个文件的结果
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub kind: OutcomeKind,
    pub file_hash: Option<String>,
    pub video_id: Option<String>,
    pub title: Option<String>,
    pub playlist: Option<String>,
    pub error: Option<String>,
    /// 播放列表添加失败，不影响上传结果
    pub playlist_error: Option<String>,
}

impl FileOutcome {
    fn new(file: &VideoFile, kind: OutcomeKind) -> Self {
        Self {
            path: file.path.clone(),
            kind,
            file_hash: None,
            video_id: None,
            title: None,
            playlist: None,
            error: None,
            playlist_error: None,
        }
    }

    fn hash(mut self, hash: &str) -> Self {
        self.file_hash = Some(hash.to_string());
        self
    }

    fn error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// 运行报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub uploaded: usize,
    pub unrecorded: usize,
    pub skipped_duplicate: usize,
    pub failed_retryable: usize,
    pub failed_permanent: usize,
    pub cancelled: usize,
    pub not_attempted: usize,
    pub previewed: usize,
    pub elapsed: Duration,
    /// 停止接收新文件的原因
    pub halted: Option<String>,
    /// 与输入顺序一致
    pub outcomes: Vec<FileOutcome>,
}

impl RunReport {
    fn tally(run_id: String, outcomes: Vec<FileOutcome>, elapsed: Duration, halted: Option<String>) -> Self {
        let mut report = RunReport {
            run_id,
            elapsed,
            halted,
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome.kind {
                OutcomeKind::Uploaded => report.uploaded += 1,
                OutcomeKind::Unrecorded => report.unrecorded += 1,
                OutcomeKind::SkippedDuplicate => report.skipped_duplicate += 1,
                OutcomeKind::FailedRetryable => report.failed_retryable += 1,
                OutcomeKind::FailedPermanent => report.failed_permanent += 1,
                OutcomeKind::Cancelled => report.cancelled += 1,
                OutcomeKind::NotAttempted => report.not_attempted += 1,
                OutcomeKind::Preview => report.previewed += 1,
            }
        }
        report.outcomes = outcomes;
        report
    }

    /// 合并分组运行的结果
    pub fn absorb(&mut self, other: RunReport) {
        self.uploaded += other.uploaded;
        self.unrecorded += other.unrecorded;
        self.skipped_duplicate += other.skipped_duplicate;
        self.failed_retryable += other.failed_retryable;
        self.failed_permanent += other.failed_permanent;
        self.cancelled += other.cancelled;
        self.not_attempted += other.not_attempted;
        self.previewed += other.previewed;
        self.elapsed += other.elapsed;
        if self.halted.is_none() {
            self.halted = other.halted;
        }
        self.outcomes.extend(other.outcomes);
    }

    /// 把未运行的文件计为未开始
    pub fn add_not_attempted(&mut self, files: &[VideoFile]) {
        for file in files {
            self.not_attempted += 1;
            self.outcomes.push(FileOutcome::new(file, OutcomeKind::NotAttempted));
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| {
            matches!(
                o.kind,
                OutcomeKind::FailedRetryable | OutcomeKind::FailedPermanent | OutcomeKind::Unrecorded
            )
        })
    }
}

/// 认领结果
enum Claim {
    /// 本 worker 持有记录
    Owned(HistoryRecord),
    /// 其他写入方已将该哈希标记成功，附胜出方的记录
    Lost(HistoryRecord),
}

/// 一次运行内 worker 共享的状态
struct RunState {
    options: RunOptions,
    positions: HashMap<PathBuf, FolderPosition>,
    queue: Mutex<VecDeque<(usize, VideoFile)>>,
    /// 本次运行已领取的内容哈希
    claimed: DashMap<String, PathBuf>,
    halt_reason: Mutex<Option<String>>,
}

impl RunState {
    fn halted(&self) -> bool {
        self.halt_reason.lock().is_some()
    }

    /// 返回是否为首次停止
    fn halt(&self, reason: &str) -> bool {
        let mut guard = self.halt_reason.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason.to_string());
        true
    }
}

struct Inner {
    ledger: Arc<HistoryLedger>,
    quota: Arc<QuotaArbiter>,
    hasher: ContentHasher,
    engine: TransferEngine,
    metadata: Arc<dyn MetadataProvider>,
    playlists: Arc<dyn PlaylistAttacher>,
    cost_per_upload: u64,
    fallback_privacy: String,
    fallback_category: String,
    events: EventSink,
}

/// 上传编排器
#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
}

impl UploadOrchestrator {
    pub fn new(
        ledger: Arc<HistoryLedger>,
        quota: Arc<QuotaArbiter>,
        engine: TransferEngine,
        metadata: Arc<dyn MetadataProvider>,
        playlists: Arc<dyn PlaylistAttacher>,
        cost_per_upload: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                quota,
                hasher: ContentHasher::new(),
                engine,
                metadata,
                playlists,
                cost_per_upload,
                fallback_privacy: "private".to_string(),
                fallback_category: "22".to_string(),
                events: EventSink::none(),
            }),
        }
    }

    /// 元数据生成失败时使用的可见性与分类
    ///
    /// 必须在首次 `run` 之前调用。
    pub fn with_fallback(mut self, privacy_status: &str, category_id: &str) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.fallback_privacy = privacy_status.to_string();
            inner.fallback_category = category_id.to_string();
        }
        self
    }

    /// 必须在首次 `run` 之前调用
    pub fn with_events(mut self, events: EventSink) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.events = events;
        }
        self
    }

    /// 处理一批文件
    ///
    /// 单个文件的失败不会中止运行，全部记录在报告中。
    pub async fn run(
        &self,
        files: Vec<VideoFile>,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let concurrency = options.concurrency.max(1);
        let total = files.len();

        info!(
            "开始上传运行: run={}, 文件数={}, worker={}, dry_run={}",
            run_id, total, concurrency, options.dry_run
        );

        let state = Arc::new(RunState {
            positions: folder_positions(&files),
            queue: Mutex::new(files.into_iter().enumerate().collect()),
            claimed: DashMap::new(),
            halt_reason: Mutex::new(None),
            options,
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency.min(total.max(1)) {
            let inner = self.inner.clone();
            let state = state.clone();
            let cancel = cancel.clone();
            let span = info_span!("worker", run = %run_id, id = worker_id);
            workers.spawn(async move { inner.worker_loop(&state, &cancel).await }.instrument(span));
        }

        let mut outcomes: Vec<(usize, FileOutcome)> = Vec::with_capacity(total);
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(done) => outcomes.extend(done),
                Err(e) => error!("worker 异常退出: {}", e),
            }
        }

        // 未被领取的文件
        for (index, file) in state.queue.lock().drain(..) {
            outcomes.push((index, FileOutcome::new(&file, OutcomeKind::NotAttempted)));
        }
        outcomes.sort_by_key(|(index, _)| *index);

        let halted = state.halt_reason.lock().clone();
        let report = RunReport::tally(
            run_id,
            outcomes.into_iter().map(|(_, o)| o).collect(),
            started.elapsed(),
            halted,
        );
        info!(
            "上传运行结束: 成功 {}, 跳过 {}, 可重试失败 {}, 永久失败 {}, 取消 {}, 未开始 {}, 耗时 {:.1}s",
            report.uploaded,
            report.skipped_duplicate,
            report.failed_retryable,
            report.failed_permanent,
            report.cancelled,
            report.not_attempted,
            report.elapsed.as_secs_f64()
        );
        report
    }
}

impl Inner {
    async fn worker_loop(&self, state: &RunState, cancel: &CancellationToken) -> Vec<(usize, FileOutcome)> {
        let mut done = Vec::new();
        loop {
            if cancel.is_cancelled() || state.halted() {
                break;
            }
            let Some((index, file)) = state.queue.lock().pop_front() else {
                break;
            };

            self.events.emit(UploadEvent::FileStarted {
                path: file.path.clone(),
            });
            let outcome = self.process_file(&file, state, cancel).await;
            self.events.emit(UploadEvent::FileFinished {
                outcome: outcome.clone(),
            });
            done.push((index, outcome));
        }
        done
    }

    async fn process_file(&self, file: &VideoFile, state: &RunState, cancel: &CancellationToken) -> FileOutcome {
        // 1. 哈希与去重
        let hash = match self.hasher.hash_file(&file.path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("无法计算哈希，跳过: {:?}, {}", file.path, e);
                return FileOutcome::new(file, OutcomeKind::FailedPermanent).error(e);
            }
        };

        if let Some(first) = state.claimed.insert(hash.clone(), file.path.clone()) {
            info!("本次运行中内容重复: {:?} 与 {:?}", file.path, first);
            return FileOutcome::new(file, OutcomeKind::SkippedDuplicate)
                .hash(&hash)
                .error(format!("same content as {}", first.display()));
        }

        match self.ledger.find_by_hash(&hash) {
            Ok(Some(record)) if record.status == UploadStatus::Success => {
                info!("已上传过，跳过: {:?} -> {:?}", file.path, record.remote_video_id);
                let mut outcome = FileOutcome::new(file, OutcomeKind::SkippedDuplicate).hash(&hash);
                outcome.video_id = record.remote_video_id;
                return outcome;
            }
            Ok(_) => {}
            Err(e) => {
                error!("查询上传历史失败: {:?}, {:#}", file.path, e);
                return FileOutcome::new(file, OutcomeKind::FailedRetryable)
                    .hash(&hash)
                    .error(format!("ledger read failed: {:#}", e));
            }
        }

        let position = state.positions.get(&file.path).copied().unwrap_or_default();
        let playlist = state.options.playlist.clone().or_else(|| file.folder_name());

        if state.options.dry_run {
            let metadata = self.build_metadata(file, position);
            let mut outcome = FileOutcome::new(file, OutcomeKind::Preview).hash(&hash);
            outcome.title = Some(metadata.title);
            outcome.playlist = playlist;
            return outcome;
        }

        // 2. 认领记录
        let record = match self.claim(&hash, file) {
            Ok(Claim::Owned(record)) => record,
            Ok(Claim::Lost(winner)) => {
                info!("记录已被标记成功，跳过: {:?}", file.path);
                let mut outcome = FileOutcome::new(file, OutcomeKind::SkippedDuplicate).hash(&hash);
                outcome.video_id = winner.remote_video_id;
                return outcome;
            }
            Err(e) => {
                error!("写入上传历史失败: {:?}, {:#}", file.path, e);
                return FileOutcome::new(file, OutcomeKind::FailedRetryable)
                    .hash(&hash)
                    .error(format!("ledger write failed: {:#}", e));
            }
        };

        // 3. 配额
        match self.quota.reserve(self.cost_per_upload) {
            Ok(true) => {}
            Ok(false) => {
                let usage = self.quota.current_usage().ok();
                let error = UploadError::QuotaExhausted(match usage {
                    Some(u) => format!("daily budget {}/{} units used on {}", u.consumed, u.limit, u.date),
                    None => "daily budget used up".to_string(),
                });
                self.record_failure(&record, true, &error);
                self.halt(state, &error.to_string());
                return FileOutcome::new(file, OutcomeKind::FailedRetryable)
                    .hash(&hash)
                    .error(error);
            }
            Err(e) => {
                let error = format!("quota store failed: {:#}", e);
                error!("{}", error);
                self.record_failure_message(&record, true, &error);
                return FileOutcome::new(file, OutcomeKind::FailedRetryable)
                    .hash(&hash)
                    .error(error);
            }
        }

        // 4. 元数据
        let metadata = self.build_metadata(file, position);

        // 5. 传输
        let outcome = self.engine.transfer(file, &metadata, cancel).await;
        if !outcome.session_created() {
            self.release_quota();
        }
        let extra = outcome.extra_sessions();
        if extra > 0 {
            // 会话重建在远端重复计费
            if let Err(e) = self.quota.charge(self.cost_per_upload * u64::from(extra)) {
                warn!("记入额外配额消耗失败: {:#}", e);
            }
        }

        let mut result = match outcome {
            TransferOutcome::Completed { video_id, .. } => {
                let mut out = match self.record_success(&record, &video_id, playlist.as_deref()).await {
                    Ok(()) => FileOutcome::new(file, OutcomeKind::Uploaded).hash(&hash),
                    Err(e) => {
                        error!("上传成功但写入历史失败: {:?} -> {}, {:#}", file.path, video_id, e);
                        FileOutcome::new(file, OutcomeKind::Unrecorded)
                            .hash(&hash)
                            .error(format!(
                                "uploaded as {} but ledger write failed, run sync to reconcile: {:#}",
                                video_id, e
                            ))
                    }
                };
                if let Some(name) = &playlist {
                    if let Err(e) = self.playlists.attach(name, &video_id).await {
                        warn!("添加到播放列表失败: {} -> {}, {}", video_id, name, e);
                        out.playlist_error = Some(e.to_string());
                    }
                }
                out.video_id = Some(video_id);
                out
            }
            TransferOutcome::Retryable { error, .. } => {
                if error.is_quota_exhausted() {
                    if let Err(e) = self.quota.exhaust() {
                        warn!("更新配额状态失败: {:#}", e);
                    }
                    self.halt(state, &error.to_string());
                }
                self.record_failure(&record, true, &error);
                FileOutcome::new(file, OutcomeKind::FailedRetryable)
                    .hash(&hash)
                    .error(error)
            }
            TransferOutcome::Permanent { error, .. } => {
                self.record_failure(&record, false, &error);
                FileOutcome::new(file, OutcomeKind::FailedPermanent)
                    .hash(&hash)
                    .error(error)
            }
            TransferOutcome::Cancelled { offset, .. } => {
                // 记录保持 uploading，下次 retry 会重新领取
                info!("已取消，记录保留为 uploading: {:?} ({} bytes 已确认)", file.path, offset);
                FileOutcome::new(file, OutcomeKind::Cancelled)
                    .hash(&hash)
                    .error(UploadError::Cancelled)
            }
        };
        result.title = Some(metadata.title);
        result.playlist = playlist;
        result
    }

    /// 获取或创建记录并标记为 uploading
    fn claim(&self, hash: &str, file: &VideoFile) -> anyhow::Result<Claim> {
        let path_str = file.path.to_string_lossy();
        let record = self.ledger.upsert_attempt(hash, &path_str, file.size)?;
        if self.ledger.mark_uploading(&record)? {
            return Ok(Claim::Owned(record));
        }

        let conflict = UploadError::LedgerConflict(format!("{} already marked success", hash));
        debug!("{}，读取胜出方记录", conflict);
        let winner = self.ledger.find_by_hash(hash)?.unwrap_or(record);
        Ok(Claim::Lost(winner))
    }

    /// 写入成功状态，失败时有限次重试
    async fn record_success(
        &self,
        record: &HistoryRecord,
        video_id: &str,
        playlist: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.ledger.mark_success(record, video_id, playlist) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < LEDGER_WRITE_ATTEMPTS => {
                    warn!(
                        "写入成功状态失败，稍后重试 ({}/{}): {}, {:#}",
                        attempt, LEDGER_WRITE_ATTEMPTS, record.file_path, e
                    );
                    tokio::time::sleep(LEDGER_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn build_metadata(&self, file: &VideoFile, position: FolderPosition) -> VideoMetadata {
        match self.metadata.generate(file, position) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("生成元数据失败，使用默认值: {:?}, {:#}", file.path, e);
                VideoMetadata::fallback(file, &self.fallback_privacy, &self.fallback_category)
            }
        }
    }

    fn record_failure(&self, record: &HistoryRecord, retryable: bool, error: &UploadError) {
        self.record_failure_message(record, retryable, &error.to_string());
    }

    fn record_failure_message(&self, record: &HistoryRecord, retryable: bool, message: &str) {
        if let Err(e) = self.ledger.mark_failed(record, retryable, message) {
            error!("写入失败状态失败: {}, {:#}", record.file_path, e);
        }
    }

    fn release_quota(&self) {
        if let Err(e) = self.quota.release(self.cost_per_upload) {
            warn!("归还配额失败: {:#}", e);
        }
    }

    fn halt(&self, state: &RunState, reason: &str) {
        if state.halt(reason) {
            warn!("停止领取新文件: {}", reason);
            self.events.emit(UploadEvent::Halted {
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteError, RemoteErrorKind};
    use crate::metadata::DefaultMetadataProvider;
    use crate::remote::{SessionStatus, UploadSession, VideoUploadApi};
    use crate::testing::PutFailure;
    use async_trait::async_trait;
    use crate::testing::{
        FailingMetadata, FakeCredentials, FakePlaylists, FakeUploadApi, InstantSleeper,
    };
    use crate::uploader::engine::TransferSettings;
    use crate::uploader::retry::RetryPolicy;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        ledger: Arc<HistoryLedger>,
        quota: Arc<QuotaArbiter>,
        api: Arc<FakeUploadApi>,
        playlists: Arc<FakePlaylists>,
        metadata: Arc<dyn MetadataProvider>,
    }

    impl Harness {
        fn new(daily_limit: u64) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                ledger: Arc::new(HistoryLedger::open_in_memory().unwrap()),
                quota: Arc::new(QuotaArbiter::in_memory(daily_limit).unwrap()),
                api: Arc::new(FakeUploadApi::new()),
                playlists: Arc::new(FakePlaylists::default()),
                metadata: Arc::new(DefaultMetadataProvider::new("private", "22")),
            }
        }

        fn file(&self, rel: &str, content: &[u8]) -> VideoFile {
            let path = self.dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            VideoFile::from_path(&path).unwrap()
        }

        fn orchestrator(&self) -> UploadOrchestrator {
            self.orchestrator_with(self.api.clone())
        }

        fn orchestrator_with(&self, api: Arc<dyn VideoUploadApi>) -> UploadOrchestrator {
            let engine = TransferEngine::new(
                api,
                Arc::new(FakeCredentials::default()),
                RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                    rate_limit_delay: Duration::from_millis(50),
                },
                TransferSettings {
                    chunk_size: 8,
                    request_timeout: Duration::from_secs(5),
                },
            )
            .with_sleeper(Arc::new(InstantSleeper::default()));

            UploadOrchestrator::new(
                self.ledger.clone(),
                self.quota.clone(),
                engine,
                self.metadata.clone(),
                self.playlists.clone(),
                1_600,
            )
        }

        async fn run(&self, files: Vec<VideoFile>, concurrency: usize) -> RunReport {
            self.orchestrator()
                .run(
                    files,
                    RunOptions {
                        concurrency,
                        ..Default::default()
                    },
                    &CancellationToken::new(),
                )
                .await
        }

        fn success_count(&self) -> usize {
            self.ledger
                .export()
                .unwrap()
                .iter()
                .filter(|r| r.status == UploadStatus::Success)
                .count()
        }
    }

    /// 上传完成时删除账本记录，使成功状态无法写入
    struct RowDroppingApi {
        inner: FakeUploadApi,
        ledger: Arc<HistoryLedger>,
        hash: String,
    }

    #[async_trait]
    impl VideoUploadApi for RowDroppingApi {
        async fn create_session(
            &self,
            metadata: &VideoMetadata,
            total_size: u64,
        ) -> Result<UploadSession, RemoteError> {
            self.inner.create_session(metadata, total_size).await
        }

        async fn query_offset(&self, session: &UploadSession) -> Result<SessionStatus, RemoteError> {
            self.inner.query_offset(session).await
        }

        async fn put_chunk(
            &self,
            session: &UploadSession,
            offset: u64,
            data: Vec<u8>,
        ) -> Result<SessionStatus, RemoteError> {
            let status = self.inner.put_chunk(session, offset, data).await?;
            if matches!(status, SessionStatus::Complete { .. }) {
                self.ledger.delete_by_hash(&self.hash).unwrap();
            }
            Ok(status)
        }
    }

    #[tokio::test]
    async fn test_unrecorded_success_is_reported_with_video_id() {
        let h = Harness::new(10_000);
        let file = h.file("u/clip.mp4", b"uploaded-but-lost");
        let hash = ContentHasher::new().hash_file(&file.path).await.unwrap();
        let api = Arc::new(RowDroppingApi {
            inner: FakeUploadApi::new(),
            ledger: h.ledger.clone(),
            hash,
        });

        let report = h
            .orchestrator_with(api.clone())
            .run(vec![file], RunOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(report.uploaded, 0);
        assert_eq!(report.unrecorded, 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.kind, OutcomeKind::Unrecorded);
        assert_eq!(outcome.video_id.as_deref(), Some("vid-s1"));
        assert!(outcome.error.as_deref().unwrap().contains("ledger write failed"));
        assert_eq!(report.failures().count(), 1);
        assert_eq!(api.inner.completed_uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_lost_to_success_returns_winner() {
        let h = Harness::new(10_000);
        let file = h.file("c/clip.mp4", b"claimed-elsewhere");
        let hash = ContentHasher::new().hash_file(&file.path).await.unwrap();
        let record = h.ledger.upsert_attempt(&hash, "/other/clip.mp4", 17).unwrap();
        h.ledger.mark_success(&record, "vid-winner", None).unwrap();

        let orchestrator = h.orchestrator();
        match orchestrator.inner.claim(&hash, &file).unwrap() {
            Claim::Lost(winner) => {
                assert_eq!(winner.remote_video_id.as_deref(), Some("vid-winner"));
                assert_eq!(winner.status, UploadStatus::Success);
            }
            Claim::Owned(_) => panic!("success record must not be claimed"),
        }
    }

    #[tokio::test]
    async fn test_session_restart_charges_quota_again() {
        let h = Harness::new(10_000);
        h.api.script_puts([None, Some(PutFailure::expire_session())]);
        let report = h.run(vec![h.file("e/long.mp4", b"sixteen-bytes-xx")], 1).await;

        assert_eq!(report.uploaded, 1);
        assert_eq!(h.api.create_calls(), 2);
        assert_eq!(h.quota.current_usage().unwrap().consumed, 3_200);
    }

    #[tokio::test]
    async fn test_skips_already_uploaded_hash() {
        let h = Harness::new(10_000);
        let a = h.file("trip/a.mp4", b"aaaaaaaaaaaa");
        let b = h.file("trip/b.mp4", b"bbbbbbbbbbbb");
        let c = h.file("trip/c.mp4", b"cccccccccccc");

        // b 已在历史中成功
        let b_hash = ContentHasher::new().hash_file(&b.path).await.unwrap();
        let rec = h.ledger.upsert_attempt(&b_hash, "/old/b.mp4", 12).unwrap();
        h.ledger.mark_success(&rec, "vid-b", None).unwrap();

        let report = h.run(vec![a, b, c], 2).await;

        assert_eq!(report.uploaded, 2);
        assert_eq!(report.skipped_duplicate, 1);
        assert_eq!(report.outcomes[1].kind, OutcomeKind::SkippedDuplicate);
        assert_eq!(h.success_count(), 3);
        assert_eq!(h.ledger.export().unwrap().len(), 3);
        assert_eq!(h.api.completed_uploads().len(), 2);
    }

    #[tokio::test]
    async fn test_identical_bytes_in_one_run_upload_once() {
        let h = Harness::new(10_000);
        let one = h.file("x/one.mp4", b"same-bytes-here");
        let two = h.file("y/two.mp4", b"same-bytes-here");

        let report = h.run(vec![one, two], 2).await;
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.skipped_duplicate, 1);
        assert_eq!(h.api.completed_uploads().len(), 1);
        assert_eq!(h.success_count(), 1);

        // 再次运行全部跳过
        let again = h
            .run(
                vec![
                    VideoFile::from_path(&h.dir.path().join("x/one.mp4")).unwrap(),
                    VideoFile::from_path(&h.dir.path().join("y/two.mp4")).unwrap(),
                ],
                2,
            )
            .await;
        assert_eq!(again.skipped_duplicate, 2);
        assert_eq!(h.api.completed_uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_quota_denial_marks_retryable_and_halts() {
        let h = Harness::new(1_600);
        let first = h.file("q/1.mp4", b"first-file");
        let second = h.file("q/2.mp4", b"second-file");
        let third = h.file("q/3.mp4", b"third-file");

        let report = h.run(vec![first, second, third], 1).await;

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed_retryable, 1);
        assert_eq!(report.not_attempted, 1);
        assert!(report.halted.is_some());

        let denied = &report.outcomes[1];
        assert_eq!(denied.kind, OutcomeKind::FailedRetryable);
        assert!(denied.error.as_deref().unwrap().contains("quota exhausted"));

        let record = h
            .ledger
            .find_by_hash(denied.file_hash.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UploadStatus::FailedRetryable);
        assert!(record.error_message.unwrap().contains("quota exhausted"));
        assert_eq!(h.quota.current_usage().unwrap().consumed, 1_600);
    }

    #[tokio::test]
    async fn test_remote_quota_error_releases_and_exhausts() {
        let h = Harness::new(10_000);
        h.api.fail_creates(1, RemoteErrorKind::QuotaExceeded);
        let files = vec![h.file("r/1.mp4", b"one"), h.file("r/2.mp4", b"two")];

        let report = h.run(files, 1).await;
        assert_eq!(report.failed_retryable, 1);
        assert_eq!(report.not_attempted, 1);
        assert!(report.halted.as_deref().unwrap().contains("quota"));
        assert_eq!(h.quota.current_usage().unwrap().remaining(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_releases_quota() {
        let h = Harness::new(10_000);
        h.api.fail_creates(1, RemoteErrorKind::Rejected);
        let report = h.run(vec![h.file("p/1.mp4", b"bad")], 1).await;

        assert_eq!(report.failed_permanent, 1);
        assert_eq!(h.quota.current_usage().unwrap().consumed, 0);
        let record = &h.ledger.export().unwrap()[0];
        assert_eq!(record.status, UploadStatus::FailedPermanent);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_reupload_after_permanent_failure_preserves_retry_count() {
        let h = Harness::new(10_000);
        let file = h.file("p/clip.mp4", b"clip-bytes");
        h.api.fail_creates(1, RemoteErrorKind::Rejected);
        h.run(vec![file.clone()], 1).await;

        let record = h.ledger.find_by_path(&file.path.to_string_lossy()).unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::FailedPermanent);
        h.ledger.clear_for_reupload(&record).unwrap();

        let report = h.run(vec![file], 1).await;
        assert_eq!(report.uploaded, 1);

        let records = h.ledger.export().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, UploadStatus::Success);
        assert_eq!(records[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let h = Harness::new(10_000);
        let files = vec![h.file("d/1.mp4", b"one"), h.file("d/2.mp4", b"two")];

        let report = h
            .orchestrator()
            .run(
                files,
                RunOptions {
                    concurrency: 2,
                    dry_run: true,
                    playlist: Some("Preview".into()),
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.previewed, 2);
        assert_eq!(report.outcomes[0].title.as_deref(), Some("1 (1/2)"));
        assert_eq!(report.outcomes[0].playlist.as_deref(), Some("Preview"));
        assert!(h.ledger.export().unwrap().is_empty());
        assert_eq!(h.quota.current_usage().unwrap().consumed, 0);
        assert_eq!(h.api.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_playlist_failure_keeps_success() {
        let h = Harness::new(10_000);
        h.playlists.fail_all();
        let report = h.run(vec![h.file("Holiday/a.mp4", b"holiday")], 1).await;

        assert_eq!(report.uploaded, 1);
        let outcome = &report.outcomes[0];
        assert!(outcome.playlist_error.is_some());
        let record = &h.ledger.export().unwrap()[0];
        assert_eq!(record.status, UploadStatus::Success);
        assert_eq!(record.playlist_name.as_deref(), Some("Holiday"));
    }

    #[tokio::test]
    async fn test_attaches_to_folder_playlist() {
        let h = Harness::new(10_000);
        let report = h.run(vec![h.file("Summer/a.mp4", b"summer")], 1).await;

        let video_id = report.outcomes[0].video_id.clone().unwrap();
        assert_eq!(h.playlists.attached(), vec![("Summer".to_string(), video_id)]);
    }

    #[tokio::test]
    async fn test_metadata_failure_degrades_to_defaults() {
        let mut h = Harness::new(10_000);
        h.metadata = Arc::new(FailingMetadata);
        let report = h.run(vec![h.file("m/raw_clip.mp4", b"raw")], 1).await;

        assert_eq!(report.uploaded, 1);
        assert_eq!(h.api.created_titles(), vec!["raw_clip".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_leaves_uploading() {
        let h = Harness::new(10_000);
        let cancel = CancellationToken::new();
        h.api.cancel_on_put(cancel.clone());
        let files = vec![
            h.file("c/long.mp4", b"0123456789abcdefghij"),
            h.file("c/next.mp4", b"never-started"),
        ];

        let report = h
            .orchestrator()
            .run(files, RunOptions::default(), &cancel)
            .await;

        assert_eq!(report.cancelled, 1);
        assert_eq!(report.not_attempted, 1);
        let records = h.ledger.export().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, UploadStatus::Uploading);

        let failed = h.ledger.query_failed(&Default::default()).unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_file_does_not_abort_run() {
        let h = Harness::new(10_000);
        let gone = h.file("u/gone.mp4", b"gone");
        let ok = h.file("u/ok.mp4", b"fine");
        std::fs::remove_file(&gone.path).unwrap();

        let report = h.run(vec![gone, ok], 2).await;
        assert_eq!(report.failed_permanent, 1);
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failures().count(), 1);
    }
}
