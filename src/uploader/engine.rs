//! 可续传分片上传引擎
//!
//! 负责把单个文件传完，对编排器屏蔽重试细节：
//! - 创建会话后按分片顺序上传，偏移只由远端确认值推进
//! - 瞬时错误退避后先向远端查询已确认偏移，再从该偏移继续
//! - 401 只刷新一次凭证；配额耗尽和永久拒绝立即结束
//! - 每个分片边界和退避期间检查取消
//!
//! 引擎不接触账本，只返回 [`TransferOutcome`]。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RemoteError, RemoteErrorKind, UploadError};
use crate::remote::{CredentialProvider, SessionStatus, UploadSession, VideoMetadata, VideoUploadApi};

use super::chunk::{next_chunk_range, read_chunk};
use super::events::{EventSink, ProgressThrottler, UploadEvent};
use super::folder::VideoFile;
use super::retry::{NextAction, RetryPolicy, Sleeper, TokioSleeper};
use super::task::{TransferJob, TransferOutcome};

/// 传输参数
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 单次网络请求超时
    pub request_timeout: Duration,
}

/// 单步执行失败
enum StepError {
    Remote(RemoteError),
    Local(UploadError),
}

impl From<RemoteError> for StepError {
    fn from(e: RemoteError) -> Self {
        StepError::Remote(e)
    }
}

/// 一次传输的可变状态
struct Progress<'a> {
    job: TransferJob,
    session: Option<UploadSession>,
    /// 已创建的会话数
    sessions: u32,
    /// 下一步需要先查询远端偏移
    needs_resync: bool,
    file: &'a VideoFile,
}

/// 上传引擎
pub struct TransferEngine {
    api: Arc<dyn VideoUploadApi>,
    credentials: Arc<dyn CredentialProvider>,
    policy: RetryPolicy,
    settings: TransferSettings,
    sleeper: Arc<dyn Sleeper>,
    events: EventSink,
}

impl TransferEngine {
    pub fn new(
        api: Arc<dyn VideoUploadApi>,
        credentials: Arc<dyn CredentialProvider>,
        policy: RetryPolicy,
        settings: TransferSettings,
    ) -> Self {
        Self {
            api,
            credentials,
            policy,
            settings,
            sleeper: Arc::new(TokioSleeper),
            events: EventSink::none(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// 上传一个文件直到完成、失败或取消
    pub async fn transfer(
        &self,
        file: &VideoFile,
        metadata: &VideoMetadata,
        cancel: &CancellationToken,
    ) -> TransferOutcome {
        let mut p = Progress {
            job: TransferJob::new(file.size),
            session: None,
            sessions: 0,
            needs_resync: false,
            file,
        };
        let mut auth_refreshed = false;
        let mut last_delay = Duration::ZERO;
        let mut throttler = ProgressThrottler::default();

        info!("开始传输: {:?} ({} bytes)", file.path, file.size);

        loop {
            // 分片边界
            if cancel.is_cancelled() {
                info!("传输已取消: {:?}, 已确认 {} bytes", file.path, p.job.offset);
                return TransferOutcome::Cancelled {
                    offset: p.job.offset,
                    sessions: p.sessions,
                };
            }

            let err = match self.step(&mut p, metadata).await {
                Ok(Some(video_id)) => {
                    p.job.mark_completed(&video_id);
                    throttler.force_emit();
                    self.emit_progress(&p);
                    info!("✓ 传输完成: {:?} -> {}", file.path, video_id);
                    return TransferOutcome::Completed {
                        video_id,
                        sessions: p.sessions,
                    };
                }
                Ok(None) => {
                    if throttler.should_emit() {
                        self.emit_progress(&p);
                    }
                    continue;
                }
                Err(StepError::Local(e)) => {
                    error!("读取本地文件失败: {:?}, {}", file.path, e);
                    p.job.mark_rejected(&e.to_string());
                    return TransferOutcome::Permanent {
                        error: e,
                        sessions: p.sessions,
                    };
                }
                Err(StepError::Remote(e)) => e,
            };

            match err.kind {
                RemoteErrorKind::Unauthorized => {
                    if auth_refreshed {
                        error!("刷新凭证后仍被拒绝: {:?}", file.path);
                        return self.permanent(&mut p, UploadError::AuthExpired(err.message));
                    }
                    auth_refreshed = true;
                    warn!("凭证过期，尝试刷新: {:?}", file.path);
                    if let Err(e) = self.credentials.refresh().await {
                        return self.permanent(
                            &mut p,
                            UploadError::AuthExpired(format!("credential refresh failed: {:#}", e)),
                        );
                    }
                    p.needs_resync = p.session.is_some();
                    continue;
                }
                RemoteErrorKind::QuotaExceeded => {
                    warn!("远端配额耗尽: {:?}, {}", file.path, err.message);
                    p.job.mark_rejected(&err.message);
                    return TransferOutcome::Retryable {
                        error: UploadError::QuotaExhausted(err.message),
                        sessions: p.sessions,
                    };
                }
                RemoteErrorKind::Rejected => {
                    error!("远端拒绝上传: {:?}, {}", file.path, err.message);
                    return self.permanent(&mut p, UploadError::RemoteRejected(err.message));
                }
                RemoteErrorKind::NotFound if p.session.is_none() => {
                    return self.permanent(&mut p, UploadError::RemoteRejected(err.message));
                }
                RemoteErrorKind::NotFound => {
                    // 会话过期，只能重新创建
                    warn!("上传会话已失效，将从头开始: {:?}", file.path);
                    p.session = None;
                    p.job.mark_restart();
                }
                _ => {}
            }

            // 瞬时错误：退避后恢复
            p.job.mark_interrupted(&err.message);
            let action = self.policy.next_action(
                p.job.attempt_count,
                last_delay,
                err.kind,
                self.policy.random_jitter(),
            );
            match action {
                NextAction::GiveUp => {
                    warn!(
                        "重试次数用尽: {:?}, 共 {} 次, 最后错误: {}",
                        file.path, p.job.attempt_count, err.message
                    );
                    return TransferOutcome::Retryable {
                        error: UploadError::TransientNetwork(format!(
                            "{} (after {} attempts)",
                            err.message, p.job.attempt_count
                        )),
                        sessions: p.sessions,
                    };
                }
                NextAction::RetryAfter(delay) => {
                    last_delay = delay;
                    warn!(
                        "传输中断，等待 {}ms 后重试 ({}/{}): {:?}, {}",
                        delay.as_millis(),
                        p.job.attempt_count,
                        self.policy.max_attempts,
                        file.path,
                        err.message
                    );
                    self.events.emit(UploadEvent::Retrying {
                        path: file.path.clone(),
                        attempt: p.job.attempt_count,
                        delay_ms: delay.as_millis() as u64,
                        error: err.message.clone(),
                    });

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("退避期间取消: {:?}", file.path);
                            return TransferOutcome::Cancelled {
                                offset: p.job.offset,
                                sessions: p.sessions,
                            };
                        }
                        _ = self.sleeper.sleep(delay) => {}
                    }
                    p.needs_resync = p.session.is_some();
                }
            }
        }
    }

    /// 推进一步：创建会话、查询偏移或上传一个分片
    ///
    /// 完成时返回视频 ID。
    async fn step(
        &self,
        p: &mut Progress<'_>,
        metadata: &VideoMetadata,
    ) -> Result<Option<String>, StepError> {
        let session = match &p.session {
            Some(session) => session.clone(),
            None => {
                let session = self
                    .timed(self.api.create_session(metadata, p.job.total_size))
                    .await?;
                debug!("上传会话已创建: {:?}", p.file.path);
                p.sessions += 1;
                p.job.mark_progress(0);
                p.session = Some(session);
                return Ok(None);
            }
        };

        // 本次 put 的起点，查询偏移时为 None
        let mut sent_from = None;
        let status = if p.needs_resync {
            let status = self.timed(self.api.query_offset(&session)).await?;
            p.needs_resync = false;
            if let SessionStatus::Incomplete { acknowledged } = &status {
                info!(
                    "从远端确认的偏移恢复: {:?}, offset={} (本地记录 {})",
                    p.file.path, acknowledged, p.job.offset
                );
            }
            status
        } else {
            let range = next_chunk_range(p.job.offset, p.job.total_size, self.settings.chunk_size);
            let data = read_chunk(&p.file.path, range.clone())
                .await
                .map_err(StepError::Local)?;
            debug!(
                "上传分片: {:?}, bytes={}-{}/{}",
                p.file.path, range.start, range.end, p.job.total_size
            );
            sent_from = Some(range.start).filter(|_| !range.is_empty());
            self.timed(self.api.put_chunk(&session, range.start, data))
                .await?
        };

        match status {
            SessionStatus::Complete { video_id } => Ok(Some(video_id)),
            SessionStatus::Incomplete { acknowledged } => {
                if acknowledged > p.job.total_size {
                    return Err(StepError::Remote(RemoteError::new(
                        RemoteErrorKind::Rejected,
                        format!(
                            "remote acknowledged {} bytes of a {} byte file",
                            acknowledged, p.job.total_size
                        ),
                    )));
                }
                if let Some(start) = sent_from.filter(|start| acknowledged <= *start) {
                    // 按瞬时错误处理，经过退避和重试上限
                    return Err(StepError::Remote(RemoteError::new(
                        RemoteErrorKind::ServerError,
                        format!(
                            "remote did not advance offset: sent from {}, acknowledged {}",
                            start, acknowledged
                        ),
                    )));
                }
                if acknowledged < p.job.offset {
                    warn!(
                        "远端确认偏移回退: {} -> {}, 以远端为准",
                        p.job.offset, acknowledged
                    );
                }
                p.job.mark_progress(acknowledged);
                Ok(None)
            }
        }
    }

    /// 单次网络调用超时
    async fn timed<T, F>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.settings.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::new(
                RemoteErrorKind::Timeout,
                format!("request timed out after {:?}", self.settings.request_timeout),
            )),
        }
    }

    fn permanent(&self, p: &mut Progress<'_>, error: UploadError) -> TransferOutcome {
        p.job.mark_rejected(&error.to_string());
        TransferOutcome::Permanent {
            error,
            sessions: p.sessions,
        }
    }

    fn emit_progress(&self, p: &Progress<'_>) {
        self.events.emit(UploadEvent::Progress {
            path: p.file.path.clone(),
            uploaded: p.job.offset,
            total: p.job.total_size,
        });
    }
}
