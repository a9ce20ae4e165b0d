//! 测试用的远端替身

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, RemoteErrorKind};
use crate::metadata::MetadataProvider;
use crate::remote::{
    CredentialProvider, PlaylistAttacher, RemoteCatalog, RemoteVideo, SessionStatus,
    UploadSession, VideoMetadata, VideoUploadApi,
};
use crate::uploader::folder::{FolderPosition, VideoFile};
use crate::uploader::retry::Sleeper;

/// 单次 put 的故障注入
#[derive(Debug, Clone)]
pub struct PutFailure {
    kind: RemoteErrorKind,
    /// 先写入数据再报错（模拟响应丢失）
    store_first: bool,
    /// 删除会话并返回 404
    expire: bool,
}

impl PutFailure {
    pub fn before_store(kind: RemoteErrorKind) -> Self {
        Self {
            kind,
            store_first: false,
            expire: false,
        }
    }

    pub fn after_store(kind: RemoteErrorKind) -> Self {
        Self {
            kind,
            store_first: true,
            expire: false,
        }
    }

    pub fn expire_session() -> Self {
        Self {
            kind: RemoteErrorKind::NotFound,
            store_first: false,
            expire: true,
        }
    }
}

#[derive(Default)]
struct FakeState {
    sessions: HashMap<String, Vec<u8>>,
    next_session: usize,
    put_script: VecDeque<Option<PutFailure>>,
    fail_all_puts: Option<RemoteErrorKind>,
    create_failures: VecDeque<RemoteErrorKind>,
    completed: Vec<Vec<u8>>,
    put_offsets: Vec<u64>,
    created_titles: Vec<String>,
    cancel_on_put: Option<CancellationToken>,
    stall_puts: bool,
}

/// 内存中的可续传上传服务
///
/// put 的偏移必须等于已存字节数，否则返回 Rejected。
#[derive(Default)]
pub struct FakeUploadApi {
    state: Mutex<FakeState>,
    creates: AtomicUsize,
    queries: AtomicUsize,
}

impl FakeUploadApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序为接下来的 put 指定结果，`None` 为正常
    pub fn script_puts<I>(&self, script: I)
    where
        I: IntoIterator<Item = Option<PutFailure>>,
    {
        self.state.lock().put_script.extend(script);
    }

    pub fn fail_all_puts(&self, kind: RemoteErrorKind) {
        self.state.lock().fail_all_puts = Some(kind);
    }

    pub fn fail_creates(&self, times: usize, kind: RemoteErrorKind) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.create_failures.push_back(kind);
        }
    }

    /// put 不再写入数据，只返回当前已存的字节数
    pub fn stall_puts(&self) {
        self.state.lock().stall_puts = true;
    }

    /// 第一次 put 时触发取消，put 本身正常完成
    pub fn cancel_on_put(&self, token: CancellationToken) {
        self.state.lock().cancel_on_put = Some(token);
    }

    pub fn completed_uploads(&self) -> Vec<Vec<u8>> {
        self.state.lock().completed.clone()
    }

    pub fn put_offsets(&self) -> Vec<u64> {
        self.state.lock().put_offsets.clone()
    }

    pub fn created_titles(&self) -> Vec<String> {
        self.state.lock().created_titles.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

fn status_of(stored: &[u8], total: u64, session: &str) -> SessionStatus {
    if stored.len() as u64 == total {
        SessionStatus::Complete {
            video_id: format!("vid-{}", session),
        }
    } else {
        SessionStatus::Incomplete {
            acknowledged: stored.len() as u64,
        }
    }
}

#[async_trait]
impl VideoUploadApi for FakeUploadApi {
    async fn create_session(
        &self,
        metadata: &VideoMetadata,
        total_size: u64,
    ) -> Result<UploadSession, RemoteError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(kind) = state.create_failures.pop_front() {
            return Err(RemoteError::new(kind, "scripted create failure"));
        }
        state.next_session += 1;
        let uri = format!("s{}", state.next_session);
        state.sessions.insert(uri.clone(), Vec::new());
        state.created_titles.push(metadata.title.clone());
        Ok(UploadSession { uri, total_size })
    }

    async fn query_offset(&self, session: &UploadSession) -> Result<SessionStatus, RemoteError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let stored = state
            .sessions
            .get(&session.uri)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "session expired"))?;
        Ok(status_of(stored, session.total_size, &session.uri))
    }

    async fn put_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<SessionStatus, RemoteError> {
        let mut state = self.state.lock();
        state.put_offsets.push(offset);
        if let Some(token) = state.cancel_on_put.take() {
            token.cancel();
        }

        if state.stall_puts {
            let stored = state
                .sessions
                .get(&session.uri)
                .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "session expired"))?;
            return Ok(SessionStatus::Incomplete {
                acknowledged: stored.len() as u64,
            });
        }

        let failure = match state.put_script.pop_front().flatten() {
            Some(failure) => Some(failure),
            None => state.fail_all_puts.map(PutFailure::before_store),
        };

        if let Some(failure) = &failure {
            if failure.expire {
                state.sessions.remove(&session.uri);
                return Err(RemoteError::new(failure.kind, "session expired"));
            }
            if !failure.store_first {
                return Err(RemoteError::new(failure.kind, "scripted put failure"));
            }
        }

        let stored = state
            .sessions
            .get_mut(&session.uri)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "session expired"))?;
        if offset != stored.len() as u64 {
            return Err(RemoteError::new(
                RemoteErrorKind::Rejected,
                format!("offset {} does not match stored {}", offset, stored.len()),
            ));
        }
        stored.extend_from_slice(&data);
        let status = status_of(stored, session.total_size, &session.uri);
        if matches!(status, SessionStatus::Complete { .. }) {
            let bytes = stored.clone();
            state.completed.push(bytes);
        }

        match failure {
            Some(failure) => Err(RemoteError::new(failure.kind, "response lost")),
            None => Ok(status),
        }
    }
}

/// 计数的凭证提供者
#[derive(Default)]
pub struct FakeCredentials {
    refreshes: AtomicUsize,
    refresh_fails: AtomicBool,
}

impl FakeCredentials {
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn fail_refresh(&self) {
        self.refresh_fails.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn bearer(&self) -> Result<String> {
        Ok(format!("token-{}", self.refresh_count()))
    }

    async fn refresh(&self) -> Result<String> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("refresh token revoked"));
        }
        self.bearer().await
    }
}

/// 只记录等待时长，不真正等待
#[derive(Default)]
pub struct InstantSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl InstantSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

/// 记录添加操作的播放列表服务
#[derive(Default)]
pub struct FakePlaylists {
    attached: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl FakePlaylists {
    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn attached(&self) -> Vec<(String, String)> {
        self.attached.lock().clone()
    }
}

#[async_trait]
impl PlaylistAttacher for FakePlaylists {
    async fn attach(&self, playlist_name: &str, video_id: &str) -> Result<(), RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::new(RemoteErrorKind::ServerError, "playlist service unavailable"));
        }
        self.attached
            .lock()
            .push((playlist_name.to_string(), video_id.to_string()));
        Ok(())
    }
}

/// 固定内容的远端视频列表
#[derive(Default)]
pub struct FakeCatalog {
    pub videos: Vec<RemoteVideo>,
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    async fn list_videos(&self) -> Result<Vec<RemoteVideo>, RemoteError> {
        Ok(self.videos.clone())
    }
}

/// 总是失败的元数据生成器
pub struct FailingMetadata;

impl MetadataProvider for FailingMetadata {
    fn generate(&self, file: &VideoFile, _position: FolderPosition) -> Result<VideoMetadata> {
        Err(anyhow!("template error for {}", file.path.display()))
    }
}
