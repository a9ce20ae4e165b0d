//! 远端能力接口
//!
//! 上传核心只通过这些窄接口访问远端服务和外部协作者，依赖方向单向：
//! 协作者不会回调编排器或账本。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// 视频元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    /// private / unlisted / public
    pub privacy_status: String,
    pub recorded_at: Option<DateTime<Utc>>,
    pub location: Option<GeoLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// 可续传上传会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// 会话 URI，只保存在内存中
    pub uri: String,
    pub total_size: u64,
}

/// 会话状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// 远端已确认 `acknowledged` 字节
    Incomplete { acknowledged: u64 },
    /// 上传完成
    Complete { video_id: String },
}

/// 远端列表中的一个视频
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteVideo {
    pub video_id: String,
    pub title: String,
    /// 所属播放列表名；`None` 表示列表未包含成员信息
    pub playlists: Option<Vec<String>>,
}

/// 可续传上传协议
#[async_trait]
pub trait VideoUploadApi: Send + Sync {
    /// 创建上传会话（远端在此时计入配额）
    async fn create_session(
        &self,
        metadata: &VideoMetadata,
        total_size: u64,
    ) -> Result<UploadSession, RemoteError>;

    /// 查询远端已确认的偏移量
    async fn query_offset(&self, session: &UploadSession) -> Result<SessionStatus, RemoteError>;

    /// 从 `offset` 处上传一段数据
    async fn put_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<SessionStatus, RemoteError>;
}

/// 凭证提供者
///
/// 令牌的获取与续期在外部完成，这里只消费。
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// 当前可用的 bearer 令牌
    async fn bearer(&self) -> anyhow::Result<String>;

    /// 收到 401 后调用，返回新的令牌；失败表示无法继续
    async fn refresh(&self) -> anyhow::Result<String>;
}

/// 播放列表协作者：按名称解析（必要时创建）并添加视频
#[async_trait]
pub trait PlaylistAttacher: Send + Sync {
    async fn attach(&self, playlist_name: &str, video_id: &str) -> Result<(), RemoteError>;
}

/// 远端视频枚举
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn list_videos(&self) -> Result<Vec<RemoteVideo>, RemoteError>;
}
