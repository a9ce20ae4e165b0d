// YouTube 客户端实现
//
// 可续传上传协议：
// - POST videos?uploadType=resumable 创建会话，Location 头为会话 URI
// - PUT 会话 URI 携带 Content-Range: bytes a-b/total 上传分片
// - 308 表示未完成，Range: bytes=0-n 表示已确认 n+1 字节
// - 空 PUT 携带 Content-Range: bytes */total 查询进度
// - 200/201 表示完成，响应体为视频资源

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::YoutubeConfig;
use crate::error::{RemoteError, RemoteErrorKind};
use crate::remote::{
    CredentialProvider, PlaylistAttacher, RemoteCatalog, RemoteVideo, SessionStatus,
    UploadSession, VideoMetadata, VideoUploadApi,
};

use super::types::*;

/// 列表接口单页上限
const PAGE_SIZE: &str = "50";
/// 并发拉取播放列表成员的数量
const PLAYLIST_FETCH_CONCURRENCY: usize = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// YouTube Data API 客户端
#[derive(Clone)]
pub struct YoutubeClient {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    api_base: String,
    upload_base: String,
    playlist_privacy: String,
    /// 播放列表名 → ID
    playlist_ids: Arc<DashMap<String, String>>,
    /// 串行化播放列表创建，避免并发创建同名列表
    playlist_create_lock: Arc<tokio::sync::Mutex<()>>,
}

impl YoutubeClient {
    pub fn new(config: &YoutubeConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        // 308 是协议状态而不是重定向，必须关闭自动跳转
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化 YouTube 客户端: api={}", config.api_base);

        Ok(Self {
            client,
            credentials,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            upload_base: config.upload_base.trim_end_matches('/').to_string(),
            playlist_privacy: config.playlist_privacy.clone(),
            playlist_ids: Arc::new(DashMap::new()),
            playlist_create_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    async fn bearer(&self) -> Result<String, RemoteError> {
        self.credentials.bearer().await.map_err(|e| {
            RemoteError::new(RemoteErrorKind::Unauthorized, format!("no usable access token: {:#}", e))
        })
    }

    /// 发送需要授权的请求，401 时刷新一次令牌后重发
    async fn send_authorized<F>(&self, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let token = self.bearer().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("请求返回 401，刷新令牌后重试");
        let token = self.credentials.refresh().await.map_err(|e| {
            RemoteError::new(RemoteErrorKind::Unauthorized, format!("credential refresh failed: {:#}", e))
        })?;
        Ok(build(&token).send().await?)
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RemoteError> {
        let url = format!("{}/{}", self.api_base, path);
        let response = self
            .send_authorized(|token| self.client.get(&url).bearer_auth(token).query(query))
            .await?;
        parse_json(response).await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned + Send>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> Result<T, RemoteError> {
        let url = format!("{}/{}", self.api_base, path);
        let response = self
            .send_authorized(|token| {
                self.client
                    .post(&url)
                    .bearer_auth(token)
                    .query(query)
                    .json(body)
            })
            .await?;
        parse_json(response).await
    }

    /// 拉取所有分页
    async fn list_all<T: DeserializeOwned + Send>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, RemoteError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page: ListResponse<T> = {
                let mut params: Vec<(&str, &str)> = query.to_vec();
                params.push(("maxResults", PAGE_SIZE));
                if let Some(token) = page_token.as_deref() {
                    params.push(("pageToken", token));
                }
                self.get_json(path, &params).await?
            };
            items.extend(page.items);

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn uploads_playlist_id(&self) -> Result<String, RemoteError> {
        let channels: ListResponse<Channel> = self
            .get_json("channels", &[("part", "contentDetails"), ("mine", "true")])
            .await?;
        channels
            .items
            .into_iter()
            .next()
            .map(|c| c.content_details.related_playlists.uploads)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "authenticated account has no channel"))
    }

    async fn playlist_videos(&self, playlist_id: &str) -> Result<Vec<PlaylistItem>, RemoteError> {
        self.list_all("playlistItems", &[("part", "snippet"), ("playlistId", playlist_id)])
            .await
    }

    /// 刷新播放列表名称缓存并返回全部播放列表
    async fn refresh_playlists(&self) -> Result<Vec<Playlist>, RemoteError> {
        let playlists: Vec<Playlist> = self
            .list_all("playlists", &[("part", "snippet"), ("mine", "true")])
            .await?;
        for playlist in &playlists {
            self.playlist_ids
                .entry(playlist.snippet.title.clone())
                .or_insert_with(|| playlist.id.clone());
        }
        Ok(playlists)
    }

    /// 按名称解析播放列表 ID，不存在时创建
    async fn resolve_playlist(&self, name: &str) -> Result<String, RemoteError> {
        if let Some(id) = self.playlist_ids.get(name) {
            return Ok(id.clone());
        }

        let _guard = self.playlist_create_lock.lock().await;
        if let Some(id) = self.playlist_ids.get(name) {
            return Ok(id.clone());
        }

        self.refresh_playlists().await?;
        if let Some(id) = self.playlist_ids.get(name) {
            return Ok(id.clone());
        }

        let body = NewPlaylist {
            snippet: NewPlaylistSnippet {
                title: name.to_string(),
            },
            status: VideoStatus {
                privacy_status: self.playlist_privacy.clone(),
            },
        };
        let created: Playlist = self
            .post_json("playlists", &[("part", "snippet,status")], &body)
            .await?;
        info!("已创建播放列表: {} ({})", name, created.id);
        self.playlist_ids.insert(name.to_string(), created.id.clone());
        Ok(created.id)
    }

    async fn session_response(&self, response: Response) -> Result<SessionStatus, RemoteError> {
        match response.status().as_u16() {
            200 | 201 => {
                let video: InsertedVideo = parse_json(response).await?;
                Ok(SessionStatus::Complete { video_id: video.id })
            }
            308 => {
                let acknowledged = response
                    .headers()
                    .get(RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_range_header)
                    .unwrap_or(0);
                Ok(SessionStatus::Incomplete { acknowledged })
            }
            _ => Err(error_from_response(response).await),
        }
    }
}

#[async_trait]
impl VideoUploadApi for YoutubeClient {
    async fn create_session(
        &self,
        metadata: &VideoMetadata,
        total_size: u64,
    ) -> Result<UploadSession, RemoteError> {
        let resource = video_resource(metadata);
        let parts = if resource.recording_details.is_some() {
            "snippet,status,recordingDetails"
        } else {
            "snippet,status"
        };
        let url = format!("{}/videos", self.upload_base);

        let response = self
            .send_authorized(|token| {
                self.client
                    .post(&url)
                    .bearer_auth(token)
                    .query(&[("uploadType", "resumable"), ("part", parts)])
                    .header("X-Upload-Content-Length", total_size)
                    .header("X-Upload-Content-Type", "video/*")
                    .json(&resource)
            })
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let uri = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::ServerError, "session response has no Location header"))?;

        debug!("上传会话: title={}, size={}", metadata.title, total_size);
        Ok(UploadSession { uri, total_size })
    }

    async fn query_offset(&self, session: &UploadSession) -> Result<SessionStatus, RemoteError> {
        let token = self.bearer().await?;
        let response = self
            .client
            .put(&session.uri)
            .bearer_auth(token)
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, format!("bytes */{}", session.total_size))
            .send()
            .await?;
        self.session_response(response).await
    }

    async fn put_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<SessionStatus, RemoteError> {
        let end = offset + data.len() as u64;
        let token = self.bearer().await?;
        let response = self
            .client
            .put(&session.uri)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "video/*")
            .header(CONTENT_RANGE, content_range(offset, end, session.total_size))
            .body(data)
            .send()
            .await?;
        self.session_response(response).await
    }
}

#[async_trait]
impl PlaylistAttacher for YoutubeClient {
    async fn attach(&self, playlist_name: &str, video_id: &str) -> Result<(), RemoteError> {
        let playlist_id = self.resolve_playlist(playlist_name).await?;
        let body = NewPlaylistItem {
            snippet: NewPlaylistItemSnippet {
                playlist_id: playlist_id.clone(),
                resource_id: ResourceId {
                    kind: "youtube#video".to_string(),
                    video_id: Some(video_id.to_string()),
                },
            },
        };
        let _: serde_json::Value = self
            .post_json("playlistItems", &[("part", "snippet")], &body)
            .await?;
        info!("已添加到播放列表: {} -> {} ({})", video_id, playlist_name, playlist_id);
        Ok(())
    }
}

#[async_trait]
impl RemoteCatalog for YoutubeClient {
    /// 列出频道全部上传视频及其所属播放列表
    async fn list_videos(&self) -> Result<Vec<RemoteVideo>, RemoteError> {
        let uploads_id = self.uploads_playlist_id().await?;
        let uploads = self.playlist_videos(&uploads_id).await?;
        info!("远端上传列表: {} 个视频", uploads.len());

        let playlists = self.refresh_playlists().await?;
        let memberships: Vec<(String, Vec<String>)> = stream::iter(playlists)
            .map(|playlist| async move {
                let items = self.playlist_videos(&playlist.id).await?;
                let ids = items
                    .into_iter()
                    .filter_map(|item| item.snippet.resource_id.video_id)
                    .collect::<Vec<_>>();
                Ok::<_, RemoteError>((playlist.snippet.title, ids))
            })
            .buffer_unordered(PLAYLIST_FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut by_video: HashMap<String, Vec<String>> = HashMap::new();
        for (title, ids) in memberships {
            for id in ids {
                by_video.entry(id).or_default().push(title.clone());
            }
        }

        Ok(uploads
            .into_iter()
            .filter_map(|item| {
                let video_id = item.snippet.resource_id.video_id?;
                let mut playlists = by_video.remove(&video_id).unwrap_or_default();
                playlists.sort();
                Some(RemoteVideo {
                    video_id,
                    title: item.snippet.title,
                    playlists: Some(playlists),
                })
            })
            .collect())
    }
}

fn video_resource(metadata: &VideoMetadata) -> VideoResource {
    let recording_details = if metadata.recorded_at.is_some() || metadata.location.is_some() {
        Some(RecordingDetails {
            recording_date: metadata.recorded_at.map(|t| t.to_rfc3339()),
            location: metadata.location.map(|l| GeoPoint {
                latitude: l.latitude,
                longitude: l.longitude,
            }),
        })
    } else {
        None
    };

    VideoResource {
        snippet: VideoSnippet {
            title: metadata.title.clone(),
            description: metadata.description.clone(),
            tags: metadata.tags.clone(),
            category_id: metadata.category_id.clone(),
        },
        status: VideoStatus {
            privacy_status: metadata.privacy_status.clone(),
        },
        recording_details,
    }
}

/// `bytes a-b/total`，空分片时为查询格式
fn content_range(start: u64, end: u64, total: u64) -> String {
    if end > start {
        format!("bytes {}-{}/{}", start, end - 1, total)
    } else {
        format!("bytes */{}", total)
    }
}

/// 解析 308 响应的 `Range: bytes=0-n`，返回已确认字节数 n+1
pub fn parse_range_header(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes=")?;
    let (_, last) = range.split_once('-')?;
    last.trim().parse::<u64>().ok().map(|n| n + 1)
}

async fn parse_json<T: DeserializeOwned + Send>(response: Response) -> Result<T, RemoteError> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| {
        RemoteError::new(
            RemoteErrorKind::ServerError,
            format!("unexpected response body: {} ({})", e, truncate(&text, 200)),
        )
    })
}

async fn error_from_response(response: Response) -> RemoteError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    classify_error(status.as_u16(), &text)
}

fn classify_error(status: u16, body: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let reason = parsed.as_ref().and_then(|b| b.reason());
    let kind = RemoteErrorKind::from_status(status, reason);

    let message = match &parsed {
        Some(body) => match reason {
            Some(reason) => format!("HTTP {} {}: {}", status, reason, body.message()),
            None => format!("HTTP {}: {}", status, body.message()),
        },
        None if body.is_empty() => format!("HTTP {}", status),
        None => format!("HTTP {}: {}", status, truncate(body, 200)),
    };
    RemoteError::new(kind, message)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
