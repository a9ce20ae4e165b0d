// YouTube Data API 数据类型

use serde::{Deserialize, Serialize};

/// 错误响应体
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorItem {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl ApiErrorBody {
    /// 第一个 reason，用于区分配额耗尽和普通拒绝
    pub fn reason(&self) -> Option<&str> {
        self.error
            .errors
            .iter()
            .map(|e| e.reason.as_str())
            .find(|r| !r.is_empty())
    }

    pub fn message(&self) -> &str {
        if !self.error.message.is_empty() {
            return &self.error.message;
        }
        self.error
            .errors
            .first()
            .map(|e| e.message.as_str())
            .unwrap_or_default()
    }
}

// =====================================================
// 上传
// =====================================================

/// videos.insert 请求体
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoResource {
    pub snippet: VideoSnippet,
    pub status: VideoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_details: Option<RecordingDetails>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnippet {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub category_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub privacy_status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// 上传完成后返回的视频资源（只取 id）
#[derive(Debug, Deserialize)]
pub struct InsertedVideo {
    pub id: String,
}

// =====================================================
// 列表
// =====================================================

/// 分页响应
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub content_details: ChannelContentDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelContentDetails {
    pub related_playlists: RelatedPlaylists,
}

#[derive(Debug, Deserialize)]
pub struct RelatedPlaylists {
    pub uploads: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub snippet: PlaylistItemSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItemSnippet {
    #[serde(default)]
    pub title: String,
    pub resource_id: ResourceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    pub kind: String,
    #[serde(default)]
    pub video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub snippet: PlaylistSnippet,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistSnippet {
    pub title: String,
}

// =====================================================
// 播放列表写入
// =====================================================

#[derive(Debug, Serialize)]
pub struct NewPlaylist {
    pub snippet: NewPlaylistSnippet,
    pub status: VideoStatus,
}

#[derive(Debug, Serialize)]
pub struct NewPlaylistSnippet {
    pub title: String,
}

#[derive(Debug, Serialize)]
pub struct NewPlaylistItem {
    pub snippet: NewPlaylistItemSnippet,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlaylistItemSnippet {
    pub playlist_id: String,
    pub resource_id: ResourceId,
}
