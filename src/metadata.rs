//! 视频元数据生成
//!
//! 模板展开等复杂逻辑不在这里，默认实现只根据文件名和所在文件夹生成。
//! 生成失败时编排器使用 [`VideoMetadata::fallback`]，不会中止上传。

use anyhow::Result;

use crate::remote::VideoMetadata;
use crate::uploader::folder::{FolderPosition, VideoFile};

/// 标题长度上限（字符）
const MAX_TITLE_CHARS: usize = 100;

pub trait MetadataProvider: Send + Sync {
    fn generate(&self, file: &VideoFile, position: FolderPosition) -> Result<VideoMetadata>;
}

impl VideoMetadata {
    /// 最小可用的元数据：标题为文件名
    pub fn fallback(file: &VideoFile, privacy_status: &str, category_id: &str) -> Self {
        Self {
            title: truncate_title(&file.file_stem()),
            description: String::new(),
            tags: Vec::new(),
            category_id: category_id.to_string(),
            privacy_status: privacy_status.to_string(),
            recorded_at: None,
            location: None,
        }
    }
}

/// 默认元数据生成器
#[derive(Debug, Clone)]
pub struct DefaultMetadataProvider {
    pub privacy_status: String,
    pub category_id: String,
}

impl DefaultMetadataProvider {
    pub fn new(privacy_status: impl Into<String>, category_id: impl Into<String>) -> Self {
        Self {
            privacy_status: privacy_status.into(),
            category_id: category_id.into(),
        }
    }
}

impl MetadataProvider for DefaultMetadataProvider {
    fn generate(&self, file: &VideoFile, position: FolderPosition) -> Result<VideoMetadata> {
        let stem = file.file_stem();
        if stem.trim().is_empty() {
            anyhow::bail!("文件名为空: {}", file.path.display());
        }

        let folder = file.folder_name();
        let title = if position.total > 1 {
            format!("{} ({}/{})", stem, position.index, position.total)
        } else {
            stem.clone()
        };
        let description = match &folder {
            Some(folder) => format!("{}\n\nFrom: {}", stem, folder),
            None => stem,
        };

        Ok(VideoMetadata {
            title: truncate_title(&title),
            description,
            tags: folder.into_iter().collect(),
            category_id: self.category_id.clone(),
            privacy_status: self.privacy_status.clone(),
            recorded_at: file.modified,
            location: None,
        })
    }
}

fn truncate_title(title: &str) -> String {
    // 远端不接受尖括号
    let cleaned: String = title.chars().filter(|c| *c != '<' && *c != '>').collect();
    cleaned.chars().take(MAX_TITLE_CHARS).collect()
}
