//! 视频文件扫描
//!
//! 负责:
//! - 递归扫描本地文件夹，只保留已知的视频扩展名
//! - 计算每个文件在所属文件夹中的序号（用于标题 "第 i / n 集"）

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 支持的视频扩展名（小写）
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v"];

/// 待上传的视频文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFile {
    /// 绝对路径
    pub path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
    /// 修改时间，作为录制时间的兜底
    pub modified: Option<DateTime<Utc>>,
}

impl VideoFile {
    /// 从路径读取元数据构造
    pub fn from_path(path: &Path) -> Result<Self> {
        let path = std::path::absolute(path)
            .with_context(|| format!("无法解析绝对路径: {}", path.display()))?;
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("读取文件元数据失败: {}", path.display()))?;
        if !metadata.is_file() {
            bail!("不是普通文件: {}", path.display());
        }
        Ok(Self {
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            size: metadata.len(),
            path,
        })
    }

    /// 所在文件夹名，作为默认播放列表名
    pub fn folder_name(&self) -> Option<String> {
        self.path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    pub fn file_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// 文件在所属文件夹中的位置（从 1 开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderPosition {
    pub index: usize,
    pub total: usize,
}

impl Default for FolderPosition {
    fn default() -> Self {
        Self { index: 1, total: 1 }
    }
}

/// 扫描配置
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// 跳过以 . 开头的文件和文件夹
    pub skip_hidden: bool,
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            skip_hidden: true,
            follow_symlinks: false,
        }
    }
}

/// 视频扫描器
#[derive(Debug, Clone, Default)]
pub struct VideoScanner {
    options: ScanOptions,
}

impl VideoScanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描文件夹，结果按路径排序
    pub fn scan(&self, root: &Path) -> Result<Vec<VideoFile>> {
        if !root.is_dir() {
            bail!("扫描路径不是文件夹: {}", root.display());
        }
        let root = std::path::absolute(root)
            .with_context(|| format!("无法解析绝对路径: {}", root.display()))?;

        info!("开始扫描视频文件: {}", root.display());
        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(&root)
            .follow_links(self.options.follow_symlinks)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(skip_hidden && is_hidden(e.file_name())));

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("跳过无法访问的条目: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_video(entry.path()) {
                continue;
            }
            let metadata = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?;

            debug!("扫描到视频: {} ({} bytes)", entry.path().display(), metadata.len());
            files.push(VideoFile {
                path: entry.into_path(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            "扫描完成: {} 个视频，共 {} bytes",
            files.len(),
            files.iter().map(|f| f.size).sum::<u64>()
        );
        Ok(files)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

/// 按扩展名判断是否为视频（不区分大小写）
pub fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 计算每个文件在同一文件夹内（按文件名排序）的位置
pub fn folder_positions(files: &[VideoFile]) -> HashMap<PathBuf, FolderPosition> {
    let mut by_folder: BTreeMap<PathBuf, Vec<&Path>> = BTreeMap::new();
    for file in files {
        let parent = file.path.parent().map(Path::to_path_buf).unwrap_or_default();
        by_folder.entry(parent).or_default().push(&file.path);
    }

    let mut positions = HashMap::with_capacity(files.len());
    for (_, mut paths) in by_folder {
        paths.sort();
        paths.dedup();
        let total = paths.len();
        for (i, path) in paths.into_iter().enumerate() {
            positions.insert(path.to_path_buf(), FolderPosition { index: i + 1, total });
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// root/
    /// ├── b.MP4
    /// ├── a.mov
    /// ├── notes.txt
    /// ├── .hidden.mp4
    /// ├── .cache/x.mp4
    /// └── trip/
    ///     ├── day2.mkv
    ///     └── day1.mkv
    fn create_test_folder() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("trip")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        for name in ["b.MP4", "a.mov", "notes.txt", ".hidden.mp4", ".cache/x.mp4", "trip/day2.mkv", "trip/day1.mkv"] {
            fs::write(root.join(name), name.as_bytes()).unwrap();
        }
        dir
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = create_test_folder();
        let files = VideoScanner::default().scan(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.path.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.mov", "b.MP4", "trip/day1.mkv", "trip/day2.mkv"]);
        assert!(files.iter().all(|f| f.path.is_absolute()));
    }

    #[test]
    fn test_scan_can_include_hidden() {
        let dir = create_test_folder();
        let scanner = VideoScanner::new(ScanOptions {
            skip_hidden: false,
            ..Default::default()
        });
        assert_eq!(scanner.scan(dir.path()).unwrap().len(), 6);
    }

    #[test]
    fn test_scan_rejects_file_root() {
        let dir = create_test_folder();
        assert!(VideoScanner::default().scan(&dir.path().join("a.mov")).is_err());
    }

    #[test]
    fn test_folder_positions() {
        let dir = create_test_folder();
        let files = VideoScanner::default().scan(dir.path()).unwrap();
        let positions = folder_positions(&files);

        let day2 = positions[&dir.path().join("trip/day2.mkv")];
        assert_eq!(day2, FolderPosition { index: 2, total: 2 });
        let a = positions[&dir.path().join("a.mov")];
        assert_eq!(a, FolderPosition { index: 1, total: 2 });
        assert_eq!(files[2].folder_name().as_deref(), Some("trip"));
    }
}
