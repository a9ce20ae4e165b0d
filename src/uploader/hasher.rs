//! 内容哈希
//!
//! 以 SHA-256 作为去重键。文件以 64KB 为单位流式读取，不会整体载入内存。

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::UploadError;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const READER_CAPACITY: usize = 1024 * 1024;

/// 内容哈希计算器
///
/// 同一次运行内按路径缓存结果，重复出现的路径只计算一次。
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    cache: Arc<DashMap<PathBuf, String>>,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 计算文件的 SHA-256（小写十六进制）
    ///
    /// 文件不可读或读取中途出错时返回 `UploadError::LocalIo`。
    pub async fn hash_file(&self, path: &Path) -> Result<String, UploadError> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }

        let owned = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || hash_file_sync(&owned))
            .await
            .map_err(|e| UploadError::LocalIo(format!("哈希任务执行失败: {}", e)))??;

        self.cache.insert(path.to_path_buf(), digest.clone());
        Ok(digest)
    }
}

fn hash_file_sync(path: &Path) -> Result<String, UploadError> {
    let file = std::fs::File::open(path)
        .map_err(|e| UploadError::LocalIo(format!("无法打开文件 {:?}: {}", path, e)))?;
    let mut reader = std::io::BufReader::with_capacity(READER_CAPACITY, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| UploadError::LocalIo(format!("读取文件失败 {:?}: {}", path, e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    let digest = hex::encode(hasher.finalize());
    debug!("哈希计算完成: path={:?}, size={}, sha256={}", path, total, digest);
    Ok(digest)
}
