//! 分片读取

use std::ops::Range;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::error::UploadError;

/// 计算从 `offset` 开始的下一个分片范围
pub fn next_chunk_range(offset: u64, total_size: u64, chunk_size: u64) -> Range<u64> {
    let end = offset.saturating_add(chunk_size).min(total_size);
    offset..end
}

/// 读取文件中 `range` 对应的数据
///
/// 文件在上传途中被截断或移动时返回 `LocalIo`。
pub async fn read_chunk(path: &Path, range: Range<u64>) -> Result<Vec<u8>, UploadError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| UploadError::LocalIo(format!("打开上传文件失败 {:?}: {}", path, e)))?;

    file.seek(std::io::SeekFrom::Start(range.start))
        .await
        .map_err(|e| UploadError::LocalIo(format!("文件定位失败 {:?}: {}", path, e)))?;

    let mut buffer = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buffer)
        .await
        .map_err(|e| UploadError::LocalIo(format!("读取分片失败 {:?}: {}", path, e)))?;

    debug!(
        "读取分片: bytes={}-{}, 大小={}",
        range.start,
        range.end.saturating_sub(1),
        buffer.len()
    );
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_next_chunk_range() {
        assert_eq!(next_chunk_range(0, 10, 4), 0..4);
        assert_eq!(next_chunk_range(8, 10, 4), 8..10);
        assert_eq!(next_chunk_range(10, 10, 4), 10..10);
    }

    #[tokio::test]
    async fn test_read_chunk_at_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.mp4");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(read_chunk(&path, 3..7).await.unwrap(), b"3456");
        assert_eq!(read_chunk(&path, 8..10).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn test_read_past_end_is_local_io() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.mp4");
        std::fs::write(&path, b"abc").unwrap();

        let err = read_chunk(&path, 0..10).await.unwrap_err();
        assert!(matches!(err, UploadError::LocalIo(_)));
    }
}
