// 上传历史管理：list / delete / export / import

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::persistence::{HistoryRecord, HistoryStats, ImportSummary, UploadStatus};

use super::AppContext;

/// 删除目标
#[derive(Debug, Clone)]
pub enum DeleteTarget {
    Hash(String),
    Path(String),
    VideoId(String),
}

pub fn history_list(
    ctx: &AppContext,
    status: Option<UploadStatus>,
    limit: Option<usize>,
) -> Result<Vec<HistoryRecord>> {
    ctx.ledger.list_records(status, limit)
}

pub fn history_stats(ctx: &AppContext) -> Result<HistoryStats> {
    ctx.ledger.stats()
}

/// 返回删除的记录数
pub fn history_delete(ctx: &AppContext, target: &DeleteTarget) -> Result<usize> {
    let removed = match target {
        DeleteTarget::Hash(hash) => ctx.ledger.delete_by_hash(hash)?,
        DeleteTarget::Path(path) => {
            let absolute = std::path::absolute(path)?;
            ctx.ledger.delete_by_path(&absolute.to_string_lossy())?
        }
        DeleteTarget::VideoId(id) => ctx.ledger.delete_by_video_id(id)?,
    };
    info!("删除历史记录: {:?}, 共 {} 条", target, removed);
    Ok(removed)
}

/// 导出全部记录为 JSON 数组，返回记录数
pub async fn history_export(ctx: &AppContext, path: &Path) -> Result<usize> {
    let records = ctx.ledger.export()?;
    let json = serde_json::to_string_pretty(&records).context("序列化历史记录失败")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("写入导出文件失败: {}", path.display()))?;
    info!("已导出 {} 条记录到 {}", records.len(), path.display());
    Ok(records.len())
}

pub async fn history_import(ctx: &AppContext, path: &Path) -> Result<ImportSummary> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取导入文件失败: {}", path.display()))?;
    let records: Vec<HistoryRecord> =
        serde_json::from_str(&content).with_context(|| format!("解析导入文件失败: {}", path.display()))?;
    ctx.ledger.import(&records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::context;
    use crate::testing::FakeCatalog;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_export_then_import_into_other_ledger() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("backup/history.json");

        let (source, _) = context(FakeCatalog::default());
        let a = source.ledger.upsert_attempt("ha", "/v/a.mp4", 10).unwrap();
        source.ledger.mark_success(&a, "va", Some("Trip")).unwrap();
        let b = source.ledger.upsert_attempt("hb", "/v/b.mp4", 20).unwrap();
        source.ledger.mark_failed(&b, true, "quota exhausted: daily").unwrap();

        assert_eq!(history_export(&source, &file).await.unwrap(), 2);

        let (target, _) = context(FakeCatalog::default());
        let pending = target.ledger.upsert_attempt("ha", "/other/a.mp4", 10).unwrap();
        target.ledger.mark_failed(&pending, true, "reset").unwrap();

        let summary = history_import(&target, &file).await.unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.upgraded, 1);

        let upgraded = target.ledger.find_by_hash("ha").unwrap().unwrap();
        assert_eq!(upgraded.status, UploadStatus::Success);
        assert_eq!(upgraded.remote_video_id.as_deref(), Some("va"));

        // 重复导入全部跳过
        let again = history_import(&target, &file).await.unwrap();
        assert_eq!(again.skipped, 2);
    }

    #[test]
    fn test_list_and_delete() {
        let (ctx, _) = context(FakeCatalog::default());
        let a = ctx.ledger.upsert_attempt("ha", "/v/a.mp4", 1).unwrap();
        ctx.ledger.mark_success(&a, "va", None).unwrap();
        ctx.ledger.upsert_attempt("hb", "/v/b.mp4", 1).unwrap();

        assert_eq!(history_list(&ctx, None, None).unwrap().len(), 2);
        assert_eq!(history_list(&ctx, Some(UploadStatus::Success), None).unwrap().len(), 1);
        assert_eq!(history_list(&ctx, None, Some(1)).unwrap().len(), 1);
        let stats = history_stats(&ctx).unwrap();
        assert_eq!((stats.success, stats.pending, stats.total()), (1, 1, 2));

        assert_eq!(history_delete(&ctx, &DeleteTarget::VideoId("va".into())).unwrap(), 1);
        assert_eq!(history_delete(&ctx, &DeleteTarget::Hash("missing".into())).unwrap(), 0);
        assert_eq!(history_list(&ctx, None, None).unwrap().len(), 1);
    }
}
