// 对账与配额查询

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::info;

use crate::sync::{FixReport, SyncDiff, SyncReconciler};

use super::AppContext;

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub remote_videos: usize,
    pub diff: SyncDiff,
    pub fix: Option<FixReport>,
}

/// 拉取远端视频列表并与上传历史对账，`fix` 为 true 时删除失效记录
pub async fn sync_remote(ctx: &AppContext, fix: bool) -> Result<SyncOutcome> {
    let remote = ctx
        .remote
        .catalog
        .list_videos()
        .await
        .context("获取远端视频列表失败")?;

    let reconciler = SyncReconciler::new(ctx.ledger.clone());
    let diff = reconciler.diff(&remote)?;
    let fix = fix.then(|| reconciler.fix(&diff.divergences));
    if let Some(report) = &fix {
        info!(
            "修复完成: 删除 {}, 失败 {}, 跳过 {}",
            report.repaired, report.failed, report.skipped
        );
    }

    Ok(SyncOutcome {
        remote_videos: remote.len(),
        diff,
        fix,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub date: NaiveDate,
    pub consumed: u64,
    pub limit: u64,
    pub remaining: u64,
    pub cost_per_upload: u64,
    /// 剩余配额还能上传的文件数
    pub uploads_remaining: u64,
    /// 今天（本地日期）成功上传的文件数与字节数
    pub uploaded_today: usize,
    pub bytes_today: u64,
}

pub fn quota_status(ctx: &AppContext) -> Result<QuotaStatus> {
    let usage = ctx.quota.current_usage()?;
    let cost = ctx.config.quota.cost_per_upload;

    let midnight = usage
        .date
        .and_hms_opt(0, 0, 0)
        .and_then(|t| Local.from_local_datetime(&t).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let (uploaded_today, bytes_today) = ctx.ledger.successes_since(midnight)?;

    Ok(QuotaStatus {
        date: usage.date,
        consumed: usage.consumed,
        limit: usage.limit,
        remaining: usage.remaining(),
        cost_per_upload: cost,
        uploads_remaining: usage.remaining() / cost.max(1),
        uploaded_today,
        bytes_today,
    })
}
