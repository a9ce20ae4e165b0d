//! 上传历史与远端视频列表的对账
//!
//! `diff` 只读；`fix` 只修复 `local_only`（删除远端已不存在的成功记录），
//! 其余类别只报告，由操作员决定如何处理。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::persistence::{HistoryLedger, HistoryRecord, UploadStatus};
use crate::remote::RemoteVideo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// 本地记录成功，远端已无此视频
    LocalOnly,
    /// 远端有视频，本地没有对应的成功记录
    RemoteOnly,
    /// 两边都有，但记录的状态与远端不一致
    Drifted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncDivergence {
    pub kind: DivergenceKind,
    pub record: Option<HistoryRecord>,
    pub remote_video_id: Option<String>,
    pub remote_title: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncDiff {
    pub divergences: Vec<SyncDivergence>,
    /// 完全一致的记录数
    pub in_sync: usize,
}

impl SyncDiff {
    pub fn count(&self, kind: DivergenceKind) -> usize {
        self.divergences.iter().filter(|d| d.kind == kind).count()
    }

    pub fn is_clean(&self) -> bool {
        self.divergences.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FixReport {
    pub repaired: usize,
    pub failed: usize,
    /// 非 local_only，或对账之后记录已变化
    pub skipped: usize,
    pub errors: Vec<String>,
}

pub struct SyncReconciler {
    ledger: Arc<HistoryLedger>,
}

impl SyncReconciler {
    pub fn new(ledger: Arc<HistoryLedger>) -> Self {
        Self { ledger }
    }

    /// 对比成功记录与远端列表
    pub fn diff(&self, remote: &[RemoteVideo]) -> Result<SyncDiff> {
        let remote_by_id: HashMap<&str, &RemoteVideo> =
            remote.iter().map(|v| (v.video_id.as_str(), v)).collect();
        let successes = self.ledger.list_successful()?;

        let mut diff = SyncDiff::default();
        let mut known_ids: HashSet<String> = HashSet::new();

        for record in successes {
            let Some(video_id) = record.remote_video_id.clone() else {
                continue;
            };
            known_ids.insert(video_id.clone());

            let Some(video) = remote_by_id.get(video_id.as_str()) else {
                diff.divergences.push(SyncDivergence {
                    kind: DivergenceKind::LocalOnly,
                    detail: format!("video {} no longer exists remotely", video_id),
                    record: Some(record),
                    remote_video_id: Some(video_id),
                    remote_title: None,
                });
                continue;
            };

            match playlist_drift(&record, video) {
                Some(detail) => diff.divergences.push(SyncDivergence {
                    kind: DivergenceKind::Drifted,
                    detail,
                    record: Some(record),
                    remote_video_id: Some(video_id),
                    remote_title: Some(video.title.clone()),
                }),
                None => diff.in_sync += 1,
            }
        }

        let mut seen = HashSet::new();
        for video in remote {
            if known_ids.contains(&video.video_id) || !seen.insert(video.video_id.as_str()) {
                continue;
            }
            // 未成功的记录也可能带着视频 ID（例如导入的数据）
            let divergence = match self.ledger.find_by_video_id(&video.video_id)? {
                Some(record) => SyncDivergence {
                    kind: DivergenceKind::Drifted,
                    detail: format!("remote video exists but record status is {}", record.status),
                    record: Some(record),
                    remote_video_id: Some(video.video_id.clone()),
                    remote_title: Some(video.title.clone()),
                },
                None => SyncDivergence {
                    kind: DivergenceKind::RemoteOnly,
                    detail: "no upload record for this video".to_string(),
                    record: None,
                    remote_video_id: Some(video.video_id.clone()),
                    remote_title: Some(video.title.clone()),
                },
            };
            diff.divergences.push(divergence);
        }

        info!(
            "对账完成: 一致 {}, local_only {}, remote_only {}, drifted {}",
            diff.in_sync,
            diff.count(DivergenceKind::LocalOnly),
            diff.count(DivergenceKind::RemoteOnly),
            diff.count(DivergenceKind::Drifted)
        );
        Ok(diff)
    }

    /// 删除远端已不存在的成功记录
    ///
    /// 删除前重新读取记录，若已被重新上传或修改则跳过。
    pub fn fix(&self, divergences: &[SyncDivergence]) -> FixReport {
        let mut report = FixReport::default();

        for divergence in divergences {
            let (DivergenceKind::LocalOnly, Some(record)) = (divergence.kind, &divergence.record) else {
                report.skipped += 1;
                continue;
            };

            let current = match self.ledger.find_by_hash(&record.file_hash) {
                Ok(current) => current,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("{}: {:#}", record.file_path, e));
                    continue;
                }
            };
            let unchanged = current.as_ref().is_some_and(|c| {
                c.status == UploadStatus::Success && c.remote_video_id == record.remote_video_id
            });
            if !unchanged {
                info!("记录已变化，跳过删除: {}", record.file_path);
                report.skipped += 1;
                continue;
            }

            match self.ledger.delete_by_hash(&record.file_hash) {
                Ok(_) => {
                    info!(
                        "已删除失效记录: {} ({:?})",
                        record.file_path, record.remote_video_id
                    );
                    report.repaired += 1;
                }
                Err(e) => {
                    warn!("删除记录失败: {}, {:#}", record.file_path, e);
                    report.failed += 1;
                    report.errors.push(format!("{}: {:#}", record.file_path, e));
                }
            }
        }
        report
    }
}

/// 记录的播放列表不在远端成员列表中时返回说明
fn playlist_drift(record: &HistoryRecord, video: &RemoteVideo) -> Option<String> {
    let expected = record.playlist_name.as_deref()?;
    let actual = video.playlists.as_ref()?;
    if actual.iter().any(|name| name == expected) {
        return None;
    }
    Some(format!(
        "recorded playlist '{}' but remote playlists are [{}]",
        expected,
        actual.join(", ")
    ))
}
