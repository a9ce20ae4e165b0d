// 上传类命令：upload / reupload / retry

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::persistence::{FailedQuery, HistoryRecord};
use crate::uploader::{is_video, RunReport, ScanOptions, VideoFile, VideoScanner};

use super::AppContext;

/// 上传类命令的公共参数
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// 覆盖配置中的 worker 数
    pub concurrency: Option<usize>,
    pub dry_run: bool,
    /// 覆盖默认播放列表
    pub playlist: Option<String>,
}

/// reupload 的目标，三类可以混用
#[derive(Debug, Clone, Default)]
pub struct ReuploadTargets {
    pub paths: Vec<PathBuf>,
    pub hashes: Vec<String>,
    pub video_ids: Vec<String>,
}

impl ReuploadTargets {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.hashes.is_empty() && self.video_ids.is_empty()
    }
}

/// 扫描文件夹（或单个文件）并上传
pub async fn upload(
    ctx: &AppContext,
    paths: &[PathBuf],
    options: &UploadOptions,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let scanner = VideoScanner::new(ScanOptions {
        skip_hidden: ctx.config.upload.skip_hidden_files,
        ..Default::default()
    });

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for path in paths {
        let found = if path.is_file() {
            if !is_video(path) {
                warn!("不是视频文件，跳过: {}", path.display());
                continue;
            }
            vec![VideoFile::from_path(path)?]
        } else {
            scanner.scan(path)?
        };
        for file in found {
            if seen.insert(file.path.clone()) {
                files.push(file);
            }
        }
    }

    info!("待处理视频: {} 个", files.len());
    Ok(ctx
        .orchestrator()
        .run(files, ctx.run_options(options), cancel)
        .await)
}

/// 重置指定记录并重新上传
///
/// 未出现在历史中的路径按新文件处理。dry-run 时不重置记录。
pub async fn reupload(
    ctx: &AppContext,
    targets: &ReuploadTargets,
    options: &UploadOptions,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let mut records: Vec<HistoryRecord> = Vec::new();
    let mut untracked: Vec<VideoFile> = Vec::new();

    for path in &targets.paths {
        let absolute = std::path::absolute(path)?;
        match ctx.ledger.find_by_path(&absolute.to_string_lossy())? {
            Some(record) => records.push(record),
            None => match VideoFile::from_path(&absolute) {
                Ok(file) => untracked.push(file),
                Err(e) => warn!("跳过: {:#}", e),
            },
        }
    }
    for hash in &targets.hashes {
        match ctx.ledger.find_by_hash(hash)? {
            Some(record) => records.push(record),
            None => warn!("历史中没有该哈希: {}", hash),
        }
    }
    for video_id in &targets.video_ids {
        match ctx.ledger.find_by_video_id(video_id)? {
            Some(record) => records.push(record),
            None => warn!("历史中没有该视频: {}", video_id),
        }
    }

    let mut seen = HashSet::new();
    records.retain(|r| seen.insert(r.id));

    let mut groups: BTreeMap<Option<String>, Vec<VideoFile>> = BTreeMap::new();
    for record in records {
        let Some(file) = existing_file(&record) else {
            continue;
        };
        if options.dry_run {
            info!("[dry-run] 将重置记录: {} ({})", record.file_path, record.status);
        } else {
            ctx.ledger.clear_for_reupload(&record)?;
        }
        groups.entry(record.playlist_name).or_default().push(file);
    }
    if !untracked.is_empty() {
        groups.entry(None).or_default().extend(untracked);
    }

    Ok(run_grouped(ctx, groups, options, cancel).await)
}

/// 重新上传失败的记录，不需要重新扫描文件夹
///
/// 按记录中的播放列表分组运行；某一组因配额停止后其余组不再运行。
pub async fn retry_failed(
    ctx: &AppContext,
    query: &FailedQuery,
    options: &UploadOptions,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let records = ctx.ledger.query_failed(query)?;
    info!("符合条件的失败记录: {} 条", records.len());

    let mut groups: BTreeMap<Option<String>, Vec<VideoFile>> = BTreeMap::new();
    for record in records {
        if let Some(file) = existing_file(&record) {
            groups.entry(record.playlist_name).or_default().push(file);
        }
    }
    Ok(run_grouped(ctx, groups, options, cancel).await)
}

fn existing_file(record: &HistoryRecord) -> Option<VideoFile> {
    match VideoFile::from_path(Path::new(&record.file_path)) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("文件已不存在，跳过: {} ({:#})", record.file_path, e);
            None
        }
    }
}

async fn run_grouped(
    ctx: &AppContext,
    groups: BTreeMap<Option<String>, Vec<VideoFile>>,
    options: &UploadOptions,
    cancel: &CancellationToken,
) -> RunReport {
    let orchestrator = ctx.orchestrator();
    let mut report = RunReport::default();
    let mut stopped = false;

    for (playlist, files) in groups {
        if stopped || cancel.is_cancelled() {
            report.add_not_attempted(&files);
            continue;
        }

        let mut run_options = ctx.run_options(options);
        if run_options.playlist.is_none() {
            run_options.playlist = playlist;
        }
        let group = orchestrator.run(files, run_options, cancel).await;
        if report.run_id.is_empty() {
            report.run_id = group.run_id.clone();
        }
        stopped = group.halted.is_some();
        report.absorb(group);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::context;
    use crate::persistence::UploadStatus;
    use crate::testing::FakeCatalog;
    use crate::uploader::OutcomeKind;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_scans_folder() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Trip/a.mp4", b"aaa");
        write(dir.path(), "Trip/b.mkv", b"bbb");
        write(dir.path(), "Trip/notes.txt", b"ignored");
        let (ctx, services) = context(FakeCatalog::default());

        let report = upload(
            &ctx,
            &[dir.path().to_path_buf()],
            &UploadOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.uploaded, 2);
        assert_eq!(services.api.completed_uploads().len(), 2);
        assert_eq!(services.playlists.attached().len(), 2);
        assert!(services.playlists.attached().iter().all(|(name, _)| name == "Trip"));
    }

    #[tokio::test]
    async fn test_retry_uses_recorded_playlist() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), "raw/clip.mp4", b"clip");
        let (ctx, services) = context(FakeCatalog::default());

        let hash = crate::uploader::ContentHasher::new().hash_file(&path).await.unwrap();
        let path_str = std::path::absolute(&path).unwrap().to_string_lossy().into_owned();
        let record = ctx.ledger.upsert_attempt(&hash, &path_str, 4).unwrap();
        ctx.ledger.mark_failed(&record, true, "transient network error: reset").unwrap();
        // 失败记录本身没有播放列表，先写入一个期望的列表名
        ctx.ledger.mark_success(&record, "tmp", Some("Holiday")).unwrap();
        let record = ctx.ledger.clear_for_reupload(&record).unwrap();
        ctx.ledger.mark_failed(&record, true, "transient network error: reset").unwrap();

        // 已删除文件的记录被跳过
        let gone = ctx.ledger.upsert_attempt("gone", "/nonexistent/gone.mp4", 1).unwrap();
        ctx.ledger.mark_failed(&gone, false, "rejected by remote: bad").unwrap();

        let report = retry_failed(
            &ctx,
            &FailedQuery::default(),
            &UploadOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(services.playlists.attached()[0].0, "Holiday");
        assert_eq!(
            ctx.ledger.find_by_hash(&hash).unwrap().unwrap().status,
            UploadStatus::Success
        );
    }

    #[tokio::test]
    async fn test_retry_picks_up_records_left_by_halted_reupload() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = ["a", "b", "c"]
            .iter()
            .map(|name| write(dir.path(), &format!("v/{}.mp4", name), name.repeat(5).as_bytes()))
            .collect();
        let (ctx, services) = context(FakeCatalog::default());
        let cancel = CancellationToken::new();
        let serial = UploadOptions {
            concurrency: Some(1),
            ..Default::default()
        };

        let first = upload(&ctx, &paths, &serial, &cancel).await.unwrap();
        assert_eq!(first.uploaded, 3);

        // 只剩一个视频的配额
        assert!(ctx.quota.reserve(3_600).unwrap());
        let halted = reupload(
            &ctx,
            &ReuploadTargets {
                paths: paths.clone(),
                ..Default::default()
            },
            &serial,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(halted.uploaded, 1);
        assert_eq!(halted.failed_retryable, 1);
        assert_eq!(halted.not_attempted, 1);

        let untouched = std::path::absolute(&paths[2]).unwrap();
        let record = ctx
            .ledger
            .find_by_path(&untouched.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UploadStatus::Pending);

        ctx.quota.release(10_000).unwrap();
        let retried = retry_failed(&ctx, &FailedQuery::default(), &serial, &cancel)
            .await
            .unwrap();
        assert_eq!(retried.uploaded, 2);
        assert_eq!(services.api.completed_uploads().len(), 6);
        assert_eq!(ctx.ledger.stats().unwrap().success, 3);
    }

    #[tokio::test]
    async fn test_reupload_clears_success_and_uploads_again() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), "v/once.mp4", b"once");
        let (ctx, services) = context(FakeCatalog::default());
        let cancel = CancellationToken::new();

        upload(&ctx, &[path.clone()], &UploadOptions::default(), &cancel)
            .await
            .unwrap();
        let first = ctx.ledger.export().unwrap()[0].clone();

        // dry-run 不改变记录
        let preview = reupload(
            &ctx,
            &ReuploadTargets {
                paths: vec![path.clone()],
                ..Default::default()
            },
            &UploadOptions {
                dry_run: true,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(preview.outcomes[0].kind, OutcomeKind::SkippedDuplicate);
        assert_eq!(services.api.completed_uploads().len(), 1);

        let report = reupload(
            &ctx,
            &ReuploadTargets {
                video_ids: vec![first.remote_video_id.clone().unwrap()],
                ..Default::default()
            },
            &UploadOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(services.api.completed_uploads().len(), 2);
        let records = ctx.ledger.export().unwrap();
        assert_eq!(records.len(), 1);
        assert_ne!(records[0].remote_video_id, first.remote_video_id);
    }
}
