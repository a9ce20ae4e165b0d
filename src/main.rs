use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tube_uploader::commands::{self, AppContext, DeleteTarget, ReuploadTargets, UploadOptions};
use tube_uploader::config::AppConfig;
use tube_uploader::logging;
use tube_uploader::persistence::{FailedQuery, UploadStatus};
use tube_uploader::uploader::{EventSink, OutcomeKind, RunReport, UploadEvent};

#[derive(Debug, Parser)]
#[command(name = "tube-up", version)]
#[command(about = "批量上传视频到 YouTube：内容去重、断点续传、每日配额管理", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, default_value = "config/app.toml")]
    config: PathBuf,

    /// 以 JSON 输出结果
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// 并行上传数（默认取配置）
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// 只预览，不上传也不写历史
    #[arg(long)]
    dry_run: bool,

    /// 添加到指定播放列表（默认使用文件夹名）
    #[arg(long)]
    playlist: Option<String>,
}

impl From<&RunArgs> for UploadOptions {
    fn from(args: &RunArgs) -> Self {
        UploadOptions {
            concurrency: args.concurrency,
            dry_run: args.dry_run,
            playlist: args.playlist.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 扫描文件夹并上传视频
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// 重置历史记录并重新上传
    #[command(group(ArgGroup::new("target").required(true).multiple(true).args(["paths", "hashes", "video_ids"])))]
    Reupload {
        #[arg(long = "path")]
        paths: Vec<PathBuf>,
        #[arg(long = "hash")]
        hashes: Vec<String>,
        #[arg(long = "video-id")]
        video_ids: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// 重试失败的上传
    Retry {
        /// 最多重试的记录数
        #[arg(long)]
        limit: Option<usize>,
        /// 只重试该时间之后失败的记录（YYYY-MM-DD 或 RFC 3339）
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,
        /// 错误信息包含该文本（不区分大小写）
        #[arg(long = "error")]
        error: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// 与远端视频列表对账
    Sync {
        /// 删除远端已不存在的成功记录
        #[arg(long)]
        fix: bool,
    },
    /// 查看今日配额
    Quota,
    /// 管理上传历史
    History {
        #[command(subcommand)]
        action: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    /// 列出记录
    List {
        #[arg(long)]
        status: Option<UploadStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// 各状态的记录数
    Stats,
    /// 删除记录
    #[command(group(ArgGroup::new("target").required(true).args(["hash", "path", "video_id"])))]
    Delete {
        #[arg(long)]
        hash: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long = "video-id")]
        video_id: Option<String>,
    },
    /// 导出为 JSON
    Export { path: PathBuf },
    /// 从 JSON 导入
    Import { path: PathBuf },
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| format!("无法解析时间: {}", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_or_default(&cli.config).await?;
    let _log_guard = logging::init_logging(&config.log);
    info!("tube-uploader v{} 启动", env!("CARGO_PKG_VERSION"));

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));
    let ctx = AppContext::open(config)?.with_events(EventSink::new(tx));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在停止（当前分片完成后退出）...");
            signal_cancel.cancel();
        }
    });

    let result = execute(&cli, &ctx, &cancel).await;

    // 关闭事件通道，等待输出结束
    drop(ctx);
    let _ = printer.await;
    result
}

async fn execute(cli: &Cli, ctx: &AppContext, cancel: &CancellationToken) -> Result<()> {
    match &cli.command {
        Command::Upload { paths, run } => {
            let report = commands::upload(ctx, paths, &run.into(), cancel).await?;
            print_report(&report, cli.json)
        }
        Command::Reupload {
            paths,
            hashes,
            video_ids,
            run,
        } => {
            let targets = ReuploadTargets {
                paths: paths.clone(),
                hashes: hashes.clone(),
                video_ids: video_ids.clone(),
            };
            let report = commands::reupload(ctx, &targets, &run.into(), cancel).await?;
            print_report(&report, cli.json)
        }
        Command::Retry {
            limit,
            since,
            error,
            run,
        } => {
            let query = FailedQuery {
                limit: *limit,
                since: *since,
                error_substring: error.clone(),
            };
            let report = commands::retry_failed(ctx, &query, &run.into(), cancel).await?;
            print_report(&report, cli.json)
        }
        Command::Sync { fix } => {
            let outcome = commands::sync_remote(ctx, *fix).await?;
            if cli.json {
                return print_json(&outcome);
            }
            println!(
                "远端视频 {} 个，一致 {} 条，差异 {} 条",
                outcome.remote_videos,
                outcome.diff.in_sync,
                outcome.diff.divergences.len()
            );
            for d in &outcome.diff.divergences {
                let path = d.record.as_ref().map(|r| r.file_path.as_str()).unwrap_or("-");
                println!(
                    "  {:<12} {:<14} {}  {}",
                    format!("{:?}", d.kind),
                    d.remote_video_id.as_deref().unwrap_or("-"),
                    path,
                    d.detail
                );
            }
            if let Some(fix) = &outcome.fix {
                println!("修复: 删除 {}，失败 {}，跳过 {}", fix.repaired, fix.failed, fix.skipped);
            }
            Ok(())
        }
        Command::Quota => {
            let status = commands::quota_status(ctx)?;
            if cli.json {
                return print_json(&status);
            }
            println!("日期: {}", status.date);
            println!("已用: {} / {} units", status.consumed, status.limit);
            println!(
                "剩余: {} units（约 {} 个视频，每个 {} units）",
                status.remaining, status.uploads_remaining, status.cost_per_upload
            );
            println!(
                "今日已上传: {} 个，{:.1} MB",
                status.uploaded_today,
                status.bytes_today as f64 / 1024.0 / 1024.0
            );
            Ok(())
        }
        Command::History { action } => execute_history(action, ctx, cli.json).await,
    }
}

async fn execute_history(action: &HistoryCommand, ctx: &AppContext, json: bool) -> Result<()> {
    match action {
        HistoryCommand::List { status, limit } => {
            let records = commands::history_list(ctx, *status, Some(*limit))?;
            if json {
                return print_json(&records);
            }
            for r in &records {
                println!(
                    "{}  {:<16} {:<12} {}  {}",
                    r.updated_at.format("%Y-%m-%d %H:%M"),
                    r.status,
                    r.remote_video_id.as_deref().unwrap_or("-"),
                    r.file_path,
                    r.error_message.as_deref().unwrap_or("")
                );
            }
            println!("共 {} 条", records.len());
        }
        HistoryCommand::Stats => {
            let stats = commands::history_stats(ctx)?;
            if json {
                return print_json(&stats);
            }
            println!(
                "共 {} 条: 成功 {}，上传中 {}，待上传 {}，可重试失败 {}，永久失败 {}",
                stats.total(),
                stats.success,
                stats.uploading,
                stats.pending,
                stats.failed_retryable,
                stats.failed_permanent
            );
            println!("已上传 {:.1} MB", stats.uploaded_bytes as f64 / 1024.0 / 1024.0);
        }
        HistoryCommand::Delete {
            hash,
            path,
            video_id,
        } => {
            let target = match (hash, path, video_id) {
                (Some(h), _, _) => DeleteTarget::Hash(h.clone()),
                (_, Some(p), _) => DeleteTarget::Path(p.clone()),
                (_, _, Some(v)) => DeleteTarget::VideoId(v.clone()),
                _ => anyhow::bail!("需要指定 --hash、--path 或 --video-id"),
            };
            let removed = commands::history_delete(ctx, &target)?;
            println!("已删除 {} 条记录", removed);
        }
        HistoryCommand::Export { path } => {
            let count = commands::history_export(ctx, path).await?;
            println!("已导出 {} 条记录到 {}", count, path.display());
        }
        HistoryCommand::Import { path } => {
            let summary = commands::history_import(ctx, path).await?;
            if json {
                return print_json(&summary);
            }
            println!(
                "导入完成: 新增 {}，升级 {}，跳过 {}",
                summary.imported, summary.upgraded, summary.skipped
            );
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    for outcome in &report.outcomes {
        let label = match outcome.kind {
            OutcomeKind::Uploaded => "✓ 上传",
            OutcomeKind::Unrecorded => "! 未入账",
            OutcomeKind::SkippedDuplicate => "= 跳过",
            OutcomeKind::FailedRetryable => "! 可重试",
            OutcomeKind::FailedPermanent => "✗ 失败",
            OutcomeKind::Cancelled => "- 取消",
            OutcomeKind::NotAttempted => "- 未开始",
            OutcomeKind::Preview => "? 预览",
        };
        let detail = outcome
            .video_id
            .as_deref()
            .or(outcome.title.as_deref())
            .unwrap_or("");
        println!("{} {} {}", label, outcome.path.display(), detail);
        if let Some(error) = &outcome.error {
            println!("      {}", error);
        }
        if let Some(error) = &outcome.playlist_error {
            println!("      播放列表: {}", error);
        }
    }

    println!(
        "\n上传 {}，跳过 {}，可重试失败 {}，永久失败 {}，取消 {}，未开始 {}，耗时 {:.1}s",
        report.uploaded,
        report.skipped_duplicate,
        report.failed_retryable,
        report.failed_permanent,
        report.cancelled,
        report.not_attempted,
        report.elapsed.as_secs_f64()
    );
    if report.unrecorded > 0 {
        println!("{} 个视频已上传但未写入历史，请运行 sync 对账", report.unrecorded);
    }
    if report.previewed > 0 {
        println!("预览 {} 个文件（dry-run）", report.previewed);
    }
    if let Some(reason) = &report.halted {
        println!("已停止接收新文件: {}", reason);
    }
    Ok(())
}

/// 把进度事件写入日志
async fn print_events(mut rx: mpsc::UnboundedReceiver<UploadEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            UploadEvent::Progress {
                path,
                uploaded,
                total,
            } => {
                let percent = if total == 0 {
                    100.0
                } else {
                    uploaded as f64 * 100.0 / total as f64
                };
                info!(
                    "进度 {:>5.1}% {}",
                    percent,
                    path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                );
            }
            UploadEvent::Halted { reason } => warn!("配额耗尽，停止领取新文件: {}", reason),
            _ => {}
        }
    }
}
