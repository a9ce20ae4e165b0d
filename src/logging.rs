//! 日志系统
//!
//! 控制台输出 + 可选的文件持久化。文件按单次运行的启动时间命名，超过大小上限后
//! 滚动到 `_N` 后缀文件，启动时清理超过保留天数的旧文件。

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "tube-uploader.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RotatingFile {
    /// 本次运行的启动时间戳（YYYY-MM-DD-HHMMSS）
    run_stamp: String,
    dir: PathBuf,
    file: Option<File>,
    /// 0 为基础文件，之后每次滚动加 1
    index: u32,
    max_size: u64,
    written: u64,
}

impl RotatingFile {
    fn open(dir: PathBuf, max_size: u64) -> io::Result<Self> {
        let mut rotating = Self {
            run_stamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            dir,
            file: None,
            index: 0,
            max_size,
            written: 0,
        };
        rotating.open_current()?;
        Ok(rotating)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}{}", LOG_FILE_PREFIX, self.run_stamp, LOG_FILE_SUFFIX)
        } else {
            format!(
                "{}{}_{}{}",
                LOG_FILE_PREFIX, self.run_stamp, index, LOG_FILE_SUFFIX
            )
        };
        self.dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_chunk(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超大日志导致无限滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            if let Some(mut old) = self.file.take() {
                old.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小滚动的日志写入器，可克隆后交给 `tracing_appender`
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl LogFileWriter {
    pub fn new(dir: PathBuf, max_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile::open(dir, max_size)?)),
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_chunk(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

/// 日志守卫，drop 后文件写入线程退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化全局日志订阅器
///
/// `RUST_LOG` 优先于配置中的级别。文件层创建失败时回退到仅控制台输出。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        match fs::create_dir_all(&config.log_dir)
            .and_then(|_| LogFileWriter::new(config.log_dir.clone(), config.max_file_size))
        {
            Ok(w) => Some(w),
            Err(e) => {
                eprintln!("日志文件初始化失败: {:?}, 错误: {}，仅输出到控制台", config.log_dir, e);
                None
            }
        }
    } else {
        None
    };

    let Some(writer) = writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留{}天, 级别={}, 单文件上限={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(guard),
    }
}

/// 删除超过保留天数的日志文件，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let retention = chrono::Duration::days(retention_days as i64);
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() {
            continue;
        }
        let Some(date) = log_file_date(name) else {
            continue;
        };
        if today.signed_duration_since(date) <= retention {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志: {:?}", path);
            }
            Err(e) => warn!("删除过期日志失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}

/// 从 `tube-uploader.YYYY-MM-DD-HHMMSS[_N].log` 中取出日期
fn log_file_date(filename: &str) -> Option<NaiveDate> {
    let stem = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date_part = stem.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
