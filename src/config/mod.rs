// 配置管理模块

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 远端要求分片大小为 256KB 的整数倍（最后一片除外）
pub const CHUNK_ALIGNMENT: u64 = 256 * 1024;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 每日配额配置
    #[serde(default)]
    pub quota: QuotaConfig,
    /// 上传历史数据库配置
    #[serde(default)]
    pub history: HistoryConfig,
    /// YouTube API 配置
    #[serde(default)]
    pub youtube: YoutubeConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 并行 worker 数（默认 1，远端对并发上传较敏感）
    pub workers: usize,
    /// 分片大小（字节），必须是 256KB 的整数倍
    pub chunk_size: u64,
    /// 单个文件的最大尝试次数
    pub retry_count: u32,
    /// 退避基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 退避最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 遇到限流信号时的最小等待（毫秒）
    pub rate_limit_delay_ms: u64,
    /// 单次网络请求超时（秒）
    pub request_timeout_secs: u64,
    /// 扫描目录时跳过隐藏文件
    pub skip_hidden_files: bool,
    /// 视频默认可见性：private / unlisted / public
    pub privacy_status: String,
    /// 视频分类 ID
    pub category_id: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            chunk_size: 4 * 1024 * 1024,
            retry_count: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            rate_limit_delay_ms: 10_000,
            request_timeout_secs: 120,
            skip_hidden_files: true,
            privacy_status: "private".to_string(),
            category_id: "22".to_string(),
        }
    }
}

impl UploadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 每日配额配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// 每日配额上限（单位）
    pub daily_limit: u64,
    /// 单次上传的预估消耗
    pub cost_per_upload: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 10_000,
            cost_per_upload: 1_600,
        }
    }
}

/// 上传历史配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// SQLite 数据库路径
    pub db_path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/upload_history.db"),
        }
    }
}

/// YouTube API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YoutubeConfig {
    /// Data API 根地址
    pub api_base: String,
    /// 上传 API 根地址
    pub upload_base: String,
    /// 访问令牌文件（由外部授权工具写入）
    pub token_file: PathBuf,
    /// 自动创建播放列表时使用的可见性
    pub playlist_privacy: String,
}

impl Default for YoutubeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/youtube/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/youtube/v3".to_string(),
            token_file: PathBuf::from("config/token.json"),
            playlist_privacy: "private".to_string(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }
        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载配置；文件不存在时写入默认配置
    ///
    /// 文件存在但无效时返回错误，不会用默认值覆盖用户的配置。
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            let config = Self::load_from_file(path).await?;
            tracing::info!("配置文件加载成功: {:?}", path);
            return Ok(config);
        }

        tracing::warn!("配置文件不存在，使用默认配置: {:?}", path);
        let config = Self::default();
        if let Err(e) = config.save_to_file(path).await {
            tracing::error!("保存默认配置失败: {:#}", e);
        }
        Ok(config)
    }

    /// 校验配置；任何错误都应在启动 worker 之前终止运行
    pub fn validate(&self) -> Result<()> {
        let upload = &self.upload;
        if upload.workers == 0 {
            bail!("upload.workers 必须至少为 1");
        }
        if upload.chunk_size == 0 || upload.chunk_size % CHUNK_ALIGNMENT != 0 {
            bail!(
                "upload.chunk_size 必须是 {} 字节的正整数倍，当前 {}",
                CHUNK_ALIGNMENT,
                upload.chunk_size
            );
        }
        if upload.retry_count == 0 {
            bail!("upload.retry_count 必须至少为 1");
        }
        if upload.base_delay_ms == 0 || upload.base_delay_ms > upload.max_delay_ms {
            bail!(
                "退避延迟无效: base_delay_ms={} max_delay_ms={}",
                upload.base_delay_ms,
                upload.max_delay_ms
            );
        }

        let quota = &self.quota;
        if quota.cost_per_upload == 0 {
            bail!("quota.cost_per_upload 必须大于 0");
        }
        if quota.daily_limit < quota.cost_per_upload {
            bail!(
                "quota.daily_limit ({}) 小于单次上传消耗 ({})，无法上传任何文件",
                quota.daily_limit,
                quota.cost_per_upload
            );
        }
        Ok(())
    }
}
