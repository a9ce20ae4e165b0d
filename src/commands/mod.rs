// 命令层
//
// 每个子命令对应一个库函数，命令行只负责解析参数和展示结果。

pub mod history;
pub mod maintenance;
pub mod upload;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::metadata::{DefaultMetadataProvider, MetadataProvider};
use crate::persistence::{HistoryLedger, SqliteQuotaStore};
use crate::quota::QuotaArbiter;
use crate::remote::{CredentialProvider, PlaylistAttacher, RemoteCatalog, VideoUploadApi};
use crate::uploader::{
    EventSink, RetryPolicy, RunOptions, TransferEngine, TransferSettings, UploadOrchestrator,
};
use crate::youtube::{FileTokenProvider, YoutubeClient};

pub use history::{
    history_delete, history_export, history_import, history_list, history_stats, DeleteTarget,
};
pub use maintenance::{quota_status, sync_remote, QuotaStatus, SyncOutcome};
pub use upload::{reupload, retry_failed, upload, ReuploadTargets, UploadOptions};

/// 远端协作者
#[derive(Clone)]
pub struct RemoteServices {
    pub api: Arc<dyn VideoUploadApi>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub playlists: Arc<dyn PlaylistAttacher>,
    pub catalog: Arc<dyn RemoteCatalog>,
}

/// 命令运行所需的全部服务
#[derive(Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub ledger: Arc<HistoryLedger>,
    pub quota: Arc<QuotaArbiter>,
    pub remote: RemoteServices,
    pub metadata: Arc<dyn MetadataProvider>,
    pub events: EventSink,
}

impl AppContext {
    /// 根据配置打开账本与配额存储，并创建 YouTube 客户端
    ///
    /// 配置无效或账本无法打开时直接返回错误。
    pub fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let db_path = &config.history.db_path;
        let ledger = Arc::new(
            HistoryLedger::open(db_path)
                .with_context(|| format!("无法打开上传历史: {}", db_path.display()))?,
        );
        let quota_store = Arc::new(
            SqliteQuotaStore::open(db_path)
                .with_context(|| format!("无法打开配额状态: {}", db_path.display()))?,
        );
        let quota = Arc::new(QuotaArbiter::new(config.quota.daily_limit, quota_store)?);

        let credentials: Arc<dyn CredentialProvider> =
            Arc::new(FileTokenProvider::new(config.youtube.token_file.clone()));
        let client = Arc::new(YoutubeClient::new(&config.youtube, credentials.clone())?);
        let remote = RemoteServices {
            api: client.clone(),
            credentials,
            playlists: client.clone(),
            catalog: client,
        };

        info!("服务初始化完成: 账本={}", db_path.display());
        Ok(Self::from_parts(config, ledger, quota, remote))
    }

    /// 使用现成的服务组装
    pub fn from_parts(
        config: AppConfig,
        ledger: Arc<HistoryLedger>,
        quota: Arc<QuotaArbiter>,
        remote: RemoteServices,
    ) -> Self {
        let metadata = Arc::new(DefaultMetadataProvider::new(
            config.upload.privacy_status.clone(),
            config.upload.category_id.clone(),
        ));
        Self {
            config,
            ledger,
            quota,
            remote,
            metadata,
            events: EventSink::none(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn orchestrator(&self) -> UploadOrchestrator {
        let upload = &self.config.upload;
        let engine = TransferEngine::new(
            self.remote.api.clone(),
            self.remote.credentials.clone(),
            RetryPolicy::from_config(upload),
            TransferSettings {
                chunk_size: upload.chunk_size,
                request_timeout: upload.request_timeout(),
            },
        )
        .with_events(self.events.clone());

        UploadOrchestrator::new(
            self.ledger.clone(),
            self.quota.clone(),
            engine,
            self.metadata.clone(),
            self.remote.playlists.clone(),
            self.config.quota.cost_per_upload,
        )
        .with_fallback(&upload.privacy_status, &upload.category_id)
        .with_events(self.events.clone())
    }

    pub(crate) fn run_options(&self, options: &UploadOptions) -> RunOptions {
        RunOptions {
            concurrency: options.concurrency.unwrap_or(self.config.upload.workers).max(1),
            dry_run: options.dry_run,
            playlist: options.playlist.clone(),
        }
    }
}
