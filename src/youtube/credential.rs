// 访问令牌读取
//
// 令牌的授权与续期由外部工具完成并写入 JSON 文件，这里只负责读取。

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::remote::CredentialProvider;

#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// 从文件读取 bearer 令牌
pub struct FileTokenProvider {
    path: PathBuf,
    cached: RwLock<Option<String>>,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_token(&self) -> Result<String> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("读取令牌文件失败: {}", self.path.display()))?;
        let token: TokenFile = serde_json::from_str(&content)
            .with_context(|| format!("解析令牌文件失败: {}", self.path.display()))?;

        if token.access_token.trim().is_empty() {
            bail!("令牌文件中 access_token 为空: {}", self.path.display());
        }
        if let Some(expires_at) = token.expires_at {
            if expires_at <= Utc::now() {
                bail!("访问令牌已于 {} 过期", expires_at);
            }
        }
        Ok(token.access_token)
    }
}

#[async_trait]
impl CredentialProvider for FileTokenProvider {
    async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.cached.read().await.as_ref() {
            return Ok(token.clone());
        }
        let token = self.read_token().await?;
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }

    /// 重新读取文件；令牌未变化视为刷新失败
    async fn refresh(&self) -> Result<String> {
        let mut cached = self.cached.write().await;
        let token = self.read_token().await?;
        if cached.as_deref() == Some(token.as_str()) {
            warn!("令牌文件未更新: {}", self.path.display());
            bail!("access token in {} was rejected and has not been renewed", self.path.display());
        }
        info!("已重新加载访问令牌");
        *cached = Some(token.clone());
        Ok(token)
    }
}
