use crate::error::ScanError;
use crate::scanner::constants::{
    DOWNLOAD_TIMEOUT, RESOLVERS_FILE, RESOLVERS_URL, STATE_DIR_NAME, TECHNOLOGIES_FILE, TECHNOLOGIES_URL,
};
use crate::scanner::fingerprint_db::RuleStore;
use crate::scanner::resolver::DnsServerPool;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 本地状态目录，缓存指纹库和 DNS 服务器列表
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.tarantula`
    pub fn home() -> Result<Self, ScanError> {
        dirs::home_dir()
            .map(|home| Self::new(home.join(STATE_DIR_NAME)))
            .ok_or(ScanError::StateDirUnavailable)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    /// 文件不存在时从 `url` 下载，已存在则直接返回路径
    pub async fn ensure(&self, file: &str, url: &str) -> Result<PathBuf, ScanError> {
        let path = self.path(file);
        if path.exists() {
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ScanError::FileError {
                path: self.root.display().to_string(),
                source: e,
            })?;

        info!("正在下载 {} -> {:?}", url, path);
        let bytes = download(url).await?;

        // 先写临时文件再改名，避免中断后留下半个文件
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| ScanError::FileError {
            path: tmp.display().to_string(),
            source: e,
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| ScanError::FileError {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(path)
    }

    /// 规则文件损坏时告警并退化为空规则库
    pub async fn load_rules(&self) -> Result<RuleStore, ScanError> {
        self.load_rules_from(TECHNOLOGIES_URL).await
    }

    pub async fn load_rules_from(&self, url: &str) -> Result<RuleStore, ScanError> {
        let path = self.ensure(TECHNOLOGIES_FILE, url).await?;
        match RuleStore::from_path(&path) {
            Ok(store) => Ok(store),
            Err(e @ ScanError::RuleLoad(_)) => {
                warn!("{}，技术识别将返回空结果", e);
                Ok(RuleStore::empty())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn load_resolvers(&self) -> Result<DnsServerPool, ScanError> {
        self.load_resolvers_from(RESOLVERS_URL).await
    }

    pub async fn load_resolvers_from(&self, url: &str) -> Result<DnsServerPool, ScanError> {
        let path = self.ensure(RESOLVERS_FILE, url).await?;
        let pool = DnsServerPool::load(&path)?;
        if pool.is_empty() {
            return Err(ScanError::ConfigError(format!("DNS 服务器列表为空: {:?}", path)));
        }
        info!("已加载 {} 个 DNS 服务器", pool.len());
        Ok(pool)
    }
}

async fn download(url: &str) -> Result<Vec<u8>, ScanError> {
    let fail = |reason: String| ScanError::Download {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .user_agent(concat!("tarantula/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| fail(e.to_string()))?;

    let resp = client.get(url).send().await.map_err(|e| fail(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(fail(format!("HTTP {}", resp.status())));
    }
    let bytes = resp.bytes().await.map_err(|e| fail(e.to_string()))?;
    Ok(bytes.to_vec())
}
