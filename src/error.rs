use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("{target} 连接超时 ({timeout_ms}ms)")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("DNS解析失败: {domain} - {reason}")]
    DnsResolutionFailed { domain: String, reason: String },

    #[error("HTTP 请求失败: {target} - {source}")]
    Request {
        target: String,
        source: reqwest::Error,
    },

    #[error("HTTP 响应格式错误: {0}")]
    MalformedResponse(String),

    #[error("指纹规则库解析失败: {0}")]
    RuleLoad(#[from] serde_json::Error),

    #[error("文件操作失败: {path}")]
    FileError {
        path: String,
        source: std::io::Error,
    },

    #[error("无法定位用户主目录，状态目录不可用")]
    StateDirUnavailable,

    #[error("下载失败: {url} - {reason}")]
    Download { url: String, reason: String },

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),
}

impl ScanError {
    /// 连接类错误由探测状态机的重试/降级逻辑吸收，不会暴露给调用方
    pub fn is_transport(&self) -> bool {
        match self {
            // 请求构造失败（如非法的 User-Agent）不重试
            ScanError::Request { source, .. } => !source.is_builder(),
            ScanError::Timeout { .. }
            | ScanError::DnsResolutionFailed { .. }
            | ScanError::MalformedResponse(_)
            | ScanError::IoError(_) => true,
            _ => false,
        }
    }

    pub fn user_hint(&self) -> Option<String> {
        match self {
            ScanError::Timeout { .. } => {
                Some("提示：尝试增加超时时间 (-t 参数) 或降低并发数 (-c 参数)".to_string())
            }
            ScanError::DnsResolutionFailed { .. } => {
                Some("提示：检查DNS服务器设置或网络连接".to_string())
            }
            ScanError::Request { .. } => {
                Some("提示：检查目标是否在线，或代理地址 (--proxy / --socks5) 是否可用".to_string())
            }
            ScanError::StateDirUnavailable | ScanError::Download { .. } => Some(
                "提示：可手动下载 technologies.json / resolvers.txt 到 ~/.tarantula/ 目录".to_string(),
            ),
            ScanError::RuleLoad(_) => {
                Some("提示：删除 ~/.tarantula/technologies.json 后重新运行以重新下载".to_string())
            }
            _ => None,
        }
    }
}
