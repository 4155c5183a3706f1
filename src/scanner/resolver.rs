use crate::error::ScanError;
use crate::scanner::constants::DNS_SERVER_PORT;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use rand::seq::IndexedRandom;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 只读的 DNS 服务器列表，每次拨号独立随机挑选，无共享游标
#[derive(Debug, Clone, Default)]
pub struct DnsServerPool {
    servers: Vec<SocketAddr>,
}

impl DnsServerPool {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self { servers }
    }

    /// 每行一个地址，支持 `IP` 或 `IP:PORT`，空行和 `#` 注释行忽略
    pub fn parse(text: &str) -> Self {
        let mut servers = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_server(line) {
                Some(addr) => servers.push(addr),
                None => debug!("忽略无效的 DNS 服务器地址: {}", line),
            }
        }
        Self { servers }
    }

    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let content = std::fs::read_to_string(path).map_err(|e| ScanError::FileError {
            path: path.display().to_string(),
            source: e,
        })?;
        let pool = Self::parse(&content);
        info!("已加载 {} 个 DNS 服务器: {:?}", pool.len(), path);
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    pub fn pick(&self) -> Option<SocketAddr> {
        self.servers.choose(&mut rand::rng()).copied()
    }

    pub async fn resolve(&self, host: &str, timeout: Duration) -> Result<Vec<IpAddr>, ScanError> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let server = self.pick().ok_or_else(|| ScanError::DnsResolutionFailed {
            domain: host.to_string(),
            reason: "DNS 服务器列表为空".to_string(),
        })?;

        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(server, Protocol::Udp));
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;

        let resolver = TokioAsyncResolver::tokio(config, opts);
        let response = resolver
            .lookup_ip(bare)
            .await
            .map_err(|e| ScanError::DnsResolutionFailed {
                domain: host.to_string(),
                reason: format!("{} (server {})", e, server),
            })?;

        let ips: Vec<IpAddr> = response.iter().collect();
        if ips.is_empty() {
            return Err(ScanError::DnsResolutionFailed {
                domain: host.to_string(),
                reason: format!("no addresses returned (server {})", server),
            });
        }
        debug!("{} 经 {} 解析为 {:?}", host, server, ips);
        Ok(ips)
    }
}

/// 每次解析都从池中随机挑选一个服务器
#[derive(Debug, Clone)]
pub struct PoolResolver {
    pool: Arc<DnsServerPool>,
    timeout: Duration,
}

impl PoolResolver {
    pub fn new(pool: Arc<DnsServerPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

impl Resolve for PoolResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let pool = self.pool.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let ips = pool.resolve(name.as_str(), timeout).await?;
            // 端口由连接器按 URL 覆盖
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<Addrs, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

fn parse_server(line: &str) -> Option<SocketAddr> {
    if let Ok(sock) = line.parse::<SocketAddr>() {
        return Some(sock);
    }
    let bare = line.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DNS_SERVER_PORT))
}
