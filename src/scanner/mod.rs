pub mod constants;
pub mod fingerprint_db;
pub mod http;
pub mod probe;
pub mod resolver;
#[cfg(test)]
mod test_support;
pub mod transport;
pub mod web_fingerprints;
pub mod webtitle;

use crate::error::ScanError;
use crate::output::AssetResult;
use crate::scanner::constants::{DEFAULT_PORTS, DEFAULT_RETRY, DEFAULT_THREADS, DEFAULT_TIMEOUT, DEFAULT_USER_AGENTS, RESULT_CHANNEL_SIZE};
use crate::scanner::fingerprint_db::RuleStore;
use crate::scanner::http::HttpClient;
use crate::scanner::probe::ProbeContext;
use crate::scanner::resolver::DnsServerPool;
use crate::scanner::transport::Transport;
use crate::target::{enumerate_targets, Target};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

/// 一次扫描共享的只读配置
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub threads: usize,
    pub ports: Vec<u16>,
    pub user_agents: Vec<String>,
    pub timeout: Duration,
    pub retry: usize,
    pub transport: Transport,
    pub with_body: bool,
    pub with_title: bool,
    pub rules: Option<Arc<RuleStore>>,
    pub excluded_status: HashSet<u16>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            ports: DEFAULT_PORTS.to_vec(),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            timeout: DEFAULT_TIMEOUT,
            retry: DEFAULT_RETRY,
            transport: Transport::Direct,
            with_body: false,
            with_title: false,
            rules: None,
            excluded_status: HashSet::new(),
        }
    }
}

impl ProbeSettings {
    /// 标题、指纹和正文都依赖响应体
    pub fn needs_body(&self) -> bool {
        self.with_body || self.with_title || self.rules.is_some()
    }

    pub fn http_client(&self) -> Result<HttpClient, ScanError> {
        Ok(HttpClient::new(&self.transport, &self.user_agents, self.timeout)?.read_body(self.needs_body()))
    }
}

/// 一次扫描内所有协程共享
struct ScanShared {
    settings: ProbeSettings,
    client: HttpClient,
    // 跨域二次探测同样受线程数限制
    secondary_slots: Semaphore,
}

#[derive(Debug, Clone, Default)]
pub struct Prober {
    settings: ProbeSettings,
}

impl Prober {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.settings.threads = threads.max(1);
        self
    }

    pub fn ports(mut self, ports: Vec<u16>) -> Self {
        self.settings.ports = ports;
        self
    }

    /// 空列表时保留内置 UA
    pub fn user_agents(mut self, user_agents: Vec<String>) -> Self {
        if !user_agents.is_empty() {
            self.settings.user_agents = user_agents;
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: usize) -> Self {
        self.settings.retry = retry;
        self
    }

    // 传输方式只有一种生效，后设置的覆盖先设置的
    pub fn http_proxy(mut self, addr: impl Into<String>) -> Self {
        self.settings.transport = Transport::HttpProxy(addr.into());
        self
    }

    pub fn socks_proxy(mut self, addr: impl Into<String>) -> Self {
        self.settings.transport = Transport::Socks5(addr.into());
        self
    }

    pub fn random_dns(mut self, pool: Arc<DnsServerPool>) -> Self {
        self.settings.transport = Transport::RandomDns(pool);
        self
    }

    pub fn with_body(mut self) -> Self {
        self.settings.with_body = true;
        self
    }

    pub fn with_title(mut self) -> Self {
        self.settings.with_title = true;
        self
    }

    pub fn with_technologies(mut self, rules: Arc<RuleStore>) -> Self {
        self.settings.rules = Some(rules);
        self
    }

    pub fn exclude_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.settings.excluded_status.extend(codes);
        self
    }

    /// 启动扫描并返回结果流，全部探测（含跨域二次探测）结束后流关闭
    pub fn scan_stream(&self, domain: &str, subdomains: Vec<String>) -> Result<mpsc::Receiver<AssetResult>, ScanError> {
        let threads = self.settings.threads.max(1);
        let shared = Arc::new(ScanShared {
            settings: self.settings.clone(),
            client: self.settings.http_client()?,
            secondary_slots: Semaphore::new(threads),
        });
        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_SIZE);
        let (work_tx, work_rx) = mpsc::channel::<Target>(threads);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let ports = self.settings.ports.clone();
        tokio::spawn(async move {
            for target in enumerate_targets(&subdomains, &ports) {
                if work_tx.send(target).await.is_err() {
                    break;
                }
            }
        });

        let mut workers = JoinSet::new();
        for _ in 0..threads {
            let shared = shared.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let domain = domain.to_string();
            workers.spawn(async move {
                loop {
                    let next = {
                        let mut rx = work_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(target) = next else { break };
                    let ctx = ProbeContext::new(&domain, &target.subdomain, target.port, shared.settings.retry);
                    if !run_probe(&shared, ctx, &result_tx).await {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        tokio::spawn(async move {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    warn!("探测任务异常退出: {}", e);
                }
            }
            debug!("所有工作协程已结束");
        });

        Ok(result_rx)
    }

    pub async fn scan(&self, domain: &str, subdomains: Vec<String>) -> Result<Vec<AssetResult>, ScanError> {
        let mut rx = self.scan_stream(domain, subdomains)?;
        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        Ok(results)
    }

    /// 并发请求同一资产若干次，状态码全部一致时返回
    pub async fn check_consistent_status(&self, asset: &str, attempts: usize) -> Option<u16> {
        if attempts == 0 {
            return None;
        }
        let url = match parse_asset(asset) {
            Some(url) => url,
            None => {
                debug!("无法解析资产地址: {}", asset);
                return None;
            }
        };
        let client = match HttpClient::new(&self.settings.transport, &self.settings.user_agents, self.settings.timeout) {
            Ok(client) => client,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let statuses = join_all((0..attempts).map(|_| async {
            client.get(&url).await.ok().map(|resp| resp.status)
        }))
        .await;
        probe::consistent_status(&statuses)
    }
}

/// 返回 false 表示结果接收端已关闭
async fn run_probe(shared: &Arc<ScanShared>, ctx: ProbeContext, tx: &mpsc::Sender<AssetResult>) -> bool {
    let outcome = probe::probe(&shared.settings, &shared.client, ctx).await;

    if let Some(next) = outcome.secondary {
        let shared = shared.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let Ok(_slot) = shared.secondary_slots.acquire().await else {
                return;
            };
            if let Some(result) = probe::probe(&shared.settings, &shared.client, next).await.result {
                let _ = tx.send(result).await;
            }
        });
    }

    match outcome.result {
        Some(result) => tx.send(result).await.is_ok(),
        None => true,
    }
}

fn parse_asset(asset: &str) -> Option<Url> {
    let asset = asset.trim();
    if asset.contains("://") {
        Url::parse(asset).ok()
    } else {
        Url::parse(&format!("https://{}", asset)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::test_support::spawn_dns_server;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    struct Flaky(AtomicUsize);

    impl Respond for Flaky {
        fn respond(&self, _: &Request) -> ResponseTemplate {
            if self.0.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                ResponseTemplate::new(200)
            } else {
                ResponseTemplate::new(503)
            }
        }
    }

    #[test]
    fn test_builder() {
        let prober = Prober::new()
            .threads(0)
            .ports(vec![80, 8080])
            .user_agents(Vec::new())
            .retry(1)
            .with_title()
            .exclude_status_codes([404])
            .socks_proxy("127.0.0.1:1080");
        let s = prober.settings();
        assert_eq!(s.threads, 1);
        assert_eq!(s.ports, vec![80, 8080]);
        assert_eq!(s.user_agents.len(), DEFAULT_USER_AGENTS.len());
        assert!(s.needs_body());
        assert!(s.excluded_status.contains(&404));
        assert_eq!(s.transport.name(), "socks5");
    }

    #[test]
    fn test_parse_asset() {
        assert_eq!(parse_asset("http://a.com:8080").unwrap().as_str(), "http://a.com:8080/");
        assert_eq!(parse_asset("a.com").unwrap().scheme(), "https");
        assert!(parse_asset("http://").is_none());
    }

    #[tokio::test]
    async fn test_scan_stream_collects_reachable_assets() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<title>ok</title>"))
            .mount(&mock_server)
            .await;
        let port = mock_server.address().port();

        let prober = Prober::new()
            .threads(4)
            .ports(vec![port])
            .retry(0)
            .timeout(Duration::from_secs(2))
            .with_title();
        let results = prober
            .scan("127.0.0.1", vec!["127.0.0.1".to_string(), "unreachable.invalid".to_string()])
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].asset, format!("http://127.0.0.1:{}", port));
        assert_eq!(results[0].title.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_scan_with_no_targets_closes_stream() {
        let prober = Prober::new().threads(3);
        let mut rx = prober.scan_stream("example.com", Vec::new()).unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_each_target_scanned_once() {
        let (dns_addr, _) = spawn_dns_server().await;
        let mut servers = Vec::new();
        for _ in 0..3 {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&mock_server)
                .await;
            servers.push(mock_server);
        }
        let ports: Vec<u16> = servers.iter().map(|s| s.address().port()).collect();
        let subdomains: Vec<String> = (0..12).map(|i| format!("sub{}.scan.test", i)).collect();

        let prober = Prober::new()
            .threads(8)
            .ports(ports.clone())
            .retry(0)
            .timeout(Duration::from_secs(3))
            .random_dns(Arc::new(DnsServerPool::new(vec![dns_addr])));
        let results = prober.scan("scan.test", subdomains.clone()).await.unwrap();

        let assets: HashSet<String> = results.iter().map(|r| r.asset.clone()).collect();
        assert_eq!(results.len(), subdomains.len() * ports.len());
        assert_eq!(assets.len(), results.len());

        for server in &servers {
            let port = server.address().port();
            let mut per_host: HashMap<String, usize> = HashMap::new();
            for request in server.received_requests().await.unwrap() {
                let host = request.headers.get("host").unwrap().to_str().unwrap().to_string();
                *per_host.entry(host).or_default() += 1;
            }
            assert_eq!(per_host.len(), subdomains.len());
            for sub in &subdomains {
                assert_eq!(per_host.get(&format!("{}:{}", sub, port)), Some(&1));
            }
        }
    }

    #[tokio::test]
    async fn test_foreign_redirect_result_delivered() {
        let landing = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<title>landing</title>"))
            .mount(&landing)
            .await;
        let entry = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(301)
                    .insert_header("Location", format!("http://127.0.0.1:{}/landing", landing.address().port())),
            )
            .mount(&entry)
            .await;

        let prober = Prober::new()
            .ports(vec![entry.address().port()])
            .retry(0)
            .timeout(Duration::from_secs(3))
            .with_title();
        let mut results = prober.scan("scan.test", vec!["127.0.0.1".to_string()]).await.unwrap();
        results.sort_by_key(|r| r.status_code);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status_code, 200);
        assert_eq!(results[0].asset, format!("http://127.0.0.1:{}", landing.address().port()));
        assert_eq!(results[0].title.as_deref(), Some("landing"));
        assert_eq!(results[0].domain, "scan.test");
        assert_eq!(results[1].status_code, 301);
    }

    #[tokio::test]
    async fn test_secondary_requests_share_thread_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let slow_port = listener.local_addr().unwrap().port();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                while let Ok((mut sock, _)) = listener.accept().await {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    tokio::spawn(async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        let mut buf = [0u8; 1024];
                        let _ = sock.read(&mut buf).await;
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        let _ = sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            });
        }
        let entry = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", format!("http://127.0.0.1:{}/", slow_port)))
            .mount(&entry)
            .await;

        let prober = Prober::new()
            .threads(1)
            .ports(vec![entry.address().port()])
            .retry(0)
            .timeout(Duration::from_secs(3));
        let subdomains = vec!["127.0.0.1".to_string(); 4];
        let results = prober.scan("scan.test", subdomains).await.unwrap();

        assert_eq!(results.iter().filter(|r| r.status_code == 200).count(), 4);
        assert_eq!(results.iter().filter(|r| r.status_code == 302).count(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consistent_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        let asset = format!("http://127.0.0.1:{}", mock_server.address().port());
        let prober = Prober::new();
        assert_eq!(prober.check_consistent_status(&asset, 3).await, Some(200));
        assert_eq!(prober.check_consistent_status(&asset, 0).await, None);
    }

    #[tokio::test]
    async fn test_inconsistent_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(Flaky(AtomicUsize::new(0)))
            .mount(&mock_server)
            .await;
        let asset = format!("http://127.0.0.1:{}", mock_server.address().port());
        assert_eq!(Prober::new().check_consistent_status(&asset, 4).await, None);
    }
}
