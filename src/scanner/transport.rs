use crate::error::ScanError;
use crate::scanner::resolver::{DnsServerPool, PoolResolver};
use reqwest::{ClientBuilder, Proxy};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// 请求到达目标的方式
#[derive(Debug, Clone, Default)]
pub enum Transport {
    #[default]
    Direct,
    HttpProxy(String),
    Socks5(String),
    RandomDns(Arc<DnsServerPool>),
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Direct => "direct",
            Transport::HttpProxy(_) => "http-proxy",
            Transport::Socks5(_) => "socks5",
            Transport::RandomDns(_) => "random-dns",
        }
    }

    /// 把连接方式套到客户端上。系统代理环境变量不生效，只认命令行指定的代理
    pub fn configure(&self, builder: ClientBuilder, timeout: Duration) -> Result<ClientBuilder, ScanError> {
        let builder = builder.no_proxy();
        let builder = match self {
            Transport::Direct => builder,
            Transport::HttpProxy(addr) => builder.proxy(proxy(addr, "http")?),
            // socks5h：目标域名交给代理解析
            Transport::Socks5(addr) => builder.proxy(proxy(addr, "socks5h")?),
            Transport::RandomDns(pool) => builder.dns_resolver(Arc::new(PoolResolver::new(pool.clone(), timeout))),
        };
        Ok(builder)
    }
}

fn proxy(addr: &str, scheme: &str) -> Result<Proxy, ScanError> {
    let url = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("{}://{}", scheme, addr)
    };
    Proxy::all(&url).map_err(|e| ScanError::ConfigError(format!("无效的代理地址 {}: {}", addr, e)))
}

pub fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

pub fn authority(host: &str, port: u16) -> String {
    let bare = strip_brackets(host);
    if bare.parse::<IpAddr>().map(|ip| ip.is_ipv6()).unwrap_or(false) {
        format!("[{}]:{}", bare, port)
    } else {
        format!("{}:{}", bare, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::http::HttpClient;
    use crate::scanner::test_support::{spawn_dns_server, spawn_socks5_proxy};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use url::Url;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(transport: &Transport) -> HttpClient {
        HttpClient::new(transport, &["tarantula-test".to_string()], Duration::from_secs(5))
            .unwrap()
            .read_body(true)
    }

    async fn ok_server() -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;
        mock_server
    }

    /// 记录每个连接的请求首行，然后回写固定响应
    async fn recording_proxy(reply: &'static [u8]) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let seen = lines.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut head = Vec::new();
                while !head.ends_with(b"\r\n\r\n") {
                    match sock.read_u8().await {
                        Ok(b) => head.push(b),
                        Err(_) => break,
                    }
                }
                let head = String::from_utf8_lossy(&head).into_owned();
                seen.lock().unwrap().push(head.lines().next().unwrap_or_default().to_string());
                let _ = sock.write_all(reply).await;
            }
        });
        (addr, lines)
    }

    #[test]
    fn test_authority() {
        assert_eq!(authority("example.com", 443), "example.com:443");
        assert_eq!(authority("::1", 8080), "[::1]:8080");
        assert_eq!(authority("[::1]", 8080), "[::1]:8080");
    }

    #[test]
    fn test_proxy_address_forms() {
        assert!(proxy("127.0.0.1:8080", "http").is_ok());
        assert!(proxy("socks5h://127.0.0.1:1080", "socks5h").is_ok());
        assert!(Transport::Socks5("127.0.0.1:1080".to_string())
            .configure(reqwest::Client::builder(), Duration::from_secs(1))
            .is_ok());
    }

    #[tokio::test]
    async fn test_http_proxy_forwards_plain_requests() {
        let (proxy_addr, lines) =
            recording_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\nConnection: close\r\n\r\nvia proxy").await;
        let transport = Transport::HttpProxy(proxy_addr);

        let url = Url::parse("http://asset.scan.test:8080/").unwrap();
        let resp = client(&transport).get(&url).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"via proxy");
        assert_eq!(
            lines.lock().unwrap().as_slice(),
            ["GET http://asset.scan.test:8080/ HTTP/1.1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_http_proxy_tunnels_tls() {
        let (proxy_addr, lines) = recording_proxy(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
        let transport = Transport::HttpProxy(proxy_addr);

        let url = Url::parse("https://asset.scan.test:8443/").unwrap();
        let err = client(&transport).get(&url).await.unwrap_err();
        assert!(err.is_transport());
        let lines = lines.lock().unwrap();
        assert!(lines[0].starts_with("CONNECT asset.scan.test:8443 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_socks5_relays_to_target() {
        let mock_server = ok_server().await;
        let (proxy_addr, accepted) = spawn_socks5_proxy().await;
        let transport = Transport::Socks5(proxy_addr);

        let url = Url::parse(&format!("{}/", mock_server.uri())).unwrap();
        let resp = client(&transport).get(&url).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"ok");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_socks5_proxy_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = Transport::Socks5(format!("127.0.0.1:{}", port));
        let url = Url::parse("http://asset.scan.test/").unwrap();
        let err = client(&transport).get(&url).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_random_dns_resolves_hostnames() {
        let mock_server = ok_server().await;
        let (dns_addr, queries) = spawn_dns_server().await;
        let transport = Transport::RandomDns(Arc::new(DnsServerPool::new(vec![dns_addr])));

        let port = mock_server.address().port();
        let url = Url::parse(&format!("http://www.scan.test:{}/", port)).unwrap();
        let resp = client(&transport).get(&url).await.unwrap();
        assert_eq!(resp.status, 200);
        assert!(queries.load(Ordering::SeqCst) >= 1);

        let received = mock_server.received_requests().await.unwrap();
        assert_eq!(
            received[0].headers.get("host").unwrap().to_str().unwrap(),
            format!("www.scan.test:{}", port)
        );
    }

    #[tokio::test]
    async fn test_random_dns_ip_literal() {
        let mock_server = ok_server().await;
        let transport = Transport::RandomDns(Arc::new(DnsServerPool::default()));
        let url = Url::parse(&format!("{}/", mock_server.uri())).unwrap();
        assert_eq!(client(&transport).get(&url).await.unwrap().status, 200);
    }
}
