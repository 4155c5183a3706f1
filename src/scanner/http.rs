use crate::error::ScanError;
use crate::scanner::constants::*;
use crate::scanner::transport::{authority, Transport};
use rand::seq::IndexedRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT as ACCEPT_HEADER, ORIGIN, REFERER as REFERER_HEADER, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: Url,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Location 相对当前请求地址解析
    pub fn location(&self) -> Option<Url> {
        let loc = self.header("location")?.trim();
        if loc.is_empty() {
            return None;
        }
        self.url.join(loc).ok()
    }

    pub fn cookies(&self) -> BTreeMap<String, String> {
        let mut cookies = BTreeMap::new();
        for raw in self.header_values("set-cookie") {
            let pair = raw.split(';').next().unwrap_or("");
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    cookies.insert(name.to_string(), value.trim().to_string());
                }
            }
        }
        cookies
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// 探测用客户端：证书不校验，连接不复用。
/// `single` 不跟随跳转，`following` 最多跟随 [`MAX_FOLLOW_REDIRECTS`] 次
#[derive(Debug, Clone)]
pub struct HttpClient {
    single: Client,
    following: Client,
    user_agents: Vec<String>,
    timeout: Duration,
    read_body: bool,
}

impl HttpClient {
    pub fn new(transport: &Transport, user_agents: &[String], timeout: Duration) -> Result<Self, ScanError> {
        Ok(Self {
            single: create_http_client(transport, timeout, Policy::none())?,
            following: create_http_client(transport, timeout, Policy::limited(MAX_FOLLOW_REDIRECTS))?,
            user_agents: user_agents.to_vec(),
            timeout,
            read_body: false,
        })
    }

    pub fn read_body(mut self, read_body: bool) -> Self {
        self.read_body = read_body;
        self
    }

    fn user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::rng())
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_USER_AGENTS[0])
    }

    /// 单次 GET，不跟随跳转
    pub async fn get(&self, url: &Url) -> Result<HttpResponse, ScanError> {
        self.send(&self.single, url).await
    }

    /// 跟随跳转，返回最终响应；`url` 字段为最终地址
    pub async fn get_following(&self, url: &Url) -> Result<HttpResponse, ScanError> {
        self.send(&self.following, url).await
    }

    async fn send(&self, client: &Client, url: &Url) -> Result<HttpResponse, ScanError> {
        if Protocol::from_scheme(url.scheme()).is_none() {
            return Err(ScanError::ConfigError(format!("不支持的协议: {}", url)));
        }

        let mut resp = client
            .get(url.clone())
            .header(USER_AGENT, self.user_agent())
            .header(ORIGIN, origin(url))
            .send()
            .await
            .map_err(|e| self.request_error(url, e))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().clone();
        // 同名头部逐条保留
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).trim().to_string()))
            .collect();
        let body = if self.read_body {
            read_body_safe(&mut resp, HTTP_BODY_SIZE_LIMIT).await
        } else {
            Vec::new()
        };

        Ok(HttpResponse {
            url: final_url,
            status,
            headers,
            body,
        })
    }

    fn request_error(&self, url: &Url, e: reqwest::Error) -> ScanError {
        if e.is_timeout() {
            ScanError::Timeout {
                target: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if e.is_redirect() {
            ScanError::MalformedResponse(format!("跳转次数超过上限 ({}): {}", MAX_FOLLOW_REDIRECTS, url))
        } else {
            ScanError::Request {
                target: url.to_string(),
                source: e,
            }
        }
    }
}

fn create_http_client(transport: &Transport, timeout: Duration, policy: Policy) -> Result<Client, ScanError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_HEADER, HeaderValue::from_static(ACCEPT));
    headers.insert("accept-charset", HeaderValue::from_static(ACCEPT_CHARSET));
    headers.insert(REFERER_HEADER, HeaderValue::from_static(REFERER));

    let builder = Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .danger_accept_invalid_certs(true)
        .redirect(policy)
        .pool_max_idle_per_host(0)
        .default_headers(headers);

    transport
        .configure(builder, timeout)?
        .build()
        .map_err(|e| ScanError::ConfigError(format!("HTTP 客户端初始化失败: {}", e)))
}

/// 分块读取响应体，超过 `limit` 截断；读取出错时保留已读部分
async fn read_body_safe(resp: &mut Response, limit: usize) -> Vec<u8> {
    let mut body = Vec::new();
    while let Ok(Some(chunk)) = resp.chunk().await {
        if body.len() + chunk.len() > limit {
            let remaining = limit - body.len();
            body.extend_from_slice(&chunk[..remaining]);
            debug!("响应体超过 {} 字节，已截断", limit);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    body
}

fn origin(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(80);
    format!("{}://{}", url.scheme(), authority(host, port))
}

/// `scheme://host:port`，端口缺省时按协议补全
pub fn normalize_asset(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url
        .port_or_known_default()
        .unwrap_or_else(|| Protocol::from_scheme(url.scheme()).map(|p| p.default_port()).unwrap_or(80));
    format!("{}://{}", url.scheme(), authority(host, port))
}
