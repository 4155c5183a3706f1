use crate::error::ScanError;
use crate::output::AssetResult;
use crate::scanner::constants::{initial_protocol, Protocol};
use crate::scanner::http::{normalize_asset, HttpClient, HttpResponse};
use crate::scanner::transport::authority;
use crate::scanner::web_fingerprints::{self, Evidence};
use crate::scanner::webtitle;
use crate::scanner::ProbeSettings;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// 单个目标的一条尝试链的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeContext {
    pub domain: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub retries_left: usize,
    pub allow_switch: bool,
    /// 跨域跳转是否派生二次探测，二次探测本身不再派生
    pub follow_foreign: bool,
}

impl ProbeContext {
    pub fn new(domain: &str, host: &str, port: u16, retries: usize) -> Self {
        Self {
            domain: domain.to_string(),
            protocol: initial_protocol(port),
            host: host.to_string(),
            port,
            retries_left: retries,
            allow_switch: true,
            follow_foreign: true,
        }
    }

    /// 跨域跳转目标：不重试、不降级、不再继续派生
    fn redirected(domain: &str, location: &Url) -> Option<Self> {
        let protocol = Protocol::from_scheme(location.scheme())?;
        let host = location.host_str()?;
        Some(Self {
            domain: domain.to_string(),
            protocol,
            host: host.to_string(),
            port: location.port_or_known_default().unwrap_or(protocol.default_port()),
            retries_left: 0,
            allow_switch: false,
            follow_foreign: false,
        })
    }

    pub fn url(&self) -> Result<Url, ScanError> {
        let raw = format!("{}://{}", self.protocol, authority(&self.host, self.port));
        Url::parse(&raw).map_err(|e| ScanError::ConfigError(format!("无效的目标 {}: {}", raw, e)))
    }
}

#[derive(Debug, Default)]
pub struct ProbeOutcome {
    pub result: Option<AssetResult>,
    pub secondary: Option<ProbeContext>,
}

pub fn in_scope(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    !domain.is_empty() && (host == domain || host.ends_with(&format!(".{}", domain)))
}

pub async fn probe(settings: &ProbeSettings, client: &HttpClient, mut ctx: ProbeContext) -> ProbeOutcome {
    let mut response = loop {
        let url = match ctx.url() {
            Ok(url) => url,
            Err(e) => {
                debug!("{}", e);
                return ProbeOutcome::default();
            }
        };
        match client.get(&url).await {
            Ok(resp) => break resp,
            Err(e) if !e.is_transport() => {
                debug!("{} 请求无法发出，放弃: {}", url, e);
                return ProbeOutcome::default();
            }
            Err(e) => {
                debug!("{} 请求失败 (剩余重试 {}): {}", url, ctx.retries_left, e);
                if ctx.retries_left > 0 {
                    ctx.retries_left -= 1;
                } else if ctx.allow_switch && ctx.protocol == Protocol::Https {
                    debug!("{} 降级为 HTTP", url);
                    ctx.protocol = Protocol::Http;
                    ctx.retries_left = settings.retry;
                    ctx.allow_switch = false;
                } else {
                    return ProbeOutcome::default();
                }
            }
        }
    };

    let mut secondary = None;
    if response.is_redirect() {
        if let Some(location) = response.location() {
            let target_host = location.host_str().unwrap_or_default();
            if in_scope(target_host, &ctx.domain) {
                match client.get_following(&location).await {
                    Ok(followed) => response = followed,
                    Err(e) => debug!("跟随跳转 {} 失败，保留原始响应: {}", location, e),
                }
            } else if ctx.follow_foreign {
                secondary = ProbeContext::redirected(&ctx.domain, &location);
            }
        }
    }

    if settings.excluded_status.contains(&response.status) {
        debug!("{} 状态码 {} 已被排除", response.url, response.status);
        return ProbeOutcome { result: None, secondary };
    }

    ProbeOutcome {
        result: Some(assemble(settings, &ctx.domain, &response)),
        secondary,
    }
}

fn assemble(settings: &ProbeSettings, domain: &str, response: &HttpResponse) -> AssetResult {
    let headers: BTreeMap<String, String> = response
        .headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
        .collect();

    let title = settings
        .with_title
        .then(|| webtitle::extract_title(&response.body, response.content_type()));

    let technologies = match &settings.rules {
        Some(rules) => {
            let cookies = response.cookies();
            let evidence = Evidence {
                url: response.url.as_str(),
                body: &response.body,
                headers: &response.headers,
                cookies: &cookies,
            };
            let matches = web_fingerprints::detect(rules, &evidence);
            web_fingerprints::technologies_by_category(&matches)
        }
        None => BTreeMap::new(),
    };

    let body = settings
        .with_body
        .then(|| String::from_utf8_lossy(&response.body).into_owned());

    AssetResult {
        status_code: response.status,
        asset: normalize_asset(&response.url),
        domain: domain.to_string(),
        body,
        headers,
        title,
        technologies,
    }
}

/// 所有尝试都成功且状态码一致时返回该状态码
pub fn consistent_status(statuses: &[Option<u16>]) -> Option<u16> {
    let first = (*statuses.first()?)?;
    statuses.iter().all(|s| *s == Some(first)).then_some(first)
}
