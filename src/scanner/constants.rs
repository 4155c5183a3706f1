use std::time::Duration;

pub const HTTP_BODY_SIZE_LIMIT: usize = 1024 * 1024;

pub const RESULT_CHANNEL_SIZE: usize = 100;
pub const MAX_FOLLOW_REDIRECTS: usize = 10;

pub const DEFAULT_THREADS: usize = 1;
pub const DEFAULT_PORTS: &[u16] = &[443];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY: usize = 2;
pub const DNS_SERVER_PORT: u16 = 53;

pub const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";
pub const ACCEPT_CHARSET: &str = "utf-8";
pub const REFERER: &str = "https://www.google.com/";

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.114 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.101 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 11; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.120 Mobile Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

pub const STATE_DIR_NAME: &str = ".tarantula";
pub const TECHNOLOGIES_FILE: &str = "technologies.json";
pub const RESOLVERS_FILE: &str = "resolvers.txt";
pub const TECHNOLOGIES_URL: &str =
    "https://raw.githubusercontent.com/ghaini/tarantula/master/data/technologies.json";
pub const RESOLVERS_URL: &str =
    "https://raw.githubusercontent.com/ghaini/tarantula/master/data/resolvers.txt";
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 80 端口直接走明文，其余端口先尝试 HTTPS，失败后再降级
pub fn initial_protocol(port: u16) -> Protocol {
    match port {
        80 => Protocol::Http,
        _ => Protocol::Https,
    }
}
