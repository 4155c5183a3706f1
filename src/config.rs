use crate::scanner::constants::{DEFAULT_RETRY, DEFAULT_USER_AGENTS};
use crate::target::{clean_host, collect_subdomains};
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "tarantula")]
#[command(version)]
#[command(about = "tarantula - 子域名 HTTP(S) 资产探测与技术识别", long_about = None)]
#[command(after_help = "警告：本工具只允许在取得授权的前提下用于内部资产摸排、攻防演练、渗透测试等合法场景。禁止对未授权目标进行扫描。")]
pub struct Cli {
    /// 待探测的子域名
    #[arg(value_name = "SUBDOMAIN")]
    pub subdomains: Vec<String>,
    /// 根域名，用于判断跳转是否在范围内
    #[arg(short, long)]
    pub domain: Option<String>,
    #[arg(short = 'L', long, value_name = "FILE")]
    pub list: Option<PathBuf>,
    #[arg(short, long, default_value = "443")]
    pub ports: String,
    #[arg(short = 'c', long, default_value = "20")]
    pub threads: usize,
    /// 单次请求超时（秒）
    #[arg(short, long, default_value = "5")]
    pub timeout: u64,
    #[arg(long, default_value_t = DEFAULT_RETRY)]
    pub retry: usize,
    /// HTTP 代理，host:port
    #[arg(long, value_name = "ADDR")]
    pub proxy: Option<String>,
    /// SOCKS5 代理，host:port
    #[arg(long, value_name = "ADDR")]
    pub socks5: Option<String>,
    /// 每次连接随机选择一个 DNS 服务器解析
    #[arg(long)]
    pub random_dns: bool,
    #[arg(long)]
    pub body: bool,
    #[arg(long)]
    pub title: bool,
    #[arg(long)]
    pub tech: bool,
    /// 丢弃这些状态码的结果，逗号分隔
    #[arg(long, value_name = "CODES")]
    pub exclude_status: Option<String>,
    /// 自定义 User-Agent 列表文件，每行一个
    #[arg(long, value_name = "FILE")]
    pub user_agents: Option<PathBuf>,
    #[arg(long)]
    pub json: bool,
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output_json: Option<PathBuf>,
    #[arg(long, value_name = "FILE")]
    pub output_csv: Option<PathBuf>,
    /// 对单个资产做状态码一致性检查后退出
    #[arg(long, value_name = "ASSET")]
    pub check: Option<String>,
    #[arg(long, default_value = "3")]
    pub attempts: usize,
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub domain: String,
    pub subdomains: Vec<String>,
    pub ports: Vec<u16>,
    pub threads: usize,
    pub timeout: Duration,
    pub retry: usize,
    pub proxy: Option<String>,
    pub socks5: Option<String>,
    pub random_dns: bool,
    pub with_body: bool,
    pub with_title: bool,
    pub with_tech: bool,
    pub excluded_status: HashSet<u16>,
    pub user_agents: Vec<String>,
    pub json_output: bool,
    pub output_file: Option<PathBuf>,
    pub output_csv: Option<PathBuf>,
    pub check: Option<String>,
    pub attempts: usize,
}

impl ScanConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.proxy.is_some() && cli.socks5.is_some() {
            anyhow::bail!("--proxy 与 --socks5 不能同时使用");
        }
        if cli.threads == 0 {
            anyhow::bail!("并发数必须大于 0");
        }
        if cli.timeout == 0 {
            anyhow::bail!("超时时间必须大于 0");
        }

        let domain = match (&cli.domain, &cli.check) {
            (Some(d), _) => clean_host(d).context(format!("无效的域名: {}", d))?,
            (None, Some(_)) => String::new(),
            (None, None) => anyhow::bail!("未指定根域名，请使用 -d 参数"),
        };

        let mut subdomains = collect_subdomains(&cli.subdomains, cli.list.as_deref())?;
        if subdomains.is_empty() && !domain.is_empty() {
            subdomains.push(domain.clone());
        }

        let excluded_status = match &cli.exclude_status {
            Some(s) => parse_status_codes(s)?,
            None => HashSet::new(),
        };

        let user_agents = match &cli.user_agents {
            Some(path) => {
                let content = fs::read_to_string(path).context(format!("无法读取 User-Agent 文件: {:?}", path))?;
                let agents: Vec<String> = content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(String::from)
                    .collect();
                if agents.is_empty() {
                    anyhow::bail!("User-Agent 文件为空: {:?}", path);
                }
                agents
            }
            None => DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
        };

        Ok(ScanConfig {
            domain,
            subdomains,
            ports: parse_ports(&cli.ports)?,
            threads: cli.threads,
            timeout: Duration::from_secs(cli.timeout),
            retry: cli.retry,
            proxy: cli.proxy,
            socks5: cli.socks5,
            random_dns: cli.random_dns,
            with_body: cli.body,
            with_title: cli.title,
            with_tech: cli.tech,
            excluded_status,
            user_agents,
            // 只有 --json 才关闭进度条，-o 仅写文件
            json_output: cli.json,
            output_file: cli.output_json,
            output_csv: cli.output_csv,
            check: cli.check,
            attempts: cli.attempts,
        })
    }
}

pub fn parse_ports(port_str: &str) -> Result<Vec<u16>> {
    let mut ports = HashSet::new();
    for part in port_str.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.contains('-') {
            let range: Vec<&str> = part.split('-').collect();
            if range.len() != 2 {
                anyhow::bail!("无效的端口范围格式: {}", part);
            }
            let start: u16 = range[0].trim().parse().context("解析端口范围起始值失败")?;
            let end: u16 = range[1].trim().parse().context("解析端口范围结束值失败")?;
            if start > end {
                anyhow::bail!("无效的端口范围: {}-{} (起始端口不能大于结束端口)", start, end);
            }
            ports.extend(start..=end);
        } else {
            let p: u16 = part.parse().context(format!("解析端口失败: {}", part))?;
            ports.insert(p);
        }
    }
    ports.remove(&0);
    if ports.is_empty() {
        anyhow::bail!("未指定有效端口");
    }
    let mut sorted_ports: Vec<u16> = ports.into_iter().collect();
    sorted_ports.sort();
    Ok(sorted_ports)
}

fn parse_status_codes(s: &str) -> Result<HashSet<u16>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| -> Result<u16> {
            let code: u16 = p.parse().context(format!("无效的状态码: {}", p))?;
            if !(100..1000).contains(&code) {
                anyhow::bail!("无效的状态码: {}", code);
            }
            Ok(code)
        })
        .collect()
}
