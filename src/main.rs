use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::process;
use std::sync::Arc;
use tarantula::config::{Cli, ScanConfig};
use tarantula::output;
use tarantula::state::StateDir;
use tarantula::{Prober, ScanError};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_banner() {
    let banner = r#"
  _                        _         _
 | |_ __ _ _ __ __ _ _ __ | |_ _   _| | __ _
 | __/ _` | '__/ _` | '_ \| __| | | | |/ _` |
 | || (_| | | | (_| | | | | |_| |_| | | (_| |
  \__\__,_|_|  \__,_|_| |_|\__|\__,_|_|\__,_|
    tarantula - HTTP(S) Asset Prober
    "#;
    eprintln!("{}", banner);
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

fn fail(context: &str, e: &ScanError) -> ! {
    eprintln!("{}: {}", context, e);
    if let Some(hint) = e.user_hint() {
        eprintln!("{}", hint);
    }
    process::exit(1);
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if !cli.json {
        print_banner();
    }

    let config = match ScanConfig::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("配置错误: {}", e);
            process::exit(1);
        }
    };

    let mut prober = Prober::new()
        .threads(config.threads)
        .ports(config.ports.clone())
        .user_agents(config.user_agents.clone())
        .timeout(config.timeout)
        .retry(config.retry)
        .exclude_status_codes(config.excluded_status.iter().copied());
    if config.with_body {
        prober = prober.with_body();
    }
    if config.with_title {
        prober = prober.with_title();
    }

    let use_random_dns = config.random_dns && config.proxy.is_none() && config.socks5.is_none();
    let needs_state = config.with_tech || use_random_dns;
    if needs_state {
        let state = StateDir::home().unwrap_or_else(|e| fail("状态目录不可用", &e));
        if config.with_tech {
            let rules = state.load_rules().await.unwrap_or_else(|e| fail("指纹库加载失败", &e));
            info!("指纹库: {} 个应用", rules.len());
            prober = prober.with_technologies(Arc::new(rules));
        }
        if use_random_dns {
            let pool = state.load_resolvers().await.unwrap_or_else(|e| fail("DNS 服务器列表加载失败", &e));
            prober = prober.random_dns(Arc::new(pool));
        }
    }
    // 代理优先于随机 DNS
    if let Some(proxy) = &config.proxy {
        prober = prober.http_proxy(proxy.clone());
    }
    if let Some(proxy) = &config.socks5 {
        prober = prober.socks_proxy(proxy.clone());
    }

    if let Some(asset) = &config.check {
        match prober.check_consistent_status(asset, config.attempts).await {
            Some(code) => println!("{} {}", asset, code),
            None => {
                println!("{} inconsistent", asset);
                process::exit(3);
            }
        }
        return Ok(());
    }

    let mut rx = prober
        .scan_stream(&config.domain, config.subdomains.clone())
        .unwrap_or_else(|e| fail("扫描启动失败", &e));

    let pb = if !config.json_output {
        eprintln!(
            "开始探测: {} 个子域名, 每个 {} 个端口, 传输方式 {}",
            config.subdomains.len(),
            config.ports.len(),
            prober.settings().transport.name()
        );
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {pos} 个资产 {msg}")?);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        if let Some(pb) = &pb {
            pb.inc(1);
            pb.println(output::format_realtime_output(&result));
        }
        results.push(result);
    }
    if let Some(pb) = &pb {
        pb.finish_with_message("探测完成");
    }

    if config.json_output {
        if let Err(e) = output::output_json(&results, None) {
            eprintln!("JSON 输出失败: {}", e);
        }
    } else {
        output::print_human_readable(&results);
    }
    if let Some(path) = &config.output_file {
        if let Err(e) = output::output_json(&results, Some(path.as_path())) {
            eprintln!("JSON 输出失败: {}", e);
        }
    }
    if let Some(path) = &config.output_csv {
        if let Err(e) = output::output_csv(&results, path) {
            eprintln!("CSV 输出失败: {}", e);
        }
    }
    Ok(())
}
