use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub subdomain: String,
    pub port: u16,
}

/// 子域名优先的 (子域名, 端口) 笛卡尔积
pub fn enumerate_targets(subdomains: &[String], ports: &[u16]) -> Vec<Target> {
    subdomains
        .iter()
        .flat_map(|sub| {
            ports.iter().map(move |&port| Target {
                subdomain: sub.clone(),
                port,
            })
        })
        .collect()
}

/// 去除 http/https 前缀、路径和末尾的点，统一小写
pub fn clean_host(input: &str) -> Option<String> {
    let mut cleaned = input.trim();
    let lower = cleaned.to_ascii_lowercase();
    if lower.starts_with("http://") {
        cleaned = &cleaned[7..];
    } else if lower.starts_with("https://") {
        cleaned = &cleaned[8..];
    }
    if let Some(idx) = cleaned.find(['/', '?', '#']) {
        cleaned = &cleaned[..idx];
    }
    let cleaned = cleaned.trim_end_matches('.');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_ascii_lowercase())
    }
}

pub fn read_subdomains(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).context(format!("无法打开子域名列表文件: {:?}", path))?;
    let reader = BufReader::new(file);
    let mut subdomains = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            subdomains.push(line.to_string());
        }
    }
    Ok(subdomains)
}

/// 合并命令行与文件输入，清洗并按出现顺序去重
pub fn collect_subdomains(inputs: &[String], file_input: Option<&Path>) -> Result<Vec<String>> {
    let mut all = inputs.to_vec();
    if let Some(path) = file_input {
        all.extend(read_subdomains(path)?);
    }
    let mut seen = HashSet::new();
    Ok(all
        .iter()
        .filter_map(|s| clean_host(s))
        .filter(|s| seen.insert(s.clone()))
        .collect())
}
