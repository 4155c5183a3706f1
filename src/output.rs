use colored::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct AssetResult {
    pub status_code: u16,
    /// `scheme://host:port`
    pub asset: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// 分类名 -> 技术名（小写）
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub technologies: BTreeMap<String, String>,
}

fn colored_status(status: u16) -> ColoredString {
    let s = status.to_string();
    match status {
        200..=299 => s.green(),
        300..=399 => s.cyan(),
        400..=499 => s.yellow(),
        _ => s.red(),
    }
}

fn technologies_summary(technologies: &BTreeMap<String, String>) -> String {
    technologies
        .iter()
        .map(|(cat, tech)| format!("{}:{}", cat, tech))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_realtime_output(result: &AssetResult) -> String {
    let mut output = format!("{:<40} {}", result.asset, colored_status(result.status_code));
    if let Some(title) = result.title.as_deref().filter(|t| !t.is_empty()) {
        let display_title = if title.chars().count() > 60 {
            format!("{}...", title.chars().take(57).collect::<String>())
        } else {
            title.to_string()
        };
        output.push_str(&format!("  [{}]", display_title.dimmed()));
    }
    if !result.technologies.is_empty() {
        output.push_str(&format!("  {}", technologies_summary(&result.technologies).cyan()));
    }
    output
}

pub fn print_human_readable(results: &[AssetResult]) {
    let mut sorted: Vec<&AssetResult> = results.iter().collect();
    sorted.sort_by(|a, b| a.asset.cmp(&b.asset));

    if !sorted.is_empty() {
        println!("\n{:<40} {:<8} {}", "ASSET".bold(), "STATUS".bold(), "TITLE / TECHNOLOGIES".bold());
        println!("{}", "─".repeat(80).dimmed());
        for res in &sorted {
            println!(
                "{:<40} {:<8} {}",
                res.asset,
                colored_status(res.status_code),
                res.title.as_deref().unwrap_or("")
            );
            for (cat, tech) in &res.technologies {
                println!("  {:<38} └── {}: {}", "", cat, tech.cyan());
            }
        }
        println!("{}", "─".repeat(80).dimmed());
    }

    let mut by_class: BTreeMap<u16, usize> = BTreeMap::new();
    for res in results {
        *by_class.entry(res.status_code / 100).or_default() += 1;
    }
    println!("\n{}", "Scan summary:".bold().underline());
    println!("  Assets found: {}", results.len().to_string().green());
    for (class, count) in by_class {
        println!("  {}xx: {}", class, count.to_string().cyan());
    }
}

pub fn write_json<W: Write>(results: &[AssetResult], mut writer: W) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut writer, results)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// stdout 只输出 JSON 本身，提示信息走 stderr
pub fn output_json(results: &[AssetResult], path: Option<&Path>) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            write_json(results, std::io::BufWriter::new(File::create(path)?))?;
            eprintln!("\nJSON 结果已保存至: {:?}", path);
        }
        None => write_json(results, std::io::BufWriter::new(std::io::stdout().lock()))?,
    }
    Ok(())
}

fn escape_csv(field: &str) -> String {
    let mut field = field.to_string();
    // 防止表格软件把字段当作公式执行
    if field.starts_with(['=', '+', '-', '@']) {
        field.insert(0, '\'');
    }
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field
    }
}

pub fn write_csv<W: Write>(results: &[AssetResult], mut writer: W) -> std::io::Result<()> {
    writer.write_all(&[0xEF, 0xBB, 0xBF])?;
    writeln!(writer, "Asset,Domain,Status,Title,Server,Technologies")?;
    for res in results {
        writeln!(
            writer,
            "{},{},{},{},{},{}",
            escape_csv(&res.asset),
            escape_csv(&res.domain),
            res.status_code,
            escape_csv(res.title.as_deref().unwrap_or("")),
            escape_csv(res.headers.get("server").map(String::as_str).unwrap_or("")),
            escape_csv(&technologies_summary(&res.technologies)),
        )?;
    }
    writer.flush()
}

pub fn output_csv(results: &[AssetResult], path: &Path) -> anyhow::Result<()> {
    let file = File::create(path)?;
    write_csv(results, std::io::BufWriter::new(file))?;
    eprintln!("\nCSV 结果已保存至: {:?}", path);
    Ok(())
}
