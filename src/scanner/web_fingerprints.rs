use crate::scanner::fingerprint_db::{AppDefinition, CompiledPattern, RuleStore};
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use std::sync::OnceLock;

const BINARY_SNIFF_LEN: usize = 1024;

static SCRIPT_SELECTOR: OnceLock<Selector> = OnceLock::new();
static META_SELECTOR: OnceLock<Selector> = OnceLock::new();

fn script_selector() -> &'static Selector {
    SCRIPT_SELECTOR.get_or_init(|| Selector::parse("script[src]").expect("Invalid Script Selector"))
}

fn meta_selector() -> &'static Selector {
    META_SELECTOR.get_or_init(|| Selector::parse("meta[name]").expect("Invalid Meta Selector"))
}

/// 一次响应中可用于指纹匹配的全部证据
pub struct Evidence<'a> {
    pub url: &'a str,
    pub body: &'a [u8],
    pub headers: &'a [(String, String)],
    pub cookies: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Match<'a> {
    pub app: &'a AppDefinition,
    pub groups: Vec<Vec<String>>,
    pub version: String,
    pub implied: bool,
}

impl Match<'_> {
    pub fn name(&self) -> &str {
        &self.app.name
    }
}

#[derive(Default)]
struct Finding {
    groups: Vec<Vec<String>>,
    version: String,
}

impl Finding {
    fn scan(&mut self, content: &str, pattern: &CompiledPattern) {
        let found: Vec<Vec<String>> = pattern
            .regex
            .captures_iter(content)
            .map(|caps| {
                caps.iter()
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect()
            })
            .collect();
        if found.is_empty() {
            return;
        }
        // 先解析出的非空版本优先，后续来源只填补空版本
        if self.version.is_empty() {
            if let Some(template) = &pattern.version {
                self.version = resolve_version(&found, template);
            }
        }
        self.groups.extend(found);
    }

    fn scan_all(&mut self, content: &str, patterns: &[CompiledPattern]) {
        for pattern in patterns {
            self.scan(content, pattern);
        }
    }
}

/// 用第一组满足所需下标的捕获结果替换 `\1`..`\3`
fn resolve_version(groups: &[Vec<String>], template: &str) -> String {
    let referenced: Vec<usize> = (1..=3)
        .filter(|i| template.contains(&format!("\\{}", i)))
        .collect();
    if referenced.is_empty() {
        return template.to_string();
    }

    for set in groups {
        if referenced.iter().any(|&i| set.get(i).map_or(true, |g| g.is_empty())) {
            continue;
        }
        let mut version = template.to_string();
        for &i in &referenced {
            version = version.replace(&format!("\\{}", i), &set[i]);
        }
        let version = version.trim();
        if !version.is_empty() {
            return version.to_string();
        }
    }
    String::new()
}

fn looks_binary(body: &[u8]) -> bool {
    body.iter().take(BINARY_SNIFF_LEN).any(|&b| b == 0)
}

pub fn detect<'a>(store: &'a RuleStore, evidence: &Evidence<'_>) -> Vec<Match<'a>> {
    if looks_binary(evidence.body) {
        return Vec::new();
    }

    let html = String::from_utf8_lossy(evidence.body);
    let document = Html::parse_document(&html);
    let scripts: Vec<&str> = document
        .select(script_selector())
        .filter_map(|el| el.value().attr("src"))
        .collect();
    let metas: Vec<(String, &str)> = document
        .select(meta_selector())
        .filter_map(|el| {
            let name = el.value().attr("name")?;
            Some((name.to_ascii_lowercase(), el.value().attr("content").unwrap_or("")))
        })
        .collect();

    let mut matches = Vec::new();
    for app in store.apps() {
        let mut finding = Finding::default();

        finding.scan_all(&html, &app.html);
        finding.scan_all(evidence.url, &app.url);

        for pattern in &app.headers {
            let Some(name) = pattern.name.as_deref() else { continue };
            for (_, value) in evidence
                .headers
                .iter()
                .filter(|(k, v)| k.eq_ignore_ascii_case(name) && !v.is_empty())
            {
                finding.scan(value, pattern);
            }
        }

        for src in &scripts {
            finding.scan_all(src, &app.script);
        }

        for pattern in &app.meta {
            let Some(name) = pattern.name.as_deref() else { continue };
            let name = name.to_ascii_lowercase();
            for (_, content) in metas.iter().filter(|(n, _)| *n == name) {
                finding.scan(content, pattern);
            }
        }

        for pattern in &app.cookies {
            let Some(name) = pattern.name.as_deref() else { continue };
            let Some(value) = evidence.cookies.get(name) else { continue };
            if pattern.any_value {
                finding.groups.push(vec![name.to_string()]);
            } else {
                finding.scan(value, pattern);
            }
        }

        if finding.groups.is_empty() {
            continue;
        }
        matches.push(Match {
            app,
            groups: finding.groups,
            version: finding.version,
            implied: false,
        });

        // 只展开一层
        for implied in &app.implies {
            let implied_name = implied.split("\\;").next().unwrap_or_default();
            if let Some(implied_app) = store.get(implied_name) {
                matches.push(Match {
                    app: implied_app,
                    groups: Vec::new(),
                    version: String::new(),
                    implied: true,
                });
            }
        }
    }
    matches
}

/// 按分类汇总，同一分类多个应用时按应用名顺序后写入者覆盖
pub fn technologies_by_category(matches: &[Match<'_>]) -> BTreeMap<String, String> {
    let mut technologies = BTreeMap::new();
    for m in matches {
        for category in &m.app.category_names {
            technologies.insert(category.clone(), m.app.name.to_lowercase());
        }
    }
    technologies
}
