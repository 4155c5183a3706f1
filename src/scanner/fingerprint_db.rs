use crate::error::ScanError;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const VERSION_DIRECTIVE: &str = "version:";
const DIRECTIVE_SEPARATOR: &str = "\\;";
const MATCH_ANY: &str = ".*";

/// 规则文件里同一字段可能是字符串、字符串数组或整数数组
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawList {
    One(String),
    Number(i64),
    Many(Vec<String>),
    Numbers(Vec<i64>),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "RawList")]
pub struct StringList(pub Vec<String>);

impl From<RawList> for StringList {
    fn from(raw: RawList) -> Self {
        match raw {
            RawList::One(s) => StringList(vec![s]),
            RawList::Number(n) => StringList(vec![n.to_string()]),
            RawList::Many(v) => StringList(v),
            RawList::Numbers(v) => StringList(v.into_iter().map(|n| n.to_string()).collect()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawApp {
    cats: StringList,
    website: String,
    html: StringList,
    #[serde(alias = "scriptSrc")]
    script: StringList,
    url: StringList,
    implies: StringList,
    headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
    meta: BTreeMap<String, StringList>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCategory {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    technologies: HashMap<String, RawApp>,
    #[serde(default)]
    categories: HashMap<String, RawCategory>,
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    /// header / cookie / meta 的字段名
    pub name: Option<String>,
    pub regex: Regex,
    /// 形如 `\1` 的版本模板
    pub version: Option<String>,
    /// 声明为空的命名规则，任意值（或仅存在）即命中
    pub any_value: bool,
}

#[derive(Debug, Clone)]
pub struct AppDefinition {
    pub name: String,
    pub categories: Vec<String>,
    pub category_names: Vec<String>,
    pub website: String,
    pub implies: Vec<String>,
    pub html: Vec<CompiledPattern>,
    pub script: Vec<CompiledPattern>,
    pub url: Vec<CompiledPattern>,
    pub headers: Vec<CompiledPattern>,
    pub cookies: Vec<CompiledPattern>,
    pub meta: Vec<CompiledPattern>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    apps: BTreeMap<String, AppDefinition>,
    skipped_patterns: usize,
}

impl RuleStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(bytes: &[u8]) -> Result<Self, ScanError> {
        let doc: RuleDocument = serde_json::from_slice(bytes)?;
        Ok(Self::compile(doc))
    }

    pub fn load_from_str(json: &str) -> Result<Self, ScanError> {
        Self::load(json.as_bytes())
    }

    pub fn from_path(path: &Path) -> Result<Self, ScanError> {
        let content = fs::read(path).map_err(|e| ScanError::FileError {
            path: path.display().to_string(),
            source: e,
        })?;
        let store = Self::load(&content)?;
        info!("已加载指纹规则: {} 个应用 ({:?})", store.len(), path);
        Ok(store)
    }

    fn compile(doc: RuleDocument) -> Self {
        let mut skipped = 0;
        let mut apps = BTreeMap::new();

        for (name, raw) in doc.technologies {
            let mut compiler = PatternCompiler {
                app: &name,
                skipped: &mut skipped,
            };

            let html = compiler.list(&raw.html.0);
            let script = compiler.list(&raw.script.0);
            let url = compiler.list(&raw.url.0);
            let headers = compiler.named(raw.headers.iter().map(|(k, v)| (k.as_str(), v.clone())));
            let cookies = compiler.named(raw.cookies.iter().map(|(k, v)| (k.as_str(), v.clone())));
            // meta 的多个值合并成一个分支正则
            let meta = compiler.named(raw.meta.iter().map(|(k, v)| (k.as_str(), v.0.join("|"))));

            let category_names = raw
                .cats
                .0
                .iter()
                .filter_map(|id| doc.categories.get(id))
                .filter(|c| !c.name.is_empty())
                .map(|c| c.name.clone())
                .collect();

            let app = AppDefinition {
                name: name.clone(),
                categories: raw.cats.0,
                category_names,
                website: raw.website,
                implies: raw.implies.0,
                html,
                script,
                url,
                headers,
                cookies,
                meta,
            };
            apps.insert(name, app);
        }

        if skipped > 0 {
            warn!("跳过 {} 条无法编译的指纹正则", skipped);
        }

        RuleStore {
            apps,
            skipped_patterns: skipped,
        }
    }

    pub fn get(&self, name: &str) -> Option<&AppDefinition> {
        self.apps.get(name)
    }

    /// 按应用名排序遍历
    pub fn apps(&self) -> impl Iterator<Item = &AppDefinition> {
        self.apps.values()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn skipped_patterns(&self) -> usize {
        self.skipped_patterns
    }
}

struct PatternCompiler<'a> {
    app: &'a str,
    skipped: &'a mut usize,
}

impl PatternCompiler<'_> {
    fn list(&mut self, raw: &[String]) -> Vec<CompiledPattern> {
        raw.iter().filter_map(|p| self.compile(None, p)).collect()
    }

    fn named<'n>(&mut self, raw: impl Iterator<Item = (&'n str, String)>) -> Vec<CompiledPattern> {
        raw.filter_map(|(name, p)| self.compile(Some(name), &p)).collect()
    }

    fn compile(&mut self, name: Option<&str>, raw: &str) -> Option<CompiledPattern> {
        let mut parts = raw.split(DIRECTIVE_SEPARATOR);
        let pattern = parts.next().unwrap_or_default();
        let version = parts
            .find_map(|p| p.strip_prefix(VERSION_DIRECTIVE))
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let any_value = name.is_some() && (pattern.is_empty() || pattern == MATCH_ANY);
        let pattern = if any_value { MATCH_ANY } else { pattern };

        match RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(10 * 1024 * 1024)
            .build()
        {
            Ok(regex) => Some(CompiledPattern {
                name: name.map(str::to_string),
                regex,
                version,
                any_value,
            }),
            Err(e) => {
                debug!("[{}] 忽略无效正则 {:?}: {}", self.app, pattern, e);
                *self.skipped += 1;
                None
            }
        }
    }
}
