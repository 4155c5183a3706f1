use encoding_rs::GBK;
use regex::bytes::Regex;
use std::sync::OnceLock;

static TITLE_REGEX: OnceLock<Regex> = OnceLock::new();

fn title_regex() -> &'static Regex {
    TITLE_REGEX.get_or_init(|| {
        Regex::new(r"(?is-u)<\s*title[^>]*>(.*?)<\s*/\s*title\s*>").expect("Invalid Title Regex")
    })
}

/// 提取 `<title>`，只对 `charset=GB2312` 做特殊解码，其余按 UTF-8 处理
pub fn extract_title(body: &[u8], content_type: Option<&str>) -> String {
    let raw = match title_regex().captures(body).and_then(|caps| caps.get(1)) {
        Some(m) => m.as_bytes(),
        None => return String::new(),
    };

    let text = if content_type.is_some_and(|ct| ct.contains("charset=GB2312")) {
        let (decoded, _, _) = GBK.decode(raw);
        decoded.into_owned()
    } else {
        String::from_utf8_lossy(raw).into_owned()
    };

    html_escape::decode_html_entities(text.trim()).into_owned()
}
