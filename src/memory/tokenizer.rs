//! 分词：中英文混合文本切成检索用的词
//!
//! 含 CJK 字符时用 jieba 搜索引擎模式切分，纯英文按非字母数字切分。结果转小写、去重、去掉纯标点。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 分词；单个 CJK 字保留，单个 ASCII 字符丢弃
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let raw: Vec<String> = if contains_cjk(text) {
        jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(str::to_lowercase)
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
            .map(str::to_lowercase)
            .collect()
    };

    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .filter(|t| t.chars().count() > 1 || t.chars().next().is_some_and(is_cjk))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
