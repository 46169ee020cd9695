use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub code: String,
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```([A-Za-z0-9_+#.-]*)[^\n]*\n(.*?)\n?```").expect("valid fence regex")
    })
}

/// All closed fenced blocks, in order of appearance.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    fence_re()
        .captures_iter(text)
        .filter_map(|cap| {
            let code = cap.get(2)?.as_str().to_string();
            if code.trim().is_empty() {
                return None;
            }
            let language = cap
                .get(1)
                .map(|m| m.as_str().trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty());
            Some(CodeBlock { language, code })
        })
        .collect()
}

/// First block tagged with `preferred` (or one of its aliases); otherwise the first block.
pub fn first_code_block(text: &str, preferred: Option<&[&str]>) -> Option<CodeBlock> {
    let blocks = extract_code_blocks(text);
    if let Some(names) = preferred {
        if let Some(hit) = blocks.iter().find(|b| {
            b.language
                .as_deref()
                .map(|l| names.iter().any(|n| n.eq_ignore_ascii_case(l)))
                .unwrap_or(false)
        }) {
            return Some(hit.clone());
        }
    }
    blocks.into_iter().next()
}
