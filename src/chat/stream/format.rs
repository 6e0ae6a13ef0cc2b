//! 助手回复的提交前整理
//!
//! 只在提交时执行一次，预览保持原样。整理是幂等的：对结果再整理一次不会有任何变化。

use std::collections::HashSet;

/// 只由这些字符组成的行是装饰分隔线
const DECORATIVE_CHARS: &[char] = &['-', '*', '_', '=', '~', '─', '━', '•', '·'];

/// 常见的套话行，同一条回复里只保留第一次出现
const SCAFFOLD_PHRASES: &[&str] = &[
    "当然",
    "当然可以",
    "好的",
    "没问题",
    "以下是回答",
    "希望对你有帮助",
    "希望对您有帮助",
    "sure",
    "certainly",
    "of course",
    "here you go",
    "hope this helps",
];

pub fn normalize_reply(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut seen_scaffold: HashSet<String> = HashSet::new();

    for raw in text.lines() {
        let line = strip_headings(&strip_emphasis(raw));
        let line = line.trim_end();

        if is_decorative(line) {
            continue;
        }
        if let Some(key) = scaffold_key(line) {
            if !seen_scaffold.insert(key) {
                continue;
            }
        }
        if out.last().map(String::as_str) == Some(line) {
            continue;
        }
        out.push(line.to_string());
    }

    let start = out.iter().position(|l| !l.is_empty()).unwrap_or(out.len());
    let end = out.iter().rposition(|l| !l.is_empty()).map_or(start, |i| i + 1);
    out[start..end].join("\n")
}

fn strip_emphasis(line: &str) -> String {
    let mut line = line.to_string();
    while line.contains("**") || line.contains("__") {
        line = line.replace("**", "").replace("__", "");
    }
    line
}

fn strip_headings(line: &str) -> String {
    let mut current = line;
    loop {
        let trimmed = current.trim_start();
        let rest = trimmed.trim_start_matches('#');
        if rest.len() == trimmed.len() {
            return current.to_string();
        }
        if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
            return current.to_string();
        }
        current = rest.trim_start();
    }
}

fn is_decorative(line: &str) -> bool {
    let mut marks = 0;
    for c in line.chars() {
        if c.is_whitespace() {
            continue;
        }
        if !DECORATIVE_CHARS.contains(&c) {
            return false;
        }
        marks += 1;
    }
    marks >= 3
}

fn scaffold_key(line: &str) -> Option<String> {
    let key = line
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || "！，。：～".contains(c))
        .to_lowercase();
    SCAFFOLD_PHRASES.contains(&key.as_str()).then_some(key)
}
