use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use super::pdf_parser::{is_abstract_heading, looks_like_section_heading};
use crate::utils::clean_text;

const MAX_FRONT_LINES: usize = 80;
const MAX_AFFILIATIONS: usize = 6;

static INSTITUTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(university|institute|college|school|department|faculty|laboratory|lab|research\s+center|research\s+lab|research\s+institute|center|centre|academy|hospital|corp(?:oration)?|inc\.?|ltd\.?|llc|company|team)\b|大学|学院|研究所|实验室|研究院|中心|公司|团队",
    )
    .expect("invalid institution regex")
});
static STOP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(figure|table|abstract|introduction|keywords?|references?)\b").expect("invalid stop regex")
});
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@([A-Za-z0-9.-]+\.[A-Za-z]{2,})").expect("invalid email regex"));
static ALSO_AFFILIATED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[\W\d_]*\s*also affiliated with\s*[:：-]?\s*").expect("invalid also-affiliated regex")
});
static LEADING_INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?\d+\)?\s*[:：-]?\s*").expect("invalid leading index regex"));
static LEADING_SYMBOLS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\W\d_]+").expect("invalid symbols regex"));
static TRAILING_PUNCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[;,.，。:：\s]+$").expect("invalid trailing punctuation regex"));
static EMAIL_PAREN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\([^)]*@[^)]*\)").expect("invalid email paren regex"));
static SEGMENT_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[;；|]+").expect("invalid segment regex"));

const PUBLIC_MAIL_DOMAINS: [&str; 9] = [
    "gmail.com",
    "outlook.com",
    "hotmail.com",
    "qq.com",
    "163.com",
    "126.com",
    "yahoo.com",
    "proton.me",
    "icloud.com",
];
const GENERIC_DOMAIN_TOKENS: [&str; 11] = [
    "mail", "email", "cs", "ece", "dept", "ac", "edu", "org", "net", "com", "cn",
];

/// 从首页（摘要或第一个章节标题之前）找作者单位
pub fn extract_affiliations(text: &str) -> Vec<String> {
    let lines: Vec<String> = text
        .replace('\r', "\n")
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(clean_text)
        .collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let mut front: Vec<&str> = Vec::new();
    for line in &lines {
        if is_abstract_heading(line) || looks_like_section_heading(line) {
            break;
        }
        front.push(line);
        if front.len() >= MAX_FRONT_LINES {
            break;
        }
    }
    if front.is_empty() {
        front = lines.iter().take(MAX_FRONT_LINES).map(|s| s.as_str()).collect();
    }

    let mut candidates: Vec<String> = Vec::new();
    for line in &front {
        let char_count = line.chars().count();
        if !(4..=180).contains(&char_count) {
            continue;
        }
        if STOP_RE.is_match(line) || !INSTITUTION_RE.is_match(line) {
            continue;
        }
        let digits = line.chars().filter(|c| c.is_ascii_digit()).count();
        if digits > 6.max(char_count / 5) {
            continue;
        }
        for chunk in split_candidates(line) {
            let cleaned = normalize_affiliation(&chunk);
            if !cleaned.is_empty() && INSTITUTION_RE.is_match(&cleaned) {
                candidates.push(cleaned);
            }
        }
    }

    let blob = front.join("\n");
    for caps in EMAIL_RE.captures_iter(&blob) {
        if let Some(label) = domain_to_org_label(&caps[1]) {
            candidates.push(label);
        }
    }

    let mut deduped = dedupe_case_insensitive(candidates);
    deduped.truncate(MAX_AFFILIATIONS);
    deduped
}

fn is_cjk(ch: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&ch)
}

/// 拆开 "MIT1Stanford2" 这类粘连的上标编号
fn split_candidates(text: &str) -> Vec<String> {
    let value = text.trim();
    if value.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = value.chars().collect();
    let mut normalized = String::with_capacity(value.len());
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            normalized.push(chars[i]);
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        let run = &chars[start..i];
        let prev = start.checked_sub(1).map(|p| chars[p]);
        let next = chars.get(i).copied();

        let short = run.len() <= 2;
        let glued = short
            && prev.map(|c| c.is_ascii_alphabetic() || is_cjk(c)).unwrap_or(false)
            && next.map(|c| c.is_ascii_uppercase() || is_cjk(c)).unwrap_or(false);
        let leading = short
            && prev.map(|c| c.is_whitespace()).unwrap_or(true)
            && next.map(|c| c.is_ascii_alphabetic() || is_cjk(c)).unwrap_or(false);

        if glued {
            normalized.push_str("; ");
        } else if !leading {
            normalized.extend(run.iter());
        }
    }

    let parts: Vec<String> = SEGMENT_SPLIT_RE
        .split(&normalized)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        vec![value.to_string()]
    } else {
        parts
    }
}

fn normalize_affiliation(text: &str) -> String {
    let cleaned = clean_text(text);
    let cleaned = ALSO_AFFILIATED_RE.replace(&cleaned, "");
    let cleaned = LEADING_INDEX_RE.replace(&cleaned, "");
    let cleaned = LEADING_SYMBOLS_RE.replace(&cleaned, "");
    let cleaned = TRAILING_PUNCT_RE.replace(&cleaned, "");
    let cleaned = EMAIL_PAREN_RE.replace_all(&cleaned, "");
    if cleaned.chars().count() < 4 {
        return String::new();
    }
    cleaned.into_owned()
}

/// 机构邮箱域名转成简短的机构名，公共邮箱忽略
fn domain_to_org_label(domain: &str) -> Option<String> {
    let value = domain.trim().to_lowercase();
    let value = value.trim_matches('.');
    if value.is_empty() || PUBLIC_MAIL_DOMAINS.contains(&value) {
        return None;
    }

    let parts: Vec<&str> = value.split('.').filter(|s| !s.is_empty()).collect();
    if parts.len() < 2 {
        return None;
    }
    let token = parts[parts.len() - 2];
    if token.len() <= 2 || GENERIC_DOMAIN_TOKENS.contains(&token) {
        return None;
    }

    let token = token.replace('-', " ");
    if token.len() <= 4 {
        return Some(token.to_uppercase());
    }
    Some(
        token
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" "),
    )
}

pub fn dedupe_case_insensitive(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && seen.insert(v.to_lowercase()))
        .collect()
}
