use lopdf::{Document, Object};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use super::page_layout::decode_pdf_string;
use super::Section;
use crate::utils::{clean_text, PaperError, PaperResult};

static PAGE_NOISE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+|page \d+|arxiv:.*)$").expect("invalid page noise regex"));
static REPEATED_NOISE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(arxiv|proceedings|copyright|acm)\b").expect("invalid repeated noise regex"));
static LEGAL_NOISE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(copyright|permission|acm|isbn|doi)\b").expect("invalid legal noise regex"));
static SECTION_HEADING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(\d+(?:\.\d+)*)?\.?\s*(abstract|introduction|background|related work|methods?|approach|experiments?|results?|discussion|conclusions?)\s*$",
    )
    .expect("invalid section heading regex")
});
static HEADING_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(\d+(\.\d+)*)?\.?\s*(introduction|background|related work|method|methods|approach|experiments?|results?|discussion|conclusion|references?)\b",
    )
    .expect("invalid heading prefix regex")
});
static ABSTRACT_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^abstract[:\s]*$").expect("invalid abstract regex"));
static ABSTRACT_WINDOW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\babstract\b[:\s]*(.+?)(?:\n\s*(?:1|i)\.?\s+introduction\b|\bintroduction\b|$)")
        .expect("invalid abstract window regex")
});
static AUTHOR_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r",| and ").expect("invalid author split regex"));

const MAX_ABSTRACT_WORDS: usize = 220;
const MAX_ABSTRACT_CHARS: usize = 1200;
const FALLBACK_ABSTRACT_WORDS: usize = 180;

/// PDF 自带的元数据
#[derive(Debug, Clone, Default)]
pub struct PdfInfo {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub page_count: usize,
    pub byte_len: u64,
}

pub struct PdfParser;

impl PdfParser {
    pub fn new() -> Self {
        Self
    }

    /// 提取完整文本并去掉页眉页脚噪声
    pub fn extract_full_text(&self, pdf_path: &Path) -> PaperResult<String> {
        info!("提取PDF完整文本: {}", pdf_path.display());

        if !pdf_path.exists() {
            return Err(PaperError::NotFound(pdf_path.to_path_buf()));
        }

        let raw = guarded_extract(pdf_path, |path: &Path| pdf_extract::extract_text(path))?;
        let text = normalize_text(&raw);
        if text.trim().is_empty() {
            return Err(PaperError::PdfError(format!(
                "PDF中未提取到文本: {}",
                pdf_path.display()
            )));
        }
        info!("提取文本长度: {} 字符", text.len());

        Ok(text)
    }

    /// 读取页数与 Info 字典中的标题、作者
    pub fn inspect(&self, pdf_path: &Path) -> PaperResult<PdfInfo> {
        if !pdf_path.exists() {
            return Err(PaperError::NotFound(pdf_path.to_path_buf()));
        }
        let byte_len = std::fs::metadata(pdf_path)?.len();
        let doc = Document::load(pdf_path)?;
        let page_count = doc.get_pages().len();

        let mut info = PdfInfo {
            page_count,
            byte_len,
            ..PdfInfo::default()
        };

        if let Some(dict) = doc
            .trailer
            .get(b"Info")
            .ok()
            .and_then(|obj| doc.dereference(obj).ok())
            .and_then(|(_, obj)| obj.as_dict().ok())
        {
            let read = |key: &[u8]| -> Option<String> {
                match dict.get(key).ok().and_then(|o| doc.dereference(o).ok()) {
                    Some((_, Object::String(bytes, _))) => {
                        let value = clean_text(&decode_pdf_string(bytes));
                        (!value.is_empty()).then_some(value)
                    }
                    _ => None,
                }
            };
            info.title = read(b"Title");
            info.authors = read(b"Author").map(|a| parse_authors(&a)).unwrap_or_default();
        }

        info!("PDF: {} 页, {:.1}MB", info.page_count, info.byte_len as f64 / 1e6);
        Ok(info)
    }
}

/// pdf-extract 遇到损坏的字体或编码表会直接 panic，这里转成 PdfError
fn guarded_extract<F, E>(pdf_path: &Path, extract: F) -> PaperResult<String>
where
    F: FnOnce(&Path) -> Result<String, E>,
    E: std::fmt::Display,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| extract(pdf_path))) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(PaperError::PdfError(e.to_string())),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!("PDF文本提取崩溃 {}: {}", pdf_path.display(), message);
            Err(PaperError::PdfError(format!("PDF文本提取失败（文件可能已损坏）: {}", message)))
        }
    }
}

/// 按逗号和 and 拆分作者字段
pub fn parse_authors(field: &str) -> Vec<String> {
    AUTHOR_SPLIT_RE
        .split(field)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 合并断字、压缩空行，去掉页码和反复出现的页眉页脚
pub fn normalize_text(raw: &str) -> String {
    let joined = raw.replace('\r', "\n").replace("-\n", "");

    let mut lines: Vec<String> = Vec::new();
    for raw_line in joined.lines() {
        let line = clean_text(raw_line);
        if line.is_empty() {
            if lines.last().map(|l| !l.is_empty()).unwrap_or(false) {
                lines.push(String::new());
            }
            continue;
        }
        if PAGE_NOISE_RE.is_match(&line) {
            continue;
        }
        lines.push(line);
    }

    let mut frequency: HashMap<&str, usize> = HashMap::new();
    for line in lines.iter().filter(|l| !l.is_empty() && l.len() <= 90) {
        *frequency.entry(line.as_str()).or_default() += 1;
    }

    let kept: Vec<&str> = lines
        .iter()
        .filter(|line| !is_repeated_noise(line, frequency.get(line.as_str()).copied().unwrap_or(0)))
        .map(|s| s.as_str())
        .collect();

    kept.join("\n").trim().to_string()
}

fn is_repeated_noise(line: &str, frequency: usize) -> bool {
    if frequency < 3 || SECTION_HEADING_RE.is_match(line) {
        return false;
    }
    REPEATED_NOISE_RE.is_match(line) || line.len() < 80
}

fn is_legal_noise(line: &str) -> bool {
    LEGAL_NOISE_RE.is_match(line)
}

pub fn looks_like_section_heading(line: &str) -> bool {
    HEADING_PREFIX_RE.is_match(line)
}

pub fn is_abstract_heading(line: &str) -> bool {
    ABSTRACT_LINE_RE.is_match(line.trim())
}

/// 摘要：Abstract 标题之后的段落，其次是 Introduction 之前的文本，最后取开头若干词
pub fn extract_abstract(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(|l| l.trim()).collect();
    for (idx, line) in lines.iter().enumerate() {
        if !is_abstract_heading(line) {
            continue;
        }
        let mut collected: Vec<&str> = Vec::new();
        let mut words = 0;
        for inner in &lines[idx + 1..] {
            if inner.is_empty() {
                if !collected.is_empty() {
                    break;
                }
                continue;
            }
            if looks_like_section_heading(inner) {
                break;
            }
            if is_legal_noise(inner) {
                continue;
            }
            collected.push(inner);
            words += inner.split_whitespace().count();
            if words >= MAX_ABSTRACT_WORDS {
                break;
            }
        }
        if !collected.is_empty() {
            return clean_text(&collected.join(" "));
        }
    }

    if let Some(caps) = ABSTRACT_WINDOW_RE.captures(text) {
        let window = clean_text(&caps[1]);
        if !window.is_empty() {
            return window.chars().take(MAX_ABSTRACT_CHARS).collect();
        }
    }

    text.split_whitespace()
        .take(FALLBACK_ABSTRACT_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// 按常见章节标题切分正文，标题之前的内容归入 "Main Content"
pub fn split_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut current_title = "Main Content".to_string();
    let mut current_level = 2u8;
    let mut current_lines: Vec<&str> = Vec::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = SECTION_HEADING_RE.captures(line) {
            if !current_lines.is_empty() {
                sections.push(Section {
                    title: title_case(&current_title),
                    level: current_level,
                    content: current_lines.join("\n").trim().to_string(),
                });
            }
            current_level = caps
                .get(1)
                .map(|n| 2 + n.as_str().matches('.').count() as u8)
                .unwrap_or(2);
            current_title = caps[2].to_string();
            current_lines.clear();
            continue;
        }

        current_lines.push(line);
    }

    if !current_lines.is_empty() {
        sections.push(Section {
            title: title_case(&current_title),
            level: current_level,
            content: current_lines.join("\n").trim().to_string(),
        });
    }

    if sections.is_empty() {
        sections.push(Section {
            title: "Main Content".to_string(),
            level: 2,
            content: text.trim().to_string(),
        });
    }

    sections
}

fn title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut at_word_start = true;
    for ch in value.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

impl Default for PdfParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::page_layout::tests::build_pdf;
    use tempfile::TempDir;

    const SAMPLE: &str = "Fast Serving of Large Models\n\
        Alice Zhang and Bob Li\n\
        Tsinghua University\n\
        \n\
        Abstract\n\
        We present a serving system that\n\
        cuts latency in half.\n\
        \n\
        1 Introduction\n\
        Large models are expensive.\n\
        2.1 Results\n\
        Latency drops by 50%.\n";

    #[test]
    fn test_normalize_drops_page_numbers_and_running_headers() {
        let raw = "Header Line\nBody one\n3\nHeader Line\nBody two\nPage 4\nHeader Line\narXiv:2301.00001v1\nBody thr-\nee\n";
        let text = normalize_text(raw);
        assert_eq!(text, "Body one\nBody two\nBody three");
    }

    #[test]
    fn test_normalize_keeps_repeated_headings() {
        let raw = "Results\nA\nResults\nB\nResults\nC\n";
        assert!(normalize_text(raw).contains("Results"));
    }

    #[test]
    fn test_extract_abstract_after_heading() {
        assert_eq!(
            extract_abstract(SAMPLE),
            "We present a serving system that cuts latency in half."
        );
    }

    #[test]
    fn test_extract_abstract_inline_window() {
        let text = "Title\nAbstract: short summary here. Introduction starts now.";
        assert_eq!(extract_abstract(text), "short summary here.");
    }

    #[test]
    fn test_extract_abstract_fallback_first_words() {
        let text = "one two three";
        assert_eq!(extract_abstract(text), "one two three");
    }

    #[test]
    fn test_split_sections_levels_and_titles() {
        let sections = split_sections(SAMPLE);
        let titles: Vec<&str> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Main Content", "Abstract", "Introduction", "Results"]);
        assert_eq!(sections[2].level, 2);
        assert_eq!(sections[3].level, 3);
        assert_eq!(sections[3].content, "Latency drops by 50%.");
    }

    #[test]
    fn test_split_sections_never_empty() {
        let sections = split_sections("   ");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Main Content");
    }

    #[test]
    fn test_parse_authors() {
        assert_eq!(
            parse_authors("Alice Zhang, Bob Li and Carol Wu"),
            vec!["Alice Zhang", "Bob Li", "Carol Wu"]
        );
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("related work"), "Related Work");
        assert_eq!(title_case("RESULTS"), "Results");
    }

    #[test]
    fn test_extract_panic_becomes_pdf_error() {
        let result = guarded_extract(Path::new("broken.pdf"), |_: &Path| -> Result<String, String> {
            panic!("bad font widths")
        });
        match result {
            Err(PaperError::PdfError(message)) => assert!(message.contains("bad font widths"), "{}", message),
            other => panic!("unexpected: {:?}", other),
        }

        let failed = guarded_extract(Path::new("x.pdf"), |_: &Path| Err::<String, _>("no pages"));
        assert!(matches!(failed, Err(PaperError::PdfError(m)) if m == "no pages"));
    }

    #[test]
    fn test_extract_full_text_reads_fixture() {
        let tmp = TempDir::new().unwrap();
        let pdf = tmp.path().join("fixture.pdf");
        build_pdf(&[(vec![], vec![(72.0, 700.0, "Abstract"), (72.0, 680.0, "We study serving systems.")])])
            .save(&pdf)
            .unwrap();

        let text = PdfParser::new().extract_full_text(&pdf).unwrap();
        assert!(text.contains("serving"), "{}", text);
        assert!(matches!(
            PdfParser::new().extract_full_text(&tmp.path().join("missing.pdf")),
            Err(PaperError::NotFound(_))
        ));
    }
}
