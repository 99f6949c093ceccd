use std::path::Path;

use crate::parser::Paper;

const MAX_SECTIONS: usize = 10;
const MAX_SECTION_CHARS: usize = 1500;
const MAX_CAPTIONS: usize = 20;

/// 风格打分的输入文本及其来源
#[derive(Debug, Clone, PartialEq)]
pub struct StyleText {
    pub text: String,
    pub source_kind: &'static str,
}

/// 输入可以是解析缓存 JSON、任意文本文件或直接的文本
pub fn load_style_text(input: &str) -> StyleText {
    let path = Path::new(input);
    if !path.is_file() {
        return StyleText {
            text: input.trim().to_string(),
            source_kind: "raw_text",
        };
    }

    let raw = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            return StyleText {
                text: input.trim().to_string(),
                source_kind: "raw_text",
            }
        }
    };

    match serde_json::from_str::<Paper>(&raw) {
        Ok(paper) => StyleText {
            text: paper_style_text(&paper),
            source_kind: "parsed_json",
        },
        Err(_) => StyleText {
            text: raw,
            source_kind: "raw_file",
        },
    }
}

/// 标题、摘要、前几节内容和图注拼成打分文本
pub fn paper_style_text(paper: &Paper) -> String {
    let sections = paper.sections.iter().take(MAX_SECTIONS);
    let titles: Vec<&str> = sections.clone().map(|s| s.title.as_str()).collect();
    let contents: Vec<String> = sections
        .map(|s| s.content.chars().take(MAX_SECTION_CHARS).collect())
        .collect();
    let captions: Vec<&str> = paper
        .images
        .iter()
        .take(MAX_CAPTIONS)
        .map(|i| i.caption.as_str())
        .collect();

    [
        paper.title.clone(),
        paper.abstract_text.clone(),
        titles.join("\n"),
        contents.join("\n"),
        captions.join("\n"),
    ]
    .join("\n")
    .trim()
    .to_string()
}
