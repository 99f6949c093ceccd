use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use super::ExtractedFigure;
use crate::utils::PaperResult;

const SIGNATURE_TOKENS: usize = 24;
const SIMILAR_CAPTION_RATIO: f64 = 0.72;
const MIN_CONTAINED_SIGNATURE: usize = 26;

static CAPTION_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(figure|fig\.?)\s*\d+\s*[:.\-]?\s*").expect("invalid caption prefix regex"));
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").expect("invalid token regex"));

/// 文件内容的 SHA-256
pub fn file_digest(path: &Path) -> PaperResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// 按内容哈希去重，重复的文件直接删除；空文件和不存在的文件也丢掉
pub fn dedupe_figures(figures: Vec<ExtractedFigure>) -> Vec<ExtractedFigure> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(figures.len());

    for figure in figures {
        let len = std::fs::metadata(&figure.path).map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            if figure.path.exists() {
                discard(&figure.path);
            }
            continue;
        }
        let digest = match file_digest(&figure.path) {
            Ok(d) => d,
            Err(e) => {
                warn!("计算哈希失败 {}: {}", figure.path.display(), e);
                continue;
            }
        };
        if !seen.insert(digest) {
            debug!("删除重复图片: {}", figure.path.display());
            discard(&figure.path);
            continue;
        }
        kept.push(figure);
    }
    kept
}

/// 删除被丢弃的图片，保证 images/ 与结果列表一致
fn discard(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            warn!("删除图片失败 {}: {}", path.display(), e);
            false
        }
    }
}

/// 图注签名：去掉 "Figure N:" 前缀，保留前 24 个长度大于 2 的词
pub fn caption_signature(caption: &str) -> String {
    let lower = caption.to_lowercase();
    let text = CAPTION_PREFIX_RE.replace(&lower, "");
    TOKEN_RE
        .find_iter(&text)
        .map(|m| m.as_str())
        .filter(|tok| tok.len() > 2)
        .take(SIGNATURE_TOKENS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// 与已有图注相同、互相包含（足够长时）或足够相似即视为重复
pub fn caption_is_duplicate(caption: &str, signatures: &[String]) -> bool {
    let candidate = caption_signature(caption);
    if candidate.is_empty() {
        return false;
    }
    signatures.iter().filter(|s| !s.is_empty()).any(|signature| {
        if candidate == *signature {
            return true;
        }
        let contained = candidate.contains(signature.as_str()) || signature.contains(candidate.as_str());
        if contained && candidate.len().min(signature.len()) >= MIN_CONTAINED_SIGNATURE {
            return true;
        }
        strsim::normalized_levenshtein(&candidate, signature) >= SIMILAR_CAPTION_RATIO
    })
}
