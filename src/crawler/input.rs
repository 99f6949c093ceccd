use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::storage::normalize_key;
use crate::utils::{PaperError, PaperResult};

static ARXIV_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d{4}\.\d{4,5}|[a-z\-]+/\d{7})(v\d+)?").expect("invalid arxiv id regex"));
static ARXIV_ID_FULL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d{4}\.\d{4,5}|[a-z\-]+/\d{7})(v\d+)?$").expect("invalid arxiv id regex"));

/// 命令行输入：arXiv 论文或本地 PDF
#[derive(Debug, Clone, PartialEq)]
pub enum PaperInput {
    Arxiv(String),
    LocalPdf(PathBuf),
}

impl PaperInput {
    pub fn parse(raw: &str) -> PaperResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PaperError::InvalidInput("输入为空".to_string()));
        }

        let local = Path::new(raw);
        if local.is_file() {
            let is_pdf = local
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("pdf"))
                .unwrap_or(false);
            if !is_pdf {
                return Err(PaperError::InvalidInput(format!("本地文件只支持 PDF: {}", raw)));
            }
            let path = local.canonicalize()?;
            return Ok(PaperInput::LocalPdf(path));
        }

        if ARXIV_ID_FULL_RE.is_match(raw) {
            return Ok(PaperInput::Arxiv(raw.to_string()));
        }

        if raw.contains("arxiv.org") {
            return match ARXIV_ID_RE.find(raw) {
                Some(m) => Ok(PaperInput::Arxiv(m.as_str().trim_end_matches(".pdf").to_string())),
                None => Err(PaperError::InvalidInput(format!("无法识别的 arXiv 链接: {}", raw))),
            };
        }

        if raw.to_lowercase().ends_with(".pdf") {
            return Err(PaperError::NotFound(PathBuf::from(raw)));
        }

        Err(PaperError::InvalidInput(format!("不支持的输入: {}", raw)))
    }

    /// 缓存目录名：arXiv id 或本地文件名
    pub fn cache_key(&self) -> String {
        match self {
            PaperInput::Arxiv(id) => normalize_key(id),
            PaperInput::LocalPdf(path) => normalize_key(
                &path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bare_ids() {
        assert_eq!(
            PaperInput::parse("2301.00001").unwrap(),
            PaperInput::Arxiv("2301.00001".to_string())
        );
        assert_eq!(
            PaperInput::parse(" 2301.00001v2 ").unwrap(),
            PaperInput::Arxiv("2301.00001v2".to_string())
        );
        assert_eq!(
            PaperInput::parse("hep-th/9901001").unwrap(),
            PaperInput::Arxiv("hep-th/9901001".to_string())
        );
    }

    #[test]
    fn test_arxiv_urls() {
        assert_eq!(
            PaperInput::parse("https://arxiv.org/abs/2301.00001v3").unwrap(),
            PaperInput::Arxiv("2301.00001v3".to_string())
        );
        assert_eq!(
            PaperInput::parse("https://arxiv.org/pdf/2301.00001.pdf").unwrap(),
            PaperInput::Arxiv("2301.00001".to_string())
        );
        assert!(matches!(
            PaperInput::parse("https://arxiv.org/list/cs.AI/recent"),
            Err(PaperError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_local_files() {
        let tmp = TempDir::new().unwrap();
        let pdf = tmp.path().join("My Paper.pdf");
        std::fs::write(&pdf, b"%PDF-1.5").unwrap();
        let txt = tmp.path().join("notes.txt");
        std::fs::write(&txt, b"x").unwrap();

        let input = PaperInput::parse(pdf.to_str().unwrap()).unwrap();
        assert!(matches!(input, PaperInput::LocalPdf(_)));
        assert_eq!(input.cache_key(), "My_Paper");

        // 文件名 "...pdf" 的 stem 是 ".."，不能逃出缓存目录
        let dots = tmp.path().join("...pdf");
        std::fs::write(&dots, b"%PDF-1.5").unwrap();
        let input = PaperInput::parse(dots.to_str().unwrap()).unwrap();
        assert_eq!(input.cache_key(), "paper");

        assert!(matches!(
            PaperInput::parse(txt.to_str().unwrap()),
            Err(PaperError::InvalidInput(_))
        ));
        assert!(matches!(
            PaperInput::parse(tmp.path().join("missing.pdf").to_str().unwrap()),
            Err(PaperError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(PaperInput::parse("   "), Err(PaperError::InvalidInput(_))));
        assert!(matches!(PaperInput::parse("hello world"), Err(PaperError::InvalidInput(_))));
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(PaperInput::Arxiv("cs/0101001".to_string()).cache_key(), "cs_0101001");
    }
}
