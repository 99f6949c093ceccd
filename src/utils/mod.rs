pub mod logger;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaperError {
    #[error("输入无效: {0}")]
    InvalidInput(String),

    #[error("文件不存在: {}", .0.display())]
    NotFound(PathBuf),

    #[error("网络请求错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("请求失败 {status}: {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("下载内容为空: {0}")]
    EmptyPayload(String),

    #[error("PDF处理错误: {0}")]
    PdfError(String),

    #[error("源码包处理错误: {0}")]
    SourceError(String),

    #[error("图片处理错误: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl From<lopdf::Error> for PaperError {
    fn from(e: lopdf::Error) -> Self {
        PaperError::PdfError(e.to_string())
    }
}

pub type PaperResult<T> = Result<T, PaperError>;

/// 压缩空白字符
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 保留三位小数，保证序列化结果稳定
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// 按字符截断，不会切断多字节字符
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  a\n\tb   c "), "a b c");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("论文图片", 2), "论文");
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(0.12345), 0.123);
        assert_eq!(round3(0.9876), 0.988);
    }
}
