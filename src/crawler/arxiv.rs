use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use regex::Regex;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::FetcherConfig;
use crate::parser::affiliations::dedupe_case_insensitive;
use crate::parser::source_bundle::looks_like_html;
use crate::parser::PaperMetadata;
use crate::utils::{clean_text, PaperError, PaperResult};

const RETRY_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];
const MIN_RETRY_AFTER: Duration = Duration::from_millis(300);
const HEAD_BYTES: usize = 512;

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})[-/](\d{2})[-/](\d{2})").expect("invalid date regex"));

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtomEntry {
    id: String,
    title: String,
    summary: String,
    published: String,
    #[serde(rename = "author")]
    authors: Vec<AtomAuthor>,
    #[serde(rename = "link")]
    links: Vec<AtomLink>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtomAuthor {
    name: String,
    #[serde(rename = "arxiv:affiliation", alias = "affiliation")]
    affiliation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@type")]
    link_type: Option<String>,
    #[serde(rename = "@title")]
    title: Option<String>,
}

/// arXiv 客户端：元数据、PDF 与源码包
pub struct ArxivCrawler {
    client: Client,
    config: FetcherConfig,
}

impl ArxivCrawler {
    pub fn new(config: &FetcherConfig) -> PaperResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Atom API 限流严重，每个端点只请求一次，失败后解析 abs 页面
    pub async fn fetch_metadata(&self, arxiv_id: &str) -> PaperResult<PaperMetadata> {
        let api_urls = [
            format!("https://export.arxiv.org/api/query?id_list={}", arxiv_id),
            format!("https://arxiv.org/api/query?id_list={}", arxiv_id),
        ];
        let mut last_error = None;

        for url in &api_urls {
            match self.get_bytes(url, self.config.metadata_attempts).await {
                Ok(bytes) => match parse_atom(&String::from_utf8_lossy(&bytes)) {
                    Some(metadata) => return Ok(complete_metadata(metadata, arxiv_id)),
                    None => warn!("Atom 响应中没有有效条目: {}", url),
                },
                Err(e) => {
                    warn!("元数据请求失败: {}", e);
                    last_error = Some(e);
                }
            }
        }

        let abs_url = format!("https://arxiv.org/abs/{}", arxiv_id);
        info!("回退到 abs 页面: {}", abs_url);
        match self.get_bytes(&abs_url, self.config.max_attempts).await {
            Ok(bytes) => {
                if let Some(metadata) = parse_abs_page(&String::from_utf8_lossy(&bytes)) {
                    return Ok(complete_metadata(metadata, arxiv_id));
                }
            }
            Err(e) => last_error = Some(e),
        }

        Err(last_error.unwrap_or_else(|| PaperError::InvalidInput(format!("arXiv 论文不存在: {}", arxiv_id))))
    }

    /// 下载 PDF，已缓存且内容有效时直接复用
    pub async fn download_pdf(&self, pdf_url: &str, dest: &Path) -> PaperResult<PathBuf> {
        if is_valid_pdf(dest) {
            info!("使用缓存PDF: {}", dest.display());
            return Ok(dest.to_path_buf());
        }
        if dest.exists() {
            warn!("缓存PDF无效，重新下载: {}", dest.display());
            std::fs::remove_file(dest)?;
        }

        info!("下载PDF: {} -> {}", pdf_url, dest.display());
        self.download_to_file(pdf_url, dest).await?;
        if !is_valid_pdf(dest) {
            let _ = std::fs::remove_file(dest);
            return Err(PaperError::PdfError(format!("下载内容不是PDF: {}", pdf_url)));
        }
        Ok(dest.to_path_buf())
    }

    /// 下载 TeX 源码包；拿不到时返回 None，由调用方改走 PDF 提图
    pub async fn download_source(&self, arxiv_id: &str, dest: &Path) -> Option<PathBuf> {
        let head = read_head(dest);
        if !head.is_empty() && !looks_like_html(&head) {
            info!("使用缓存源码包: {}", dest.display());
            return Some(dest.to_path_buf());
        }
        if dest.exists() {
            warn!("缓存源码包无效，重新下载");
            let _ = std::fs::remove_file(dest);
        }

        let urls = [
            format!("https://arxiv.org/src/{}", arxiv_id),
            format!("https://export.arxiv.org/src/{}", arxiv_id),
        ];
        for url in &urls {
            if let Err(e) = self.download_to_file(url, dest).await {
                warn!("源码包下载失败 {}: {}", url, e);
                continue;
            }
            let head = read_head(dest);
            if head.is_empty() || looks_like_html(&head) {
                warn!("源码包是 HTML 页面，丢弃: {}", url);
                let _ = std::fs::remove_file(dest);
                continue;
            }
            return Some(dest.to_path_buf());
        }
        None
    }

    async fn get_bytes(&self, url: &str, max_attempts: u32) -> PaperResult<Vec<u8>> {
        let response = self.send_with_retry(url, max_attempts).await?;
        let bytes = response.bytes().await?;
        debug!("{}: {} 字节", url, bytes.len());
        Ok(bytes.to_vec())
    }

    /// 先写入 <dest>.part，成功后改名
    async fn download_to_file(&self, url: &str, dest: &Path) -> PaperResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(dest);
        let result = self.stream_to(url, &part).await;
        match result {
            Ok(0) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(PaperError::EmptyPayload(url.to_string()))
            }
            Ok(written) => {
                tokio::fs::rename(&part, dest).await?;
                info!("下载完成: {} ({} 字节)", dest.display(), written);
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, url: &str, part: &Path) -> PaperResult<u64> {
        let mut response = self.send_with_retry(url, self.config.max_attempts).await?;
        let mut file = tokio::fs::File::create(part).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// 429/5xx 按 Retry-After 或线性退避重试，其余状态码直接失败
    async fn send_with_retry(&self, url: &str, max_attempts: u32) -> PaperResult<Response> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!("GET (第 {}/{} 次): {}", attempt, max_attempts, url);
            let response = match self.client.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!("请求失败 (第 {}/{} 次): {}", attempt, max_attempts, e);
                    if attempt >= max_attempts {
                        return Err(e.into());
                    }
                    tokio::time::sleep(retry_delay(attempt, None, self.config.backoff_base_ms)).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if RETRY_STATUS_CODES.contains(&status.as_u16()) && attempt < max_attempts {
                let retry_after = response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok());
                let delay = retry_delay(attempt, retry_after, self.config.backoff_base_ms);
                warn!("{} 返回 {}，{}ms 后重试", url, status, delay.as_millis());
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(PaperError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
    }
}

/// Retry-After 为整数秒时采用（至少 0.3 秒），否则 base * attempt
pub fn retry_delay(attempt: u32, retry_after: Option<&str>, base_ms: u64) -> Duration {
    if let Some(secs) = retry_after.map(str::trim).and_then(|v| v.parse::<u64>().ok()) {
        return Duration::from_secs(secs).max(MIN_RETRY_AFTER);
    }
    Duration::from_millis(base_ms * attempt as u64)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn read_head(path: &Path) -> Vec<u8> {
    let mut head = Vec::with_capacity(HEAD_BYTES);
    if let Ok(file) = std::fs::File::open(path) {
        let _ = file.take(HEAD_BYTES as u64).read_to_end(&mut head);
    }
    head
}

fn is_valid_pdf(path: &Path) -> bool {
    let head = read_head(path);
    head.starts_with(b"%PDF") && !looks_like_html(&head)
}

fn complete_metadata(mut metadata: PaperMetadata, arxiv_id: &str) -> PaperMetadata {
    metadata.arxiv_id = Some(arxiv_id.to_string());
    metadata.url = Some(format!("https://arxiv.org/abs/{}", arxiv_id));
    if metadata.pdf_url.is_none() {
        metadata.pdf_url = Some(format!("https://arxiv.org/pdf/{}.pdf", arxiv_id));
    }
    metadata
}

/// 解析 Atom 响应的第一条记录
pub fn parse_atom(xml: &str) -> Option<PaperMetadata> {
    let feed: AtomFeed = match from_str(xml) {
        Ok(feed) => feed,
        Err(e) => {
            warn!("Atom 解析失败: {}", e);
            return None;
        }
    };
    let entry = feed.entries.into_iter().next()?;
    let title = clean_text(&entry.title);
    if title.is_empty() || entry.id.contains("/api/errors") {
        return None;
    }

    let mut authors = Vec::new();
    let mut affiliations = Vec::new();
    for author in entry.authors {
        let name = clean_text(&author.name);
        if !name.is_empty() {
            authors.push(name);
        }
        if let Some(affiliation) = author.affiliation.map(|a| clean_text(&a)).filter(|a| !a.is_empty()) {
            affiliations.push(affiliation);
        }
    }

    let pdf_url = entry
        .links
        .iter()
        .find(|link| {
            link.link_type.as_deref() == Some("application/pdf")
                || link.title.as_deref().map(|t| t.eq_ignore_ascii_case("pdf")).unwrap_or(false)
                || link.href.as_deref().map(|h| h.ends_with(".pdf")).unwrap_or(false)
        })
        .and_then(|link| link.href.as_deref())
        .map(normalize_arxiv_url);

    let abstract_text = clean_text(&entry.summary);
    Some(PaperMetadata {
        title: Some(title),
        authors,
        affiliations: dedupe_case_insensitive(affiliations),
        abstract_text: (!abstract_text.is_empty()).then_some(abstract_text),
        published_date: parse_published_date(&entry.published),
        pdf_url,
        ..PaperMetadata::default()
    })
}

/// 解析 arxiv.org/abs 页面：citation_* meta 标签、h1.title、blockquote.abstract
pub fn parse_abs_page(html: &str) -> Option<PaperMetadata> {
    let document = Html::parse_document(html);

    let title = meta_values(&document, "citation_title")
        .into_iter()
        .next()
        .or_else(|| select_text(&document, "h1.title").map(|t| strip_label(&t, "title:")))
        .filter(|t| !t.is_empty());
    let authors = meta_values(&document, "citation_author");
    let mut affiliations = meta_values(&document, "citation_author_institution");
    affiliations.extend(meta_values(&document, "citation_author_affiliation"));
    let abstract_text = select_text(&document, "blockquote.abstract")
        .or_else(|| meta_values(&document, "description").into_iter().next())
        .map(|a| strip_label(&a, "abstract:"))
        .filter(|a| !a.is_empty());

    if title.is_none() && abstract_text.is_none() && authors.is_empty() {
        return None;
    }

    Some(PaperMetadata {
        title,
        authors,
        affiliations: dedupe_case_insensitive(affiliations),
        abstract_text,
        published_date: meta_values(&document, "citation_date")
            .first()
            .and_then(|d| parse_published_date(d)),
        pdf_url: meta_values(&document, "citation_pdf_url").into_iter().next(),
        ..PaperMetadata::default()
    })
}

fn meta_values(document: &Html, name: &str) -> Vec<String> {
    let selector = match Selector::parse(&format!("meta[name=\"{}\"]", name)) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(clean_text)
        .filter(|v| !v.is_empty())
        .collect()
}

fn select_text(document: &Html, css: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| element_text(&el))
        .filter(|t| !t.is_empty())
}

fn element_text(element: &ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

/// 去掉 "Title:" / "Abstract:" 这类前缀（不区分大小写）
fn strip_label(text: &str, label: &str) -> String {
    let trimmed = text.trim();
    match trimmed.get(..label.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(label) => trimmed[label.len()..].trim().to_string(),
        _ => trimmed.to_string(),
    }
}

fn normalize_arxiv_url(url: &str) -> String {
    match url.strip_prefix("http://arxiv.org/") {
        Some(rest) => format!("https://arxiv.org/{}", rest),
        None => url.to_string(),
    }
}

/// 统一为 UTC 的 RFC 3339；只有日期时取当天零点
pub fn parse_published_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    let caps = DATE_RE.captures(raw)?;
    let date = NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?)?;
    let naive = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive).to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ATOM_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <id>http://arxiv.org/api/query?id_list=1706.03762</id>
  <title>arXiv Query</title>
  <entry>
    <id>http://arxiv.org/abs/1706.03762v7</id>
    <updated>2023-08-02T17:54:37Z</updated>
    <published>2017-06-12T17:57:40Z</published>
    <title>Attention Is All
      You Need</title>
    <summary>
      The dominant sequence transduction models are based on recurrent networks.
    </summary>
    <author>
      <name>Ashish Vaswani</name>
      <arxiv:affiliation>Google Brain</arxiv:affiliation>
    </author>
    <author>
      <name>Noam Shazeer</name>
      <arxiv:affiliation>google brain</arxiv:affiliation>
    </author>
    <link href="http://arxiv.org/abs/1706.03762v7" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/1706.03762v7" rel="related" type="application/pdf"/>
    <category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>
"#;

    const ABS_HTML: &str = r#"<html><head>
<meta name="citation_title" content="Attention Is All You Need" />
<meta name="citation_author" content="Vaswani, Ashish" />
<meta name="citation_author" content="Shazeer, Noam" />
<meta name="citation_date" content="2017/06/12" />
<meta name="citation_pdf_url" content="https://arxiv.org/pdf/1706.03762" />
</head><body>
<h1 class="title mathjax"><span class="descriptor">Title:</span>Attention Is All You Need</h1>
<blockquote class="abstract mathjax"><span class="descriptor">Abstract:</span>
  The dominant sequence &amp; transduction models.</blockquote>
</body></html>"#;

    #[test]
    fn test_parse_atom() {
        let metadata = parse_atom(ATOM_XML).unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Attention Is All You Need"));
        assert_eq!(metadata.authors, vec!["Ashish Vaswani", "Noam Shazeer"]);
        assert_eq!(metadata.affiliations, vec!["Google Brain"]);
        assert_eq!(
            metadata.abstract_text.as_deref(),
            Some("The dominant sequence transduction models are based on recurrent networks.")
        );
        assert_eq!(metadata.published_date.as_deref(), Some("2017-06-12T17:57:40Z"));
        assert_eq!(metadata.pdf_url.as_deref(), Some("https://arxiv.org/pdf/1706.03762v7"));
    }

    #[test]
    fn test_parse_atom_without_entry() {
        let empty = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>arXiv Query</title></feed>"#;
        assert!(parse_atom(empty).is_none());
        assert!(parse_atom("not xml <<<").is_none());
    }

    #[test]
    fn test_parse_abs_page() {
        let metadata = parse_abs_page(ABS_HTML).unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Attention Is All You Need"));
        assert_eq!(metadata.authors, vec!["Vaswani, Ashish", "Shazeer, Noam"]);
        assert_eq!(
            metadata.abstract_text.as_deref(),
            Some("The dominant sequence & transduction models.")
        );
        assert_eq!(metadata.published_date.as_deref(), Some("2017-06-12T00:00:00Z"));
        assert_eq!(metadata.pdf_url.as_deref(), Some("https://arxiv.org/pdf/1706.03762"));

        let completed = complete_metadata(metadata, "1706.03762");
        assert_eq!(completed.url.as_deref(), Some("https://arxiv.org/abs/1706.03762"));
        assert!(parse_abs_page("<html><body>nothing</body></html>").is_none());
    }

    #[test]
    fn test_parse_abs_page_title_fallback() {
        let html = r#"<h1 class="title">Title: Fallback Title</h1>"#;
        let metadata = parse_abs_page(html).unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Fallback Title"));
        let completed = complete_metadata(metadata, "2301.00001");
        assert_eq!(completed.pdf_url.as_deref(), Some("https://arxiv.org/pdf/2301.00001.pdf"));
    }

    #[test]
    fn test_parse_published_date() {
        assert_eq!(
            parse_published_date("2017-06-12T19:57:40+02:00").as_deref(),
            Some("2017-06-12T17:57:40Z")
        );
        assert_eq!(parse_published_date("2020-02-30"), None);
        assert_eq!(parse_published_date(""), None);
    }

    #[test]
    fn test_retry_delay() {
        assert_eq!(retry_delay(1, Some("5"), 1400), Duration::from_secs(5));
        assert_eq!(retry_delay(1, Some("0"), 1400), Duration::from_millis(300));
        assert_eq!(retry_delay(3, Some("soon"), 1400), Duration::from_millis(4200));
        assert_eq!(retry_delay(2, None, 1400), Duration::from_millis(2800));
    }

    #[test]
    fn test_part_path() {
        assert_eq!(part_path(Path::new("/tmp/a.pdf")), PathBuf::from("/tmp/a.pdf.part"));
    }

    #[tokio::test]
    async fn test_cached_downloads_are_reused() {
        let tmp = TempDir::new().unwrap();
        let crawler = ArxivCrawler::new(&FetcherConfig::default()).unwrap();

        let pdf = tmp.path().join("2301.00001.pdf");
        std::fs::write(&pdf, b"%PDF-1.5\n...").unwrap();
        // 不会发出请求
        let got = crawler.download_pdf("http://127.0.0.1:9/unused.pdf", &pdf).await.unwrap();
        assert_eq!(got, pdf);

        let source = tmp.path().join("2301.00001-source.bin");
        std::fs::write(&source, b"\x1f\x8b\x08\x00").unwrap();
        assert_eq!(crawler.download_source("2301.00001", &source).await, Some(source.clone()));
    }

    #[test]
    fn test_cached_html_is_not_a_pdf() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.pdf");
        std::fs::write(&path, b"<!DOCTYPE html><html>rate limited</html>").unwrap();
        assert!(!is_valid_pdf(&path));
        assert!(!is_valid_pdf(&tmp.path().join("missing.pdf")));
    }
}
