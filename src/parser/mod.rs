pub mod affiliations;
pub mod dedupe;
pub mod figure_locator;
pub mod image_analyzer;
pub mod page_layout;
pub mod pdf_parser;
pub mod source_bundle;
pub mod tex_source;

pub use figure_locator::FigureLocator;
pub use image_analyzer::ImageAnalyzer;
pub use pdf_parser::{PdfInfo, PdfParser};
pub use tex_source::TexSourceExtractor;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::ExtractionConfig;
use crate::storage::PaperWorkspace;
use crate::utils::PaperResult;
use dedupe::{caption_is_duplicate, caption_signature, dedupe_figures};

/// 论文章节
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub level: u8,
    pub content: String,
}

/// 写入缓存的插图信息，url 相对论文目录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub url: String,
    pub caption: String,
    pub position: usize,
    pub relevance_score: f64,
}

/// 解析结果，即 parsed/<id>.json 的内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paper {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub affiliations: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub published_date: Option<String>,
    pub arxiv_id: Option<String>,
    pub pdf_url: Option<String>,
    pub url: Option<String>,
    pub sections: Vec<Section>,
    pub images: Vec<ImageInfo>,
}

/// 外部来源（arXiv）给出的元数据，优先于 PDF 自带的信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub affiliations: Vec<String>,
    pub abstract_text: Option<String>,
    pub published_date: Option<String>,
    pub arxiv_id: Option<String>,
    pub pdf_url: Option<String>,
    pub url: Option<String>,
}

/// 提取器产出的一张图
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFigure {
    pub path: PathBuf,
    pub caption: String,
    pub relevance: f64,
}

/// 最终插图来自哪一层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageBackend {
    #[serde(rename = "tex-source")]
    TexSource,
    #[serde(rename = "tex-source+pdf-supplement")]
    TexSourceWithPdfSupplement,
    #[serde(rename = "pdf-layout")]
    PdfLayout,
    #[serde(rename = "none")]
    None,
}

impl ImageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageBackend::TexSource => "tex-source",
            ImageBackend::TexSourceWithPdfSupplement => "tex-source+pdf-supplement",
            ImageBackend::PdfLayout => "pdf-layout",
            ImageBackend::None => "none",
        }
    }
}

impl fmt::Display for ImageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 是否尝试 TeX 源码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePolicy {
    Auto,
    Always,
    Never,
}

impl SourcePolicy {
    /// 未识别的取值按 auto 处理
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "never" | "no" | "false" | "0" => SourcePolicy::Never,
            "always" | "yes" | "true" | "1" => SourcePolicy::Always,
            _ => SourcePolicy::Auto,
        }
    }

    /// 返回 Err(原因) 表示跳过源码
    pub fn decide(&self, info: &PdfInfo, config: &ExtractionConfig) -> Result<(), String> {
        match self {
            SourcePolicy::Always => Ok(()),
            SourcePolicy::Never => Err("source policy: never".to_string()),
            SourcePolicy::Auto => {
                let mut reasons = Vec::new();
                if info.byte_len > 0 && info.byte_len >= config.auto_skip_pdf_bytes {
                    reasons.push(format!(
                        "size {:.1}MB >= {:.0}MB",
                        info.byte_len as f64 / 1e6,
                        config.auto_skip_pdf_bytes as f64 / 1e6
                    ));
                }
                if info.page_count > 0 && info.page_count >= config.auto_skip_pdf_pages {
                    reasons.push(format!("pages {} >= {}", info.page_count, config.auto_skip_pdf_pages));
                }
                if reasons.is_empty() {
                    Ok(())
                } else {
                    Err(format!("auto-skip source ({})", reasons.join(", ")))
                }
            }
        }
    }
}

/// 图片提取的源码输入：源码包路径，或跳过的原因
#[derive(Debug, Clone)]
pub enum SourceInput {
    Bundle(PathBuf),
    Skipped(String),
}

/// 两层提图的结果
#[derive(Debug, Clone)]
pub struct FigureOutcome {
    pub figures: Vec<ExtractedFigure>,
    pub backend: ImageBackend,
    pub status: String,
}

/// 一次完整提取的报告
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub paper: Paper,
    pub backend: ImageBackend,
    pub source_status: String,
    pub images_available: usize,
    pub parsed_path: PathBuf,
}

/// 统一提取管道
pub struct ExtractionPipeline {
    config: ExtractionConfig,
    pdf_parser: PdfParser,
    tex_source: TexSourceExtractor,
    locator: FigureLocator,
}

impl ExtractionPipeline {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            config: config.clone(),
            pdf_parser: PdfParser::new(),
            tex_source: TexSourceExtractor::new(config),
            locator: FigureLocator::new(config),
        }
    }

    /// 按策略与 PDF 体积决定是否下载源码，Err 中是跳过原因
    pub fn plan_source(&self, pdf_path: &Path) -> Result<(), String> {
        let policy = SourcePolicy::parse(&self.config.source_policy);
        if policy == SourcePolicy::Never {
            return policy.decide(&PdfInfo::default(), &self.config);
        }
        let info = match self.pdf_parser.inspect(pdf_path) {
            Ok(info) => info,
            Err(e) => {
                warn!("读取PDF信息失败: {}", e);
                PdfInfo::default()
            }
        };
        let decision = policy.decide(&info, &self.config);
        if let Err(reason) = &decision {
            info!("跳过 TeX 源码: {}", reason);
        }
        decision
    }

    /// 处理一篇论文：文本、插图，写入 parsed/<id>.json
    pub fn process(
        &self,
        pdf_path: &Path,
        workspace: &PaperWorkspace,
        source: SourceInput,
        metadata: &PaperMetadata,
    ) -> PaperResult<ExtractionReport> {
        info!("开始提取管道: {}", pdf_path.display());

        // 1. 文本，读不出来直接失败
        let text = self.pdf_parser.extract_full_text(pdf_path)?;
        let pdf_info = match self.pdf_parser.inspect(pdf_path) {
            Ok(info) => info,
            Err(e) => {
                warn!("读取PDF信息失败: {}", e);
                PdfInfo::default()
            }
        };
        let mut paper = build_paper(workspace.key(), pdf_path, &text, &pdf_info, metadata);
        info!("提取到 {} 个章节, {} 条机构", paper.sections.len(), paper.affiliations.len());

        // 2. 插图
        let outcome = self.extract_figures(pdf_path, workspace, source)?;
        paper.images = image_infos(&outcome.figures, workspace.paper_dir());
        info!("图片后端: {} ({} 张) {}", outcome.backend, paper.images.len(), outcome.status);

        let parsed_path = workspace.save_paper(&paper)?;
        Ok(ExtractionReport {
            images_available: paper.images.len(),
            paper,
            backend: outcome.backend,
            source_status: outcome.status,
            parsed_path,
        })
    }

    /// 先走 TeX 源码，缺图时用 PDF 补齐；没有结果再整体退回 PDF 版面提取
    pub fn extract_figures(
        &self,
        pdf_path: &Path,
        workspace: &PaperWorkspace,
        source: SourceInput,
    ) -> PaperResult<FigureOutcome> {
        let images_dir = workspace.reset_images()?;
        let mut outcome = FigureOutcome {
            figures: Vec::new(),
            backend: ImageBackend::None,
            status: String::new(),
        };

        match source {
            SourceInput::Bundle(bundle) => {
                info!("尝试 TeX 源码提图");
                let source_dir = workspace.reset_sources()?;
                let result = self.tex_source.extract(&bundle, &source_dir, &images_dir);
                outcome.status = result.status;
                if !result.figures.is_empty() {
                    outcome.figures = result.figures;
                    outcome.backend = ImageBackend::TexSource;
                    if result.figure_blocks > outcome.figures.len() {
                        info!("源码缺少部分插图，用 PDF 补齐");
                        let added = self.supplement_from_pdf(
                            pdf_path,
                            workspace,
                            &images_dir,
                            &mut outcome.figures,
                            result.figure_blocks,
                        );
                        if added > 0 {
                            outcome.status =
                                format!("{}; supplemented {} figure(s) from PDF fallback", outcome.status, added);
                            outcome.backend = ImageBackend::TexSourceWithPdfSupplement;
                        }
                    }
                } else {
                    warn!("TeX 源码未产出图片: {}", outcome.status);
                }
            }
            SourceInput::Skipped(reason) => outcome.status = reason,
        }

        if outcome.figures.is_empty() {
            info!("改用 PDF 版面提图");
            let images_dir = workspace.reset_images()?;
            let found = match self.locator.extract(pdf_path, &images_dir) {
                Ok(found) => dedupe_figures(found),
                Err(e) => {
                    warn!("PDF 版面提图失败: {}", e);
                    Vec::new()
                }
            };
            let pdf_status = format!("pdf layout images {}", found.len());
            outcome.status = if outcome.status.is_empty() {
                pdf_status
            } else {
                format!("{}; {}", outcome.status, pdf_status)
            };
            if !found.is_empty() {
                outcome.backend = ImageBackend::PdfLayout;
            }
            outcome.figures = found;
        }

        outcome.figures = dedupe_figures(outcome.figures);
        Ok(outcome)
    }

    /// 从 PDF 版面结果中补齐 TikZ 等无法从源码得到的图，跳过图注重复的
    fn supplement_from_pdf(
        &self,
        pdf_path: &Path,
        workspace: &PaperWorkspace,
        images_dir: &Path,
        figures: &mut Vec<ExtractedFigure>,
        required: usize,
    ) -> usize {
        let scratch = match workspace.scratch_dir("pdfsupp") {
            Ok(dir) => dir,
            Err(e) => {
                warn!("无法创建临时目录: {}", e);
                return 0;
            }
        };
        let candidates = match self.locator.extract(pdf_path, &scratch) {
            Ok(found) => dedupe_figures(found),
            Err(e) => {
                warn!("PDF 补图失败: {}", e);
                Vec::new()
            }
        };

        let mut signatures: Vec<String> = figures.iter().map(|f| caption_signature(&f.caption)).collect();
        let need = required.saturating_sub(figures.len());
        let mut added = 0;
        for candidate in candidates {
            if need > 0 && added >= need {
                break;
            }
            if caption_is_duplicate(&candidate.caption, &signatures) {
                continue;
            }
            let ext = candidate
                .path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase)
                .unwrap_or_else(|| "png".to_string());
            let ext = if ext == "jpeg" { "jpg".to_string() } else { ext };
            let output = images_dir.join(format!("pdfsupp_{:03}.{}", added + 1, ext));
            if let Err(e) = std::fs::copy(&candidate.path, &output) {
                warn!("复制补充图片失败: {}", e);
                continue;
            }
            signatures.push(caption_signature(&candidate.caption));
            figures.push(ExtractedFigure {
                path: output,
                caption: candidate.caption,
                relevance: candidate.relevance,
            });
            added += 1;
        }

        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            warn!("清理临时目录失败: {}", e);
        }
        added
    }
}

/// 由全文和元数据组装论文，外部元数据优先
pub fn build_paper(key: &str, pdf_path: &Path, text: &str, info: &PdfInfo, metadata: &PaperMetadata) -> Paper {
    let stem = pdf_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| key.to_string());
    let local = pdf_path.to_string_lossy().to_string();

    let title = metadata
        .title
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| info.title.clone())
        .unwrap_or(stem);
    let authors = if metadata.authors.is_empty() {
        info.authors.clone()
    } else {
        metadata.authors.clone()
    };
    let abstract_text = metadata
        .abstract_text
        .clone()
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| pdf_parser::extract_abstract(text));

    Paper {
        id: key.to_string(),
        title,
        authors,
        affiliations: if metadata.affiliations.is_empty() {
            affiliations::extract_affiliations(text)
        } else {
            metadata.affiliations.clone()
        },
        abstract_text,
        published_date: metadata.published_date.clone(),
        arxiv_id: metadata.arxiv_id.clone(),
        pdf_url: metadata.pdf_url.clone().or_else(|| Some(local.clone())),
        url: metadata.url.clone().or(Some(local)),
        sections: pdf_parser::split_sections(text),
        images: Vec::new(),
    }
}

/// 位置从 1 连续编号，url 使用相对论文目录的路径
pub fn image_infos(figures: &[ExtractedFigure], paper_dir: &Path) -> Vec<ImageInfo> {
    figures
        .iter()
        .enumerate()
        .map(|(i, figure)| {
            let relative = figure.path.strip_prefix(paper_dir).unwrap_or(&figure.path);
            ImageInfo {
                url: relative.to_string_lossy().replace('\\', "/"),
                caption: figure.caption.clone(),
                position: i + 1,
                relevance_score: figure.relevance,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::page_layout::tests::build_pdf;
    use crate::parser::source_bundle::tests::tar_gz;
    use tempfile::TempDir;

    const TEX: &str = r"\documentclass{article}
\begin{document}
\begin{figure}
  \includegraphics{arch.png}
  \caption{Overview of the serving architecture.}
\end{figure}
\begin{figure}
  \begin{tikzpicture}\end{tikzpicture}
  \caption{Latency under load.}
\end{figure}
\end{document}
";

    fn write_pdf(dir: &Path) -> PathBuf {
        let mut doc = build_pdf(&[(
            vec![(100.0, 500.0, 300.0, 200.0), (100.0, 150.0, 300.0, 200.0)],
            vec![
                (100.0, 480.0, "Figure 1: Overview of the serving architecture."),
                (100.0, 130.0, "Figure 2: Latency under load."),
            ],
        )]);
        let pdf = dir.join("paper.pdf");
        doc.save(&pdf).unwrap();
        pdf
    }

    fn write_bundle(dir: &Path) -> PathBuf {
        let arch = vec![7u8; 16 * 1024];
        let bundle = dir.join("bundle.bin");
        std::fs::write(&bundle, tar_gz(&[("main.tex", TEX.as_bytes()), ("arch.png", arch.as_slice())])).unwrap();
        bundle
    }

    fn pipeline() -> ExtractionPipeline {
        ExtractionPipeline::new(&ExtractionConfig::default())
    }

    #[test]
    fn test_source_policy_parse_and_decide() {
        assert_eq!(SourcePolicy::parse("NEVER"), SourcePolicy::Never);
        assert_eq!(SourcePolicy::parse("yes"), SourcePolicy::Always);
        assert_eq!(SourcePolicy::parse("whatever"), SourcePolicy::Auto);

        let config = ExtractionConfig::default();
        let small = PdfInfo {
            page_count: 12,
            byte_len: 2_000_000,
            ..PdfInfo::default()
        };
        assert!(SourcePolicy::Auto.decide(&small, &config).is_ok());

        let large = PdfInfo {
            page_count: 80,
            byte_len: 40_000_000,
            ..PdfInfo::default()
        };
        assert_eq!(
            SourcePolicy::Auto.decide(&large, &config),
            Err("auto-skip source (size 40.0MB >= 31MB, pages 80 >= 50)".to_string())
        );
        assert!(SourcePolicy::Always.decide(&large, &config).is_ok());
        assert!(SourcePolicy::Never.decide(&small, &config).is_err());
    }

    #[test]
    fn test_backend_serializes_as_label() {
        assert_eq!(
            serde_json::to_string(&ImageBackend::TexSourceWithPdfSupplement).unwrap(),
            "\"tex-source+pdf-supplement\""
        );
        assert_eq!(ImageBackend::PdfLayout.to_string(), "pdf-layout");
    }

    #[test]
    fn test_paper_json_uses_abstract_key() {
        let paper = Paper {
            abstract_text: "Short.".to_string(),
            ..Paper::default()
        };
        let value = serde_json::to_value(&paper).unwrap();
        assert_eq!(value["abstract"], "Short.");
        let back: Paper = serde_json::from_str(r#"{"title": "Only title"}"#).unwrap();
        assert_eq!(back.title, "Only title");
        assert!(back.images.is_empty());
    }

    #[test]
    fn test_build_paper_prefers_metadata() {
        let text = "Deep Serving\nAlice Smith\nStanford University\nAbstract\nWe study serving systems.\n1 Introduction\nServing matters.";
        let info = PdfInfo {
            title: Some("pdf title".to_string()),
            authors: vec!["Pdf Author".to_string()],
            ..PdfInfo::default()
        };
        let metadata = PaperMetadata {
            title: Some("Deep Serving".to_string()),
            arxiv_id: Some("2301.00001".to_string()),
            url: Some("https://arxiv.org/abs/2301.00001".to_string()),
            ..PaperMetadata::default()
        };

        let paper = build_paper("2301.00001", Path::new("/tmp/2301.00001.pdf"), text, &info, &metadata);
        assert_eq!(paper.title, "Deep Serving");
        assert_eq!(paper.authors, vec!["Pdf Author"]);
        assert_eq!(paper.abstract_text, "We study serving systems.");
        assert_eq!(paper.affiliations, vec!["Stanford University"]);
        assert_eq!(paper.pdf_url.as_deref(), Some("/tmp/2301.00001.pdf"));
        assert_eq!(paper.url.as_deref(), Some("https://arxiv.org/abs/2301.00001"));
        assert!(!paper.sections.is_empty());

        let bare = build_paper("local", Path::new("/tmp/local.pdf"), text, &PdfInfo::default(), &PaperMetadata::default());
        assert_eq!(bare.title, "local");
    }

    #[test]
    fn test_image_infos_are_relative_and_numbered() {
        let dir = Path::new("/cache/2301.00001");
        let figures = vec![
            ExtractedFigure {
                path: dir.join("images/src_001.png"),
                caption: "a".to_string(),
                relevance: 0.98,
            },
            ExtractedFigure {
                path: dir.join("images/pdfsupp_001.png"),
                caption: "b".to_string(),
                relevance: 0.9,
            },
        ];
        let infos = image_infos(&figures, dir);
        assert_eq!(infos[0].url, "images/src_001.png");
        assert_eq!(infos[1].url, "images/pdfsupp_001.png");
        assert_eq!(infos.iter().map(|i| i.position).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_tex_source_with_pdf_supplement() {
        let tmp = TempDir::new().unwrap();
        let pdf = write_pdf(tmp.path());
        let bundle = write_bundle(tmp.path());
        let ws = PaperWorkspace::open(&tmp.path().join("cache"), "2301.00001").unwrap();

        let outcome = pipeline().extract_figures(&pdf, &ws, SourceInput::Bundle(bundle)).unwrap();
        assert_eq!(outcome.backend, ImageBackend::TexSourceWithPdfSupplement);
        assert_eq!(
            outcome.status,
            "tex source images 1/2; remaining figures likely drawn in LaTeX (tikz/forest); \
             supplemented 1 figure(s) from PDF fallback"
        );
        let captions: Vec<&str> = outcome.figures.iter().map(|f| f.caption.as_str()).collect();
        assert_eq!(captions, vec!["Overview of the serving architecture.", "Figure 2: Latency under load."]);
        assert!(outcome.figures[1].path.ends_with("images/pdfsupp_001.png"));
        assert!(outcome.figures.iter().all(|f| f.path.is_file()));
        assert!(!ws.paper_dir().join("_pdfsupp").exists());
    }

    #[test]
    fn test_missing_source_falls_back_to_pdf_layout() {
        let tmp = TempDir::new().unwrap();
        let pdf = write_pdf(tmp.path());
        let ws = PaperWorkspace::open(&tmp.path().join("cache"), "local").unwrap();

        let outcome = pipeline()
            .extract_figures(&pdf, &ws, SourceInput::Bundle(tmp.path().join("missing.bin")))
            .unwrap();
        assert_eq!(outcome.backend, ImageBackend::PdfLayout);
        assert_eq!(outcome.status, "source payload unavailable; pdf layout images 2");

        let skipped = pipeline()
            .extract_figures(&pdf, &ws, SourceInput::Skipped("source policy: never".to_string()))
            .unwrap();
        assert_eq!(skipped.status, "source policy: never; pdf layout images 2");
        assert!(skipped.figures.iter().all(|f| f.path.starts_with(ws.images_dir())));
    }

    #[test]
    fn test_rerun_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let pdf = write_pdf(tmp.path());
        let bundle = write_bundle(tmp.path());
        let ws = PaperWorkspace::open(&tmp.path().join("cache"), "2301.00001").unwrap();
        let text = "Abstract\nA paper.\n1 Introduction\nBody.";

        let run = || {
            let outcome = pipeline()
                .extract_figures(&pdf, &ws, SourceInput::Bundle(bundle.clone()))
                .unwrap();
            let mut paper = build_paper(ws.key(), &pdf, text, &PdfInfo::default(), &PaperMetadata::default());
            paper.images = image_infos(&outcome.figures, ws.paper_dir());
            let path = ws.save_paper(&paper).unwrap();
            (std::fs::read(path).unwrap(), paper)
        };

        let (first, paper) = run();
        let (second, _) = run();
        assert_eq!(first, second);
        for image in &paper.images {
            assert!(ws.paper_dir().join(&image.url).is_file(), "{}", image.url);
        }
        assert_eq!(std::fs::read_dir(ws.images_dir()).unwrap().count(), paper.images.len());
    }

    #[test]
    fn test_process_twice_writes_identical_json() {
        let tmp = TempDir::new().unwrap();
        let mut doc = build_pdf(&[(
            vec![(100.0, 500.0, 300.0, 200.0)],
            vec![
                (72.0, 770.0, "Abstract"),
                (72.0, 755.0, "We study serving systems for large models."),
                (100.0, 480.0, "Figure 1: Overview of the serving architecture."),
                (72.0, 100.0, "1 Introduction"),
                (72.0, 85.0, "Serving matters."),
            ],
        )]);
        let pdf = tmp.path().join("serving.pdf");
        doc.save(&pdf).unwrap();
        let ws = PaperWorkspace::open(&tmp.path().join("cache"), "serving").unwrap();
        let pipeline = pipeline();

        let run = || {
            let report = pipeline
                .process(
                    &pdf,
                    &ws,
                    SourceInput::Skipped("local pdf has no source".to_string()),
                    &PaperMetadata::default(),
                )
                .unwrap();
            let bytes = std::fs::read(&report.parsed_path).unwrap();
            (report, bytes)
        };
        let (_, first) = run();
        let (report, second) = run();

        assert_eq!(first, second);
        assert_eq!(report.parsed_path, ws.parsed_path());
        assert_eq!(report.paper.title, "serving");
        assert_eq!(report.backend, ImageBackend::PdfLayout);
        assert_eq!(report.source_status, "local pdf has no source; pdf layout images 1");
        assert_eq!(report.images_available, report.paper.images.len());
        for image in &report.paper.images {
            assert!(ws.paper_dir().join(&image.url).is_file(), "{}", image.url);
        }
        assert_eq!(ws.load_paper().unwrap(), report.paper);
    }
}
