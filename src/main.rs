mod config;
mod crawler;
mod parser;
mod selector;
mod storage;
mod style;
mod utils;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use config::{AppConfig, StyleKeywordConfig, SETTINGS_PATH, STYLES_PATH};
use crawler::{ArxivCrawler, PaperInput};
use parser::{ExtractionPipeline, Paper, PaperMetadata, SourceInput};
use storage::{list_keys, normalize_key, PaperWorkspace};
use utils::logger;

#[derive(Parser)]
#[command(name = "paper2wechat")]
#[command(about = "论文解析与插图提取：为公众号文章准备素材", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 生成默认配置
    Init,
    /// 解析论文（arXiv 链接/编号或本地 PDF）
    Parse {
        input: String,
        /// 源码策略: auto / always / never
        #[arg(long)]
        source_policy: Option<String>,
        /// 输出完整 JSON 报告
        #[arg(long)]
        json: bool,
    },
    /// 推荐文章风格
    Style {
        /// 缓存中的论文编号、文件路径或直接的文本
        input: String,
        /// 用户意图，例如“偏应用落地”
        #[arg(long, default_value = "")]
        intent: String,
        #[arg(long)]
        json: bool,
    },
    /// 按正文内容挑选插图
    Select {
        /// 缓存中的论文编号或解析结果 JSON
        paper: String,
        /// 正文文件路径或直接的文本
        #[arg(short, long)]
        content: String,
        #[arg(short, long)]
        max: Option<usize>,
        /// 把选中的图片压缩后导出到该目录
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// 清理缓存，不指定论文时全部清理
    Clean { paper: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logger();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => init_command()?,
        Commands::Parse {
            input,
            source_policy,
            json,
        } => parse_command(&input, source_policy, json).await?,
        Commands::Style { input, intent, json } => style_command(&input, &intent, json)?,
        Commands::Select {
            paper,
            content,
            max,
            export,
        } => select_command(&paper, &content, max, export.as_deref())?,
        Commands::Clean { paper } => clean_command(paper.as_deref())?,
    }

    Ok(())
}

fn init_command() -> Result<()> {
    info!("初始化配置...");
    std::fs::create_dir_all("config")?;

    let app_config = AppConfig::default();
    if Path::new(SETTINGS_PATH).exists() {
        info!("配置文件已存在，跳过: {}", SETTINGS_PATH);
    } else {
        app_config.save(SETTINGS_PATH)?;
        info!("已生成配置文件: {}", SETTINGS_PATH);
    }

    if Path::new(STYLES_PATH).exists() {
        info!("风格关键词表已存在，跳过: {}", STYLES_PATH);
    } else {
        let styles = toml::to_string_pretty(&StyleKeywordConfig::default())?;
        std::fs::write(STYLES_PATH, styles)?;
        info!("已生成风格关键词表: {}", STYLES_PATH);
    }

    std::fs::create_dir_all(app_config.cache_root())?;
    info!("初始化完成，缓存目录: {}", app_config.cache_root().display());
    Ok(())
}

async fn parse_command(raw: &str, source_policy: Option<String>, json: bool) -> Result<()> {
    let mut app_config = AppConfig::load()?;
    if let Some(policy) = source_policy {
        app_config.extraction.source_policy = policy;
    }

    let input = PaperInput::parse(raw)?;
    let workspace = PaperWorkspace::open(&app_config.cache_root(), &input.cache_key())?;
    let pipeline = ExtractionPipeline::new(&app_config.extraction);
    info!("论文编号: {}", workspace.key());

    let (pdf_path, metadata, source) = match &input {
        PaperInput::LocalPdf(path) => (
            path.clone(),
            PaperMetadata::default(),
            SourceInput::Skipped("local pdf has no source".to_string()),
        ),
        PaperInput::Arxiv(id) => {
            let crawler = ArxivCrawler::new(&app_config.fetcher)?;

            let metadata = match crawler.fetch_metadata(id).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("获取元数据失败，仅使用PDF解析: {}", e);
                    PaperMetadata {
                        arxiv_id: Some(id.clone()),
                        url: Some(format!("https://arxiv.org/abs/{}", id)),
                        ..PaperMetadata::default()
                    }
                }
            };

            let pdf_url = metadata
                .pdf_url
                .clone()
                .unwrap_or_else(|| format!("https://arxiv.org/pdf/{}.pdf", id));
            let pdf_path = crawler
                .download_pdf(&pdf_url, &workspace.pdf_path())
                .await
                .with_context(|| format!("PDF下载失败: {}", pdf_url))?;

            let source = match pipeline.plan_source(&pdf_path) {
                Err(reason) => SourceInput::Skipped(reason),
                Ok(()) => match crawler.download_source(id, &workspace.source_bundle_path()).await {
                    Some(bundle) => SourceInput::Bundle(bundle),
                    None => SourceInput::Skipped("source payload unavailable".to_string()),
                },
            };
            (pdf_path, metadata, source)
        }
    };

    let report = pipeline.process(&pdf_path, &workspace, source, &metadata)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("title: {}", report.paper.title);
        println!("authors: {}", report.paper.authors.join(", "));
        println!("sections: {}", report.paper.sections.len());
        println!("image_backend: {}", report.backend);
        println!("source_status: {}", report.source_status);
        println!("images_available: {}", report.images_available);
        println!("parsed: {}", report.parsed_path.display());
    }
    Ok(())
}

fn style_command(input: &str, intent: &str, json: bool) -> Result<()> {
    let app_config = AppConfig::load()?;
    let keywords = StyleKeywordConfig::load(Path::new(STYLES_PATH))?;

    let style_text = match cached_paper(&app_config.cache_root(), input)? {
        Some(paper) => style::StyleText {
            text: style::input::paper_style_text(&paper),
            source_kind: "parsed_json",
        },
        None => style::load_style_text(input),
    };
    if style_text.text.is_empty() {
        bail!("风格推荐的输入为空");
    }

    let result = style::recommend_style(&style_text.text, intent, &keywords);
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", style::format_plain(&result, style_text.source_kind));
    }
    Ok(())
}

fn select_command(paper_ref: &str, content: &str, max: Option<usize>, export: Option<&Path>) -> Result<()> {
    let app_config = AppConfig::load()?;

    let (paper, paper_dir) = if Path::new(paper_ref).is_file() {
        let raw = std::fs::read_to_string(paper_ref)?;
        let paper: Paper = serde_json::from_str(&raw).with_context(|| format!("无法解析: {}", paper_ref))?;
        // parsed/<id>.json 的上两级是论文目录
        let paper_dir = Path::new(paper_ref)
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        (paper, paper_dir)
    } else {
        match cached_paper(&app_config.cache_root(), paper_ref)? {
            Some(paper) => (paper, app_config.cache_root().join(normalize_key(paper_ref))),
            None => bail!("缓存中没有该论文，请先运行 parse: {}", paper_ref),
        }
    };

    let content = if Path::new(content).is_file() {
        std::fs::read_to_string(content)?
    } else {
        content.to_string()
    };

    let max = max.unwrap_or(app_config.selector.max_images);
    let selected = selector::select_images(&paper.images, &content, max);
    info!("从 {} 张图片中选出 {} 张", paper.images.len(), selected.len());

    if let Some(dir) = export {
        let exported = selector::export_images(&selected, &paper_dir, dir, app_config.selector.max_width);
        info!("已导出 {}/{} 张图片到 {}", exported.len(), selected.len(), dir.display());
    }

    println!("{}", serde_json::to_string_pretty(&selected)?);
    Ok(())
}

fn clean_command(paper: Option<&str>) -> Result<()> {
    let app_config = AppConfig::load()?;
    let cache_root = app_config.cache_root();

    let keys = match paper {
        Some(key) => vec![normalize_key(key)],
        None => list_keys(&cache_root)?,
    };

    let mut removed = 0;
    for key in keys {
        if !cache_root.join(&key).is_dir() {
            info!("缓存不存在，跳过: {}", key);
            continue;
        }
        match PaperWorkspace::open(&cache_root, &key).and_then(PaperWorkspace::remove) {
            Ok(()) => removed += 1,
            Err(e) => warn!("删除失败 {}: {}", key, e),
        }
    }

    info!("清理完成，共删除 {} 篇论文的缓存", removed);
    Ok(())
}

/// 按论文编号读取缓存的解析结果；目录不存在时返回 None
fn cached_paper(cache_root: &Path, paper_ref: &str) -> Result<Option<Paper>> {
    let key = normalize_key(paper_ref);
    if !cache_root.join(&key).join("parsed").join(format!("{}.json", key)).is_file() {
        return Ok(None);
    }
    let workspace = PaperWorkspace::open(cache_root, &key)?;
    Ok(Some(workspace.load_paper()?))
}
