use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use super::dedupe::dedupe_figures;
use super::image_analyzer::ImageAnalyzer;
use super::source_bundle::{has_extension, list_files, unpack_bundle};
use super::ExtractedFigure;
use crate::config::ExtractionConfig;
use crate::utils::{clean_text, round3, truncate_chars};

const RASTER_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif", "tif", "tiff"];
const VECTOR_EXTENSIONS: &[&str] = &["pdf"];
/// 能被 \includegraphics 引用但无法直接转换的格式
const UNSUPPORTED_EXTENSIONS: &[&str] = &["eps", "ps", "svg"];
const CAPTION_MAX_CHARS: usize = 260;
const PDFTOPPM_MIN_BYTES: u64 = 4096;

/// 图注里常见的转义字符，`~` 是不换行空格
const TEX_ESCAPES: [(&str, &str); 6] = [
    ("\\%", "%"),
    ("\\&", "&"),
    ("\\_", "_"),
    ("\\#", "#"),
    ("\\$", "$"),
    ("~", " "),
];

static FIGURE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\\begin\{figure\*?\}(.*?)\\end\{figure\*?\}").expect("invalid figure block regex")
});
static INCLUDEGRAPHICS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\\includegraphics(?:\s*\[[^\]]*\])?\s*\{([^{}]+)\}").expect("invalid includegraphics regex")
});
static INCLUDESVG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\\includesvg(?:\s*\[[^\]]*\])?\s*\{([^{}]+)\}").expect("invalid includesvg regex")
});
static CAPTION_HEAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\\caption(?:\[[^\]]*\])?\s*\{").expect("invalid caption regex"));
static LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\label\{[^{}]*\}").expect("invalid label regex"));
static REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\(?:eq|auto)?ref\{[^{}]*\}").expect("invalid ref regex"));
static CITE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\cite\w*\{[^{}]*\}").expect("invalid cite regex"));
static UNWRAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\[a-zA-Z]+\*?(?:\[[^\]]*\])?\{([^{}]*)\}").expect("invalid unwrap regex")
});
static COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[a-zA-Z]+\*?(?:\[[^\]]*\])?").expect("invalid command regex"));

/// figure 环境里的一条插图引用
#[derive(Debug, Clone, PartialEq)]
pub struct TexFigureEntry {
    /// 引用所在 .tex 文件的目录，相对路径从这里解析
    pub tex_dir: PathBuf,
    pub include: String,
    pub caption: String,
}

/// TeX 源码提图的结果，status 说明成功或失败的原因
#[derive(Debug, Clone, Default)]
pub struct SourceExtraction {
    pub figures: Vec<ExtractedFigure>,
    pub figure_blocks: usize,
    pub status: String,
}

impl SourceExtraction {
    fn failed(status: &str, figure_blocks: usize) -> Self {
        Self {
            figures: Vec::new(),
            figure_blocks,
            status: status.to_string(),
        }
    }
}

/// 源码目录的文件索引：小写文件名、小写文件名主干 → 路径
#[derive(Debug, Default)]
pub struct SourceIndex {
    by_name: HashMap<String, Vec<PathBuf>>,
    by_stem: HashMap<String, Vec<PathBuf>>,
}

impl SourceIndex {
    pub fn build(root: &Path) -> Self {
        let mut index = Self::default();
        for path in list_files(root) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                index.by_name.entry(name.to_lowercase()).or_default().push(path.clone());
            }
            if let Some(stem) = path.file_stem().and_then(|n| n.to_str()) {
                index.by_stem.entry(stem.to_lowercase()).or_default().push(path.clone());
            }
        }
        index
    }

    /// 按文件名或主干匹配，取排名最高的图片文件
    fn best_match(&self, token: &str) -> Option<PathBuf> {
        let mut options: Vec<&PathBuf> = Vec::new();
        if let Some(paths) = self.by_name.get(token) {
            options.extend(paths);
        }
        let stem = Path::new(token)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if let Some(paths) = self.by_stem.get(&stem) {
            options.extend(paths);
        }

        let unique: BTreeSet<PathBuf> = options
            .into_iter()
            .filter(|p| is_graphic(p))
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
            .collect();
        rank_paths(unique.into_iter().collect()).into_iter().next()
    }
}

pub struct TexSourceExtractor {
    max_images: usize,
    min_bytes: u64,
    analyzer: ImageAnalyzer,
}

impl TexSourceExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            max_images: config.max_source_images,
            min_bytes: config.source_min_bytes,
            analyzer: ImageAnalyzer::new(),
        }
    }

    /// 从源码包中提取插图，输出 out_dir/src_NNN.ext
    pub fn extract(&self, bundle: &Path, source_dir: &Path, out_dir: &Path) -> SourceExtraction {
        let available = std::fs::metadata(bundle).map(|m| m.is_file() && m.len() > 0).unwrap_or(false);
        if !available {
            return SourceExtraction::failed("source payload unavailable", 0);
        }

        if let Err(e) = unpack_bundle(bundle, source_dir) {
            warn!("源码包解压失败: {}", e);
            return SourceExtraction::failed("source archive unpack failed", 0);
        }
        if let Err(e) = std::fs::create_dir_all(out_dir) {
            warn!("无法创建图片目录 {}: {}", out_dir.display(), e);
            return SourceExtraction::failed("source figures found but materialization failed", 0);
        }

        let (entries, figure_blocks) = parse_figure_entries(source_dir);
        info!("TeX 源码: {} 个 figure 环境, {} 条插图引用", figure_blocks, entries.len());

        let index = SourceIndex::build(source_dir);
        let mut figures: Vec<ExtractedFigure> = Vec::new();
        let mut seen_sources: HashSet<PathBuf> = HashSet::new();

        for entry in &entries {
            if figures.len() >= self.max_images {
                break;
            }
            let resolved = match resolve_include(&entry.include, &entry.tex_dir, source_dir, &index) {
                Some(path) => path,
                None => {
                    debug!("无法解析插图引用: {}", entry.include);
                    continue;
                }
            };
            let key = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
            if seen_sources.contains(&key) {
                continue;
            }
            let sequence = figures.len() + 1;
            if let Some(path) = self.materialize(&resolved, out_dir, sequence) {
                let caption = if entry.caption.is_empty() {
                    format!("Figure {}", sequence)
                } else {
                    entry.caption.clone()
                };
                figures.push(source_figure(path, caption, sequence));
                seen_sources.insert(key);
            }
        }

        if figures.is_empty() {
            for candidate in self.fallback_candidates(source_dir) {
                if figures.len() >= self.max_images {
                    break;
                }
                let key = candidate.canonicalize().unwrap_or_else(|_| candidate.clone());
                if seen_sources.contains(&key) {
                    continue;
                }
                let sequence = figures.len() + 1;
                if let Some(path) = self.materialize(&candidate, out_dir, sequence) {
                    figures.push(source_figure(path, format!("Figure {}", sequence), sequence));
                    seen_sources.insert(key);
                }
            }
        }

        if figures.is_empty() {
            let status = if !entries.is_empty() {
                "source figures found but materialization failed"
            } else if figure_blocks > 0 {
                "figure blocks found but no includegraphics assets"
            } else {
                "no figure entries found in tex source"
            };
            return SourceExtraction::failed(status, figure_blocks);
        }

        let figures = dedupe_figures(figures);
        let status = if figure_blocks > figures.len() {
            format!(
                "tex source images {}/{}; remaining figures likely drawn in LaTeX (tikz/forest)",
                figures.len(),
                figure_blocks
            )
        } else {
            format!("tex source images {}", figures.len())
        };
        info!("TeX 源码提图完成: {}", status);

        SourceExtraction {
            figures,
            figure_blocks,
            status,
        }
    }

    /// 位图直接复制，PDF 插图先试 pdftoppm，再退回到嵌入位图
    fn materialize(&self, source: &Path, out_dir: &Path, sequence: usize) -> Option<PathBuf> {
        let ext = lower_extension(source);
        if RASTER_EXTENSIONS.contains(&ext.as_str()) {
            let len = std::fs::metadata(source).map(|m| m.len()).unwrap_or(0);
            if len < self.min_bytes {
                debug!("图片过小，跳过: {} ({} bytes)", source.display(), len);
                return None;
            }
            let ext = if ext == "jpeg" { "jpg".to_string() } else { ext };
            let output = out_dir.join(format!("src_{:03}.{}", sequence, ext));
            return match std::fs::copy(source, &output) {
                Ok(_) => Some(output),
                Err(e) => {
                    warn!("复制图片失败 {}: {}", source.display(), e);
                    None
                }
            };
        }

        if VECTOR_EXTENSIONS.contains(&ext.as_str()) {
            let stem = out_dir.join(format!("src_{:03}", sequence));
            let output = stem.with_extension("png");
            if rasterize_with_pdftoppm(source, &output) {
                return Some(output);
            }
            return match self.analyzer.largest_embedded_raster(source, &stem) {
                Ok(found) => found,
                Err(e) => {
                    warn!("PDF 插图转换失败 {}: {}", source.display(), e);
                    None
                }
            };
        }

        debug!("跳过不支持的插图格式: {}", source.display());
        None
    }

    /// 没有任何 figure 能落地时，直接从源码目录挑选大图
    fn fallback_candidates(&self, root: &Path) -> Vec<PathBuf> {
        let candidates: Vec<PathBuf> = list_files(root)
            .into_iter()
            .filter(|path| {
                let ext = lower_extension(path);
                RASTER_EXTENSIONS.contains(&ext.as_str()) || VECTOR_EXTENSIONS.contains(&ext.as_str())
            })
            .filter(|path| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0) >= self.min_bytes)
            .collect();
        let mut ranked = rank_paths(candidates);
        ranked.truncate(self.max_images);
        ranked
    }
}

fn source_figure(path: PathBuf, caption: String, sequence: usize) -> ExtractedFigure {
    ExtractedFigure {
        path,
        caption,
        relevance: round3((0.98 - (sequence as f64 - 1.0) * 0.018).max(0.72)),
    }
}

/// 去掉 LaTeX 注释，保留转义的 \%
pub fn strip_comments(content: &str) -> String {
    content
        .lines()
        .map(|line| {
            let bytes = line.as_bytes();
            let cut = (0..bytes.len()).find(|&i| bytes[i] == b'%' && (i == 0 || bytes[i - 1] != b'\\'));
            match cut {
                Some(i) => &line[..i],
                None => line,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 遍历全部 .tex（浅层优先，其次按路径），返回插图引用和 figure 环境总数
pub fn parse_figure_entries(root: &Path) -> (Vec<TexFigureEntry>, usize) {
    let mut tex_files: Vec<PathBuf> = list_files(root).into_iter().filter(|p| has_extension(p, "tex")).collect();
    tex_files.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });

    let mut entries = Vec::new();
    let mut figure_blocks = 0;
    for tex_path in tex_files {
        let content = match std::fs::read(&tex_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("读取 {} 失败: {}", tex_path.display(), e);
                continue;
            }
        };
        let tex_dir = tex_path.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());

        let content = strip_comments(&content);
        let blocks = figure_blocks_of(&content);
        figure_blocks += blocks.len();
        for block in blocks {
            let includes = include_paths(block);
            if includes.is_empty() {
                continue;
            }
            let caption = extract_caption(block);
            for include in includes {
                entries.push(TexFigureEntry {
                    tex_dir: tex_dir.clone(),
                    include,
                    caption: caption.clone(),
                });
            }
        }
    }
    (entries, figure_blocks)
}

pub fn figure_blocks_of(content: &str) -> Vec<&str> {
    FIGURE_BLOCK_RE
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// \includegraphics 在前，\includesvg 在后
pub fn include_paths(block: &str) -> Vec<String> {
    [&*INCLUDEGRAPHICS_RE, &*INCLUDESVG_RE]
        .iter()
        .flat_map(|re| re.captures_iter(block))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|value| !value.is_empty())
        .collect()
}

pub fn extract_caption(block: &str) -> String {
    match CAPTION_HEAD_RE.find(block) {
        Some(head) => sanitize_caption(&braced_text(block, head.end() - 1)),
        None => String::new(),
    }
}

/// 取 open 处左花括号与其配对右花括号之间的文本
fn braced_text(text: &str, open: usize) -> String {
    if text.as_bytes().get(open) != Some(&b'{') {
        return String::new();
    }
    let mut depth = 0usize;
    let mut out = String::new();
    for ch in text[open..].chars() {
        match ch {
            '{' => {
                depth += 1;
                if depth == 1 {
                    continue;
                }
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
        out.push(ch);
    }
    out.trim().to_string()
}

pub fn sanitize_caption(caption: &str) -> String {
    let mut value = LABEL_RE.replace_all(caption, "").into_owned();
    value = REF_RE.replace_all(&value, "").into_owned();
    value = CITE_RE.replace_all(&value, "").into_owned();
    for _ in 0..3 {
        let collapsed = UNWRAP_RE.replace_all(&value, "${1}").into_owned();
        if collapsed == value {
            break;
        }
        value = collapsed;
    }
    value = COMMAND_RE.replace_all(&value, "").into_owned();
    for (escaped, plain) in TEX_ESCAPES {
        value = value.replace(escaped, plain);
    }
    let value = value.replace(['{', '}'], "");
    truncate_chars(&clean_text(&value), CAPTION_MAX_CHARS)
}

/// 解析 \includegraphics 的目标文件，结果一定位于源码目录内
pub fn resolve_include(include: &str, tex_dir: &Path, root: &Path, index: &SourceIndex) -> Option<PathBuf> {
    let token = include.trim().trim_matches(|c: char| c == '"' || c == '\'').replace('\\', "/");
    if token.is_empty() || token.starts_with("http://") || token.starts_with("https://") {
        return None;
    }
    if token.contains(['$', '{', '}']) {
        return None;
    }
    let token = token.split('#').next().unwrap_or("").trim();
    if token.is_empty() {
        return None;
    }

    let token_path = Path::new(token);
    let mut candidates = vec![tex_dir.join(token_path)];
    if token_path.extension().is_none() {
        for ext in graphic_extensions() {
            candidates.push(tex_dir.join(format!("{}.{}", token, ext)));
        }
    }
    for candidate in candidates {
        if candidate.is_file() && is_graphic(&candidate) && is_within(&candidate, root) {
            return Some(candidate);
        }
    }

    let name = token_path.file_name()?.to_str()?.to_lowercase();
    index.best_match(&name).filter(|best| is_within(best, root))
}

fn graphic_extensions() -> impl Iterator<Item = &'static str> {
    RASTER_EXTENSIONS
        .iter()
        .chain(VECTOR_EXTENSIONS.iter())
        .chain(UNSUPPORTED_EXTENSIONS.iter())
        .copied()
}

fn is_graphic(path: &Path) -> bool {
    let ext = lower_extension(path);
    graphic_extensions().any(|known| known == ext)
}

fn is_within(path: &Path, root: &Path) -> bool {
    match (path.canonicalize(), root.canonicalize()) {
        (Ok(path), Ok(root)) => path.starts_with(root),
        _ => false,
    }
}

fn lower_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

/// 大小、文件名和格式综合打分，越像正文插图分数越高
pub fn source_file_rank(path: &Path) -> f64 {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    let ext = lower_extension(path);
    let size = std::fs::metadata(path).map(|m| m.len() as f64).unwrap_or(0.0);

    let mut score = (size / (256.0 * 1024.0)).min(12.0);
    if name.contains("fig") {
        score += 3.5;
    }
    if name.contains("logo") || name.contains("icon") || name.contains("banner") {
        score -= 3.0;
    }
    if RASTER_EXTENSIONS.contains(&ext.as_str()) {
        score += 2.0;
    }
    if VECTOR_EXTENSIONS.contains(&ext.as_str()) {
        score += 1.0;
    }
    score
}

/// 分数降序，同分按路径升序
fn rank_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut scored: Vec<(f64, PathBuf)> = paths.into_iter().map(|p| (source_file_rank(&p), p)).collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, p)| p).collect()
}

fn rasterize_with_pdftoppm(source: &Path, output: &Path) -> bool {
    let prefix = output.with_extension("");
    let status = Command::new("pdftoppm")
        .args(["-png", "-singlefile", "-f", "1", "-l", "1", "-cropbox", "-r", "360"])
        .arg(source)
        .arg(&prefix)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => {
            debug!("pdftoppm 退出码 {:?}: {}", status.code(), source.display());
            return false;
        }
        Err(e) => {
            debug!("pdftoppm 不可用: {}", e);
            return false;
        }
    }

    let ok = std::fs::metadata(output).map(|m| m.len() > PDFTOPPM_MIN_BYTES).unwrap_or(false);
    if !ok {
        let _ = std::fs::remove_file(output);
    }
    ok
}
