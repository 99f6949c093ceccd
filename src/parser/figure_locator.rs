use image::{imageops, DynamicImage, Rgb, RgbImage};
use lopdf::Document;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::image_analyzer::ImageAnalyzer;
use super::page_layout::{analyze_page, ImagePlacement, PageLayout, Rect, TextLine};
use super::ExtractedFigure;
use crate::config::ExtractionConfig;
use crate::utils::{clean_text, round3, truncate_chars, PaperResult};

static CAPTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(figure|fig\.?)\s*\d+[\s:.\-]+").expect("invalid caption regex"));

const CAPTION_MAX_OFFSET: usize = 18;
const CAPTION_MAX_CHARS: usize = 160;
const HEADER_CUTOFF_RATIO: f64 = 0.06;
const MIN_WIDTH_RATIO: f64 = 0.20;
const MIN_HEIGHT_RATIO: f64 = 0.06;
const MIN_PIXELS: u32 = 10;
const CAPTION_X_SLACK_RATIO: f64 = 0.42;
const CAPTION_MAX_DISTANCE_RATIO: f64 = 0.35;
/// 图片与图注边缘允许的轻微重叠（pt）
const EDGE_TOLERANCE: f64 = 4.0;
const MAX_CANVAS_WIDTH: f64 = 2400.0;

/// 页面上的一条图注
#[derive(Debug, Clone)]
pub struct FigureCaption {
    pub text: String,
    pub bbox: Rect,
}

/// 一张候选图：所在页与放置的位图
#[derive(Debug, Clone)]
struct Region {
    page_index: usize,
    placement: ImagePlacement,
}

/// 基于页面版面的插图提取
pub struct FigureLocator {
    analyzer: ImageAnalyzer,
    max_fallback: usize,
    duplicate_iou: f64,
    containment_ratio: f64,
}

impl FigureLocator {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            analyzer: ImageAnalyzer::new(),
            max_fallback: config.max_fallback_figures,
            duplicate_iou: config.duplicate_iou,
            containment_ratio: config.containment_ratio,
        }
    }

    /// 提取插图写入 out_dir，文件名 page_PPP_NNN.<ext>
    pub fn extract(&self, pdf_path: &Path, out_dir: &Path) -> PaperResult<Vec<ExtractedFigure>> {
        info!("按版面提取插图: {}", pdf_path.display());
        let doc = Document::load(pdf_path)?;
        std::fs::create_dir_all(out_dir)?;

        let mut figures = Vec::new();
        let mut uncaptioned: Vec<Region> = Vec::new();
        let mut seq = 1usize;

        for (page_number, page_id) in doc.get_pages() {
            let page_index = (page_number - 1) as usize;
            let layout = match analyze_page(&doc, page_number, page_id) {
                Ok(l) => l,
                Err(e) => {
                    warn!("第 {} 页解析失败: {}", page_number, e);
                    continue;
                }
            };

            let regions = self.candidate_regions(&layout);
            if regions.is_empty() {
                continue;
            }
            let captions = find_captions(&layout.lines);

            let mut groups: BTreeMap<usize, Vec<ImagePlacement>> = BTreeMap::new();
            for region in regions {
                match associate(&region.bbox, &captions, &layout) {
                    Some(idx) => groups.entry(idx).or_default().push(region),
                    None => uncaptioned.push(Region {
                        page_index,
                        placement: region,
                    }),
                }
            }

            for (idx, panels) in groups {
                let caption = &captions[idx];
                let stem = out_dir.join(format!("page_{:03}_{:03}", page_number, seq));
                let bbox = panels
                    .iter()
                    .skip(1)
                    .fold(panels[0].bbox, |acc, p| acc.union(&p.bbox));
                match self.write_figure(&doc, &panels, &stem) {
                    Some(path) => {
                        debug!("第 {} 页图 {} 个子图: {}", page_number, panels.len(), caption.text);
                        figures.push(ExtractedFigure {
                            path,
                            caption: caption.text.clone(),
                            relevance: caption_relevance(page_index, bbox.height()),
                        });
                        seq += 1;
                    }
                    None => warn!("第 {} 页图片无法解码: {}", page_number, caption.text),
                }
            }
        }

        if figures.is_empty() && !uncaptioned.is_empty() {
            info!("未找到带图注的插图，改为保留最大的 {} 张", self.max_fallback);
            figures = self.largest_uncaptioned(&doc, uncaptioned, out_dir);
        }

        info!("版面提取完成，共 {} 张", figures.len());
        Ok(figures)
    }

    /// 过滤过小、页眉区域内以及与更大候选重叠的位图
    fn candidate_regions(&self, layout: &PageLayout) -> Vec<ImagePlacement> {
        let header_cutoff = layout.height * HEADER_CUTOFF_RATIO;
        let mut candidates: Vec<&ImagePlacement> = layout
            .images
            .iter()
            .filter(|img| img.pixel_width >= MIN_PIXELS && img.pixel_height >= MIN_PIXELS)
            .filter(|img| img.bbox.width() >= layout.width * MIN_WIDTH_RATIO)
            .filter(|img| img.bbox.height() >= layout.height * MIN_HEIGHT_RATIO)
            .filter(|img| img.bbox.y0 >= header_cutoff)
            .collect();
        candidates.sort_by(|a, b| b.bbox.area().total_cmp(&a.bbox.area()));

        let mut kept: Vec<ImagePlacement> = Vec::new();
        for candidate in candidates {
            let overlapping = kept.iter().any(|k| {
                candidate.bbox.iou(&k.bbox) >= self.duplicate_iou
                    || candidate.bbox.contained_in(&k.bbox) >= self.containment_ratio
            });
            if !overlapping {
                kept.push(candidate.clone());
            }
        }
        // 恢复阅读顺序
        kept.sort_by(|a, b| a.bbox.y0.total_cmp(&b.bbox.y0).then(a.bbox.x0.total_cmp(&b.bbox.x0)));
        kept
    }

    fn write_figure(&self, doc: &Document, panels: &[ImagePlacement], stem: &Path) -> Option<PathBuf> {
        if panels.len() == 1 {
            let decoded = self.analyzer.decode(doc, panels[0].object_id)?;
            return save_or_warn(decoded.save(stem));
        }

        let decoded: Vec<(Rect, DynamicImage)> = panels
            .iter()
            .filter_map(|p| {
                let img = self.analyzer.decode(doc, p.object_id)?.to_dynamic()?;
                Some((p.bbox, img))
            })
            .collect();
        match decoded.len() {
            0 => None,
            1 => {
                let img = DynamicImage::ImageRgb8(decoded[0].1.to_rgb8());
                save_or_warn(save_png(&img, stem))
            }
            _ => save_or_warn(save_png(&compose_panels(&decoded), stem)),
        }
    }

    fn largest_uncaptioned(&self, doc: &Document, mut pool: Vec<Region>, out_dir: &Path) -> Vec<ExtractedFigure> {
        pool.sort_by(|a, b| b.placement.bbox.area().total_cmp(&a.placement.bbox.area()));
        pool.truncate(self.max_fallback);
        pool.sort_by(|a, b| {
            a.page_index
                .cmp(&b.page_index)
                .then(a.placement.bbox.y0.total_cmp(&b.placement.bbox.y0))
        });

        let mut figures = Vec::new();
        for region in pool {
            let page_number = region.page_index + 1;
            let stem = out_dir.join(format!("page_{:03}_{:03}", page_number, figures.len() + 1));
            if let Some(path) = self.write_figure(doc, std::slice::from_ref(&region.placement), &stem) {
                figures.push(ExtractedFigure {
                    path,
                    caption: format!("Figure (page {})", page_number),
                    relevance: caption_relevance(region.page_index, region.placement.bbox.height()),
                });
            }
        }
        figures
    }
}

fn save_png(img: &DynamicImage, stem: &Path) -> PaperResult<PathBuf> {
    let path = stem.with_extension("png");
    img.save(&path)
        .map_err(|e| crate::utils::PaperError::PdfError(format!("保存PNG失败 {}: {}", path.display(), e)))?;
    Ok(path)
}

fn save_or_warn(result: PaperResult<PathBuf>) -> Option<PathBuf> {
    match result {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("写入图片失败: {}", e);
            None
        }
    }
}

/// 页面越靠前、图越高，得分越高
pub fn caption_relevance(page_index: usize, clip_height: f64) -> f64 {
    let page_bonus = (0.75 - page_index as f64 * 0.04).max(0.0);
    let height_bonus = (clip_height / 900.0).min(1.0) * 0.25;
    round3((0.35 + page_bonus + height_bonus).min(1.0))
}

/// 找出以 "Figure N" / "Fig. N" 开头的行，并接上紧随其后的续行
pub fn find_captions(lines: &[TextLine]) -> Vec<FigureCaption> {
    let mut captions = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let start = match caption_start(&line.text) {
            Some(s) => s,
            None => continue,
        };

        let mut text = line.text[start..].to_string();
        let mut bbox = line.bbox;
        let mut last = line.bbox;
        for next in &lines[idx + 1..] {
            if text.chars().count() >= CAPTION_MAX_CHARS {
                break;
            }
            let line_height = last.height().max(1.0);
            if next.bbox.y0 - last.y1 > 0.8 * line_height {
                break;
            }
            if next.bbox.y0 < last.y0 + 0.5 * line_height || !next.bbox.overlaps_x(&last, 0.0) {
                continue;
            }
            if caption_start(&next.text).is_some() {
                break;
            }
            text.push(' ');
            text.push_str(&next.text);
            bbox = bbox.union(&next.bbox);
            last = next.bbox;
        }

        captions.push(FigureCaption {
            text: truncate_chars(&clean_text(&text), CAPTION_MAX_CHARS),
            bbox,
        });
    }

    captions.sort_by(|a, b| a.bbox.y0.total_cmp(&b.bbox.y0));
    captions
}

/// 图注标记的字节起点，要求出现在行首 18 个字符以内
fn caption_start(text: &str) -> Option<usize> {
    let m = CAPTION_RE.find(text)?;
    if text[..m.start()].chars().count() > CAPTION_MAX_OFFSET {
        return None;
    }
    Some(m.start())
}

/// 为图片找最近的图注：先找下方，再找上方
fn associate(region: &Rect, captions: &[FigureCaption], layout: &PageLayout) -> Option<usize> {
    let slack = layout.width * CAPTION_X_SLACK_RATIO;
    let max_distance = layout.height * CAPTION_MAX_DISTANCE_RATIO;

    let nearest = |distance_of: &dyn Fn(&Rect) -> Option<f64>| -> Option<usize> {
        captions
            .iter()
            .enumerate()
            .filter(|(_, c)| c.bbox.overlaps_x(region, slack))
            .filter_map(|(i, c)| distance_of(&c.bbox).map(|d| (i, d)))
            .filter(|(_, d)| *d <= max_distance)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    };

    let below = |c: &Rect| (c.y0 >= region.y1 - EDGE_TOLERANCE).then(|| (c.y0 - region.y1).max(0.0));
    let above = |c: &Rect| (c.y1 <= region.y0 + EDGE_TOLERANCE).then(|| (region.y0 - c.y1).max(0.0));

    nearest(&below).or_else(|| nearest(&above))
}

/// 共用一个图注的多个子图按页面位置拼到白底画布上
fn compose_panels(panels: &[(Rect, DynamicImage)]) -> DynamicImage {
    let union = panels
        .iter()
        .skip(1)
        .fold(panels[0].0, |acc, (rect, _)| acc.union(rect));

    // 以最高分辨率的子图为准，画布宽度有上限
    let native = panels
        .iter()
        .map(|(rect, img)| img.width() as f64 / rect.width().max(1.0))
        .fold(1.0, f64::max);
    let scale = native.min(MAX_CANVAS_WIDTH / union.width().max(1.0)).max(0.1);

    let canvas_w = ((union.width() * scale).ceil() as u32).max(1);
    let canvas_h = ((union.height() * scale).ceil() as u32).max(1);
    let mut canvas = RgbImage::from_pixel(canvas_w, canvas_h, Rgb([255, 255, 255]));

    for (rect, img) in panels {
        let w = ((rect.width() * scale).round() as u32).max(1);
        let h = ((rect.height() * scale).round() as u32).max(1);
        let resized = img.resize_exact(w, h, imageops::FilterType::Triangle).to_rgb8();
        let x = ((rect.x0 - union.x0) * scale).round() as i64;
        let y = ((rect.y0 - union.y0) * scale).round() as i64;
        imageops::overlay(&mut canvas, &resized, x, y);
    }

    DynamicImage::ImageRgb8(canvas)
}
