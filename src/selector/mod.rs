use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::parser::ImageInfo;
use crate::utils::PaperResult;

const TOKEN_BONUS: f64 = 0.03;
const DEFAULT_RELEVANCE: f64 = 0.5;
const STOP_TOKENS: [&str; 3] = ["figure", "image", "page"];
const JPEG_QUALITY: u8 = 85;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z]{3,}").expect("invalid token regex"));

/// 按正文内容重新给图片打分，取前 max 张
pub fn select_images(images: &[ImageInfo], content: &str, max: usize) -> Vec<ImageInfo> {
    if images.is_empty() || max == 0 {
        return Vec::new();
    }

    let content = content.to_lowercase();
    let mut ranked: Vec<ImageInfo> = images
        .iter()
        .cloned()
        .map(|mut image| {
            if image.relevance_score <= 0.0 {
                image.relevance_score = DEFAULT_RELEVANCE;
            }
            let overlap = caption_tokens(&image.caption)
                .iter()
                .filter(|token| content.contains(token.as_str()))
                .count();
            if overlap > 0 {
                image.relevance_score = (image.relevance_score + overlap as f64 * TOKEN_BONUS).min(1.0);
            }
            debug!("{}: 命中 {} 个图注词, 得分 {}", image.url, overlap, image.relevance_score);
            image
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(Ordering::Equal)
            .then(a.position.cmp(&b.position))
    });
    ranked.truncate(max);
    ranked
}

/// 图注中的英文词（至少 3 个字母），去掉 figure/image/page，保留重复
pub fn caption_tokens(caption: &str) -> Vec<String> {
    let lower = caption.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|token| !STOP_TOKENS.contains(token))
        .map(str::to_string)
        .collect()
}

/// 压缩到公众号可用的尺寸：宽度超过 max_width 时等比缩放，
/// 按目标扩展名写 PNG 或 JPEG（质量 85）
pub fn compress_image(src: &Path, dst: &Path, max_width: u32) -> PaperResult<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut img = image::open(src)?;
    if img.width() > max_width {
        let height = (img.height() as f64 * max_width as f64 / img.width() as f64) as u32;
        img = img.resize_exact(max_width, height.max(1), FilterType::Lanczos3);
    }

    let is_png = dst
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("png"))
        .unwrap_or(false);
    if is_png {
        img.save_with_format(dst, ImageFormat::Png)?;
    } else {
        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
        let file = std::fs::File::create(dst)?;
        let mut writer = std::io::BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY).encode_image(&rgb)?;
    }
    info!("图片已压缩: {} -> {} ({}x{})", src.display(), dst.display(), img.width(), img.height());
    Ok(())
}

/// 逐张压缩导出，单张失败只记录日志，返回成功导出的路径
pub fn export_images(images: &[ImageInfo], paper_dir: &Path, out_dir: &Path, max_width: u32) -> Vec<PathBuf> {
    let mut exported = Vec::new();
    for image in images {
        let src = paper_dir.join(&image.url);
        let Some(name) = src.file_name() else {
            warn!("图片路径无效，跳过: {}", image.url);
            continue;
        };
        let dst = out_dir.join(name);
        match compress_image(&src, &dst, max_width) {
            Ok(()) => exported.push(dst),
            Err(e) => warn!("导出图片失败，跳过 {}: {}", src.display(), e),
        }
    }
    exported
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    fn image(url: &str, caption: &str, position: usize, relevance_score: f64) -> ImageInfo {
        ImageInfo {
            url: url.to_string(),
            caption: caption.to_string(),
            position,
            relevance_score,
        }
    }

    #[test]
    fn test_caption_tokens() {
        assert_eq!(
            caption_tokens("Figure 2: Attention map of the encoder, image page 3"),
            vec!["attention", "map", "the", "encoder"]
        );
    }

    #[test]
    fn test_select_images_reranks_by_content() {
        let images = vec![
            image("images/src_001.png", "Overview of the pipeline", 1, 0.9),
            image("images/src_002.png", "Attention weights heatmap", 2, 0.88),
            image("images/src_003.png", "Training loss", 3, 0.0),
        ];
        let content = "We visualize attention weights as a heatmap.";

        let selected = select_images(&images, content, 2);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].url, "images/src_002.png");
        assert!((selected[0].relevance_score - 0.97).abs() < 1e-9);
        assert_eq!(selected[1].url, "images/src_001.png");
        // 输入不被修改
        assert_eq!(images[2].relevance_score, 0.0);
    }

    #[test]
    fn test_select_images_caps_and_ties() {
        let images = vec![
            image("b.png", "loss loss loss loss", 2, 0.95),
            image("a.png", "accuracy", 1, 1.0),
            image("c.png", "", 3, -1.0),
        ];
        let selected = select_images(&images, "loss", 5);
        assert_eq!(selected.len(), 3);
        // 都封顶为 1.0 时按位置
        assert_eq!(selected[0].url, "a.png");
        assert_eq!(selected[1].url, "b.png");
        assert_eq!(selected[1].relevance_score, 1.0);
        assert_eq!(selected[2].relevance_score, 0.5);

        assert!(select_images(&images, "loss", 0).is_empty());
        assert!(select_images(&[], "loss", 3).is_empty());
    }

    #[test]
    fn test_export_skips_undecodable_images() {
        let tmp = TempDir::new().unwrap();
        let paper_dir = tmp.path().join("paper");
        std::fs::create_dir_all(paper_dir.join("images")).unwrap();
        RgbaImage::from_pixel(40, 30, Rgba([200, 0, 0, 255]))
            .save(paper_dir.join("images/src_002.png"))
            .unwrap();
        std::fs::write(paper_dir.join("images/page_001_001.jp2"), b"\x00\x00\x00\x0cjP  ").unwrap();

        let images = vec![
            image("images/page_001_001.jp2", "broken", 1, 0.9),
            image("images/src_002.png", "ok", 2, 0.8),
            image("images/missing.png", "gone", 3, 0.7),
        ];
        let out = tmp.path().join("export");
        let exported = export_images(&images, &paper_dir, &out, 1920);
        assert_eq!(exported, vec![out.join("src_002.png")]);
        assert!(out.join("src_002.png").is_file());
    }

    #[test]
    fn test_compress_image() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("wide.png");
        RgbaImage::from_pixel(400, 100, Rgba([10, 20, 30, 128])).save(&src).unwrap();

        let png = tmp.path().join("out/small.png");
        compress_image(&src, &png, 200).unwrap();
        let out = image::open(&png).unwrap();
        assert_eq!((out.width(), out.height()), (200, 50));

        let jpg = tmp.path().join("out/small.jpg");
        compress_image(&src, &jpg, 1920).unwrap();
        let out = image::open(&jpg).unwrap();
        assert_eq!((out.width(), out.height()), (400, 100));
    }
}
