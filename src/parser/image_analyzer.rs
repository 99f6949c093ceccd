use image::DynamicImage;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::io::Read as IoRead;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::utils::{PaperError, PaperResult};

/// 解码后的图片 XObject
#[derive(Debug, Clone)]
pub enum DecodedImage {
    /// DCTDecode 原始 JPEG 数据
    Jpeg(Vec<u8>),
    Pixels(DynamicImage),
}

impl DecodedImage {
    pub fn extension(&self) -> &'static str {
        match self {
            DecodedImage::Jpeg(_) => "jpg",
            DecodedImage::Pixels(_) => "png",
        }
    }

    /// 转成像素图，用于拼接多子图
    pub fn to_dynamic(&self) -> Option<DynamicImage> {
        match self {
            DecodedImage::Jpeg(data) => image::load_from_memory(data).ok(),
            DecodedImage::Pixels(img) => Some(img.clone()),
        }
    }

    /// 写到 stem.<ext>，返回实际路径
    pub fn save(&self, stem: &Path) -> PaperResult<PathBuf> {
        let path = stem.with_extension(self.extension());
        match self {
            DecodedImage::Jpeg(data) => std::fs::write(&path, data)?,
            DecodedImage::Pixels(img) => img
                .save(&path)
                .map_err(|e| PaperError::PdfError(format!("保存PNG失败 {}: {}", path.display(), e)))?,
        }
        Ok(path)
    }
}

pub struct ImageAnalyzer;

impl ImageAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// 解码一个图片 XObject，失败或过小时返回 None
    pub fn decode(&self, doc: &Document, obj_id: ObjectId) -> Option<DecodedImage> {
        let stream = doc.get_object(obj_id).ok()?.as_stream().ok()?;

        let width = dimension(&stream.dict, b"Width");
        let height = dimension(&stream.dict, b"Height");

        // 跳过图标、项目符号之类的小图
        if width < 10 || height < 10 {
            debug!("跳过小图片: {}x{} (obj {:?})", width, height, obj_id);
            return None;
        }

        let filter_name = self.get_filter_name(&stream.dict);
        let bits = stream
            .dict
            .get(b"BitsPerComponent")
            .ok()
            .and_then(|b| b.as_i64().ok())
            .unwrap_or(8) as u32;

        match filter_name.as_deref() {
            Some("DCTDecode") => {
                let data = stream.decompressed_content().unwrap_or_else(|_| stream.content.clone());
                if data.is_empty() {
                    warn!("JPEG数据为空 (obj {:?})", obj_id);
                    return None;
                }
                Some(DecodedImage::Jpeg(data))
            }
            Some("JPXDecode") => {
                // JPEG 2000 既不能解码也不能在公众号显示
                debug!("跳过 JPEG 2000 图片 (obj {:?}, {}x{})", obj_id, width, height);
                None
            }
            Some("FlateDecode") => {
                // lopdf 解压失败时用 flate2 手动解压
                let data = match stream.decompressed_content() {
                    Ok(d) => d,
                    Err(_) => match self.manual_inflate(&stream.content) {
                        Ok(d) => d,
                        Err(e) => {
                            warn!("FlateDecode解压失败 (obj {:?}): {}", obj_id, e);
                            return None;
                        }
                    },
                };
                self.decode_pixels(doc, &stream.dict, &data, width, height, bits, obj_id)
            }
            Some(other) => {
                warn!("跳过不支持的编码: {} (obj {:?}, {}x{})", other, obj_id, width, height);
                None
            }
            None => {
                if stream.content.is_empty() {
                    return None;
                }
                self.decode_pixels(doc, &stream.dict, &stream.content, width, height, bits, obj_id)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_pixels(
        &self,
        doc: &Document,
        dict: &Dictionary,
        data: &[u8],
        width: u32,
        height: u32,
        bits: u32,
        obj_id: ObjectId,
    ) -> Option<DecodedImage> {
        // Indexed 调色板先映射成 RGB
        if let Some(rgb) = self.try_decode_indexed(dict, doc, data, width, height, bits) {
            let expected = pixel_len(width, height, 3)?;
            if rgb.len() >= expected {
                if let Some(img) = image::RgbImage::from_raw(width, height, rgb[..expected].to_vec()) {
                    return Some(DecodedImage::Pixels(DynamicImage::ImageRgb8(img)));
                }
            }
        }

        let channels = self.get_color_channels(dict, doc);
        let owned;
        let data = if bits == 1 && channels == 1 {
            owned = expand_one_bit(data, width, height)?;
            &owned[..]
        } else if bits != 8 {
            debug!("不支持的位深: {} (obj {:?})", bits, obj_id);
            return None;
        } else {
            data
        };

        let expected_size = match pixel_len(width, height, channels) {
            Some(size) => size,
            None => {
                warn!("图片尺寸溢出 (obj {:?}, {}x{}, ch={})", obj_id, width, height, channels);
                return None;
            }
        };
        if data.len() < expected_size {
            warn!(
                "图片数据不匹配: {} < {} (obj {:?}, {}x{}, ch={}, bits={})",
                data.len(),
                expected_size,
                obj_id,
                width,
                height,
                channels,
                bits
            );
            return None;
        }

        let pixels = data[..expected_size].to_vec();
        let img = match channels {
            1 => image::GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
            3 => image::RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
            4 => image::RgbaImage::from_raw(width, height, cmyk_to_rgba(&pixels)).map(DynamicImage::ImageRgba8),
            _ => {
                warn!("不支持的通道数: {} (obj {:?})", channels, obj_id);
                None
            }
        };
        if img.is_none() {
            warn!("无法创建图片 (obj {:?}, {}x{}, ch={})", obj_id, width, height, channels);
        }
        img.map(DecodedImage::Pixels)
    }

    /// PDF 插图转位图的兜底：取文件里面积最大的嵌入位图
    pub fn largest_embedded_raster(&self, pdf_path: &Path, stem: &Path) -> PaperResult<Option<PathBuf>> {
        let doc = Document::load(pdf_path)?;
        let mut ids = self.collect_all_image_ids(&doc);
        ids.sort_by_key(|(id, area)| (std::cmp::Reverse(*area), *id));

        for (id, _) in ids {
            if let Some(decoded) = self.decode(&doc, id) {
                let path = decoded.save(stem)?;
                info!("使用嵌入位图: {}", path.display());
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// 遍历文档所有对象，找出 Subtype=Image 的 Stream，附带像素面积
    fn collect_all_image_ids(&self, doc: &Document) -> Vec<(ObjectId, u64)> {
        let mut image_ids = Vec::new();
        for (&obj_id, object) in doc.objects.iter() {
            let stream = match object.as_stream() {
                Ok(s) => s,
                Err(_) => continue,
            };

            let subtype = stream
                .dict
                .get(b"Subtype")
                .ok()
                .and_then(|s| s.as_name().ok())
                .and_then(|n| std::str::from_utf8(n).ok());

            if subtype == Some("Image") {
                let w = stream.dict.get(b"Width").ok().and_then(|v| v.as_i64().ok()).unwrap_or(0);
                let h = stream.dict.get(b"Height").ok().and_then(|v| v.as_i64().ok()).unwrap_or(0);
                image_ids.push((obj_id, (w.max(0) * h.max(0)) as u64));
            }
        }
        image_ids
    }

    /// 手动使用 flate2 解压数据（lopdf 的 decompressed_content 有时会失败）
    fn manual_inflate(&self, compressed: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut decoder = flate2::read::ZlibDecoder::new(compressed);
        let mut result = Vec::new();
        if decoder.read_to_end(&mut result).is_ok() {
            return Ok(result);
        }

        // 没有 zlib 头时按 raw deflate 处理
        let mut decoder = flate2::read::DeflateDecoder::new(compressed);
        result.clear();
        decoder.read_to_end(&mut result)?;
        Ok(result)
    }

    /// 尝试解码 Indexed (调色板) 颜色空间的图片数据为 RGB
    /// Indexed 格式: [/Indexed base hival lookup_table]
    fn try_decode_indexed(
        &self,
        dict: &Dictionary,
        doc: &Document,
        data: &[u8],
        width: u32,
        height: u32,
        bits: u32,
    ) -> Option<Vec<u8>> {
        let cs_obj = dict.get(b"ColorSpace").ok()?;
        let arr = cs_obj.as_array().ok()?;

        let first_name = arr.first()?.as_name().ok()?;
        if std::str::from_utf8(first_name).ok()? != "Indexed" || bits != 8 {
            return None;
        }

        let hival = usize::try_from(arr.get(2)?.as_i64().ok()?).ok()?.min(255);
        let base_channels = arr
            .get(1)
            .and_then(|cs| cs.as_name().ok())
            .map(|name| Self::channels_from_name(std::str::from_utf8(name).unwrap_or("DeviceRGB")) as usize)
            .unwrap_or(3);

        let lookup_data: Vec<u8> = match arr.get(3)? {
            Object::String(bytes, _) => bytes.clone(),
            Object::Reference(ref_id) => match doc.get_object(*ref_id).ok()? {
                Object::String(bytes, _) => bytes.clone(),
                Object::Stream(stream) => stream.decompressed_content().unwrap_or_else(|_| stream.content.clone()),
                _ => return None,
            },
            Object::Stream(stream) => stream.decompressed_content().unwrap_or_else(|_| stream.content.clone()),
            _ => return None,
        };

        let expected_lookup_size = (hival + 1) * base_channels;
        if lookup_data.len() < expected_lookup_size || base_channels != 3 {
            debug!("Indexed lookup表无法使用: {} < {}", lookup_data.len(), expected_lookup_size);
            return None;
        }

        let pixel_count = pixel_len(width, height, 1)?;
        if data.len() < pixel_count {
            debug!("Indexed图片数据不足: {} < {}", data.len(), pixel_count);
            return None;
        }

        let mut rgb_data = Vec::with_capacity(pixel_count.checked_mul(base_channels)?);
        for &index in &data[..pixel_count] {
            let offset = (index as usize).min(hival) * base_channels;
            rgb_data.extend_from_slice(&lookup_data[offset..offset + base_channels]);
        }
        Some(rgb_data)
    }

    /// 获取 Filter 名称，处理 Name 和 Array 两种格式
    fn get_filter_name(&self, dict: &Dictionary) -> Option<String> {
        let filter_obj = dict.get(b"Filter").ok()?;

        if let Ok(name_bytes) = filter_obj.as_name() {
            return std::str::from_utf8(name_bytes).ok().map(|s| s.to_string());
        }

        // 例如 [/ASCII85Decode /DCTDecode]，以图片编码为准
        if let Ok(arr) = filter_obj.as_array() {
            for item in arr.iter().rev() {
                if let Some(name) = item.as_name().ok().and_then(|n| std::str::from_utf8(n).ok()) {
                    if matches!(name, "DCTDecode" | "JPXDecode" | "CCITTFaxDecode") {
                        return Some(name.to_string());
                    }
                }
            }
            if let Some(first) = arr.first() {
                if let Ok(name_bytes) = first.as_name() {
                    return std::str::from_utf8(name_bytes).ok().map(|s| s.to_string());
                }
            }
        }

        None
    }

    /// 获取颜色通道数
    fn get_color_channels(&self, dict: &Dictionary, doc: &Document) -> u32 {
        let cs_obj = match dict.get(b"ColorSpace") {
            Ok(obj) => obj,
            Err(_) => return 3,
        };

        if let Ok(name_bytes) = cs_obj.as_name() {
            return Self::channels_from_name(std::str::from_utf8(name_bytes).unwrap_or(""));
        }

        if let Ok(arr) = cs_obj.as_array() {
            if let Some(name) = arr.first().and_then(|f| f.as_name().ok()) {
                let name = std::str::from_utf8(name).unwrap_or("");
                return match name {
                    "ICCBased" => arr
                        .get(1)
                        .and_then(|r| r.as_reference().ok())
                        .and_then(|id| doc.get_object(id).ok())
                        .and_then(|o| o.as_stream().ok())
                        .and_then(|s| s.dict.get(b"N").ok())
                        .and_then(|n| n.as_i64().ok())
                        .map(|n| n as u32)
                        .unwrap_or(3),
                    "Indexed" | "CalRGB" | "Lab" => 3,
                    "CalGray" => 1,
                    "DeviceN" => arr
                        .get(1)
                        .and_then(|n| n.as_array().ok())
                        .map(|n| n.len() as u32)
                        .unwrap_or(3),
                    _ => Self::channels_from_name(name),
                };
            }
        }

        if let Ok(ref_id) = cs_obj.as_reference() {
            if let Ok(name_bytes) = doc.get_object(ref_id).and_then(|o| o.as_name()) {
                return Self::channels_from_name(std::str::from_utf8(name_bytes).unwrap_or(""));
            }
        }

        3
    }

    fn channels_from_name(name: &str) -> u32 {
        match name {
            "DeviceGray" | "CalGray" | "G" => 1,
            "DeviceRGB" | "CalRGB" | "RGB" => 3,
            "DeviceCMYK" | "CMYK" => 4,
            _ => 3,
        }
    }
}

impl Default for ImageAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// 1 位灰度按行展开为 8 位，每行按字节对齐
fn expand_one_bit(data: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let row_bytes = width.div_ceil(8) as usize;
    if data.len() < row_bytes.checked_mul(height as usize)? {
        return None;
    }
    let mut out = Vec::with_capacity(pixel_len(width, height, 1)?);
    for row in data.chunks(row_bytes).take(height as usize) {
        for x in 0..width as usize {
            let bit = (row[x / 8] >> (7 - (x % 8))) & 1;
            out.push(if bit == 1 { 255 } else { 0 });
        }
    }
    Some(out)
}

/// Width/Height 取值，负数和超出 u32 的按 0 处理
fn dimension(dict: &Dictionary, key: &[u8]) -> u32 {
    dict.get(key)
        .ok()
        .and_then(|v| v.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// width * height * channels，溢出时返回 None
fn pixel_len(width: u32, height: u32, channels: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(channels as usize)
}

fn cmyk_to_rgba(data: &[u8]) -> Vec<u8> {
    data.chunks(4)
        .flat_map(|p| {
            let k = 255 - p[3] as u16;
            let channel = |v: u8| ((255 - v as u16) * k / 255) as u8;
            [channel(p[0]), channel(p[1]), channel(p[2]), 255]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Stream};
    use tempfile::TempDir;

    fn add_image(doc: &mut Document, dict: Dictionary, data: Vec<u8>) -> ObjectId {
        doc.add_object(Stream::new(dict, data))
    }

    #[test]
    fn test_decode_raw_rgb() {
        let mut doc = Document::with_version("1.5");
        let id = add_image(
            &mut doc,
            dictionary! {
                "Subtype" => "Image",
                "Width" => 12,
                "Height" => 10,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![200; 12 * 10 * 3],
        );

        let decoded = ImageAnalyzer::new().decode(&doc, id).unwrap();
        assert_eq!(decoded.extension(), "png");
        let img = decoded.to_dynamic().unwrap();
        assert_eq!((img.width(), img.height()), (12, 10));
    }

    #[test]
    fn test_decode_skips_tiny_images() {
        let mut doc = Document::with_version("1.5");
        let id = add_image(
            &mut doc,
            dictionary! { "Subtype" => "Image", "Width" => 4, "Height" => 4 },
            vec![0; 48],
        );
        assert!(ImageAnalyzer::new().decode(&doc, id).is_none());
    }

    #[test]
    fn test_decode_indexed_palette() {
        let mut doc = Document::with_version("1.5");
        let palette = Object::string_literal(vec![255u8, 0, 0, 0, 0, 255]);
        let id = add_image(
            &mut doc,
            dictionary! {
                "Subtype" => "Image",
                "Width" => 10,
                "Height" => 10,
                "ColorSpace" => vec![Object::Name(b"Indexed".to_vec()), Object::Name(b"DeviceRGB".to_vec()), 1.into(), palette],
                "BitsPerComponent" => 8,
            },
            (0..100).map(|i| (i % 2) as u8).collect(),
        );

        let img = ImageAnalyzer::new().decode(&doc, id).unwrap().to_dynamic().unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [0, 0, 255]);
    }

    #[test]
    fn test_decode_rejects_oversized_and_negative_dimensions() {
        let mut doc = Document::with_version("1.5");
        let huge = add_image(
            &mut doc,
            dictionary! {
                "Subtype" => "Image",
                "Width" => 70000,
                "Height" => 70000,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![0; 64],
        );
        let negative = add_image(
            &mut doc,
            dictionary! { "Subtype" => "Image", "Width" => -20, "Height" => 40 },
            vec![0; 64],
        );
        let analyzer = ImageAnalyzer::new();
        assert!(analyzer.decode(&doc, huge).is_none());
        assert!(analyzer.decode(&doc, negative).is_none());
        assert_eq!(pixel_len(u32::MAX, u32::MAX, 4), None);
        assert_eq!(pixel_len(12, 10, 3), Some(360));
    }

    #[test]
    fn test_decode_skips_jpeg2000() {
        let mut doc = Document::with_version("1.5");
        let id = add_image(
            &mut doc,
            dictionary! { "Subtype" => "Image", "Width" => 40, "Height" => 40, "Filter" => "JPXDecode" },
            vec![1; 256],
        );
        assert!(ImageAnalyzer::new().decode(&doc, id).is_none());
    }

    #[test]
    fn test_expand_one_bit_rows_are_byte_aligned() {
        // 10 像素宽，每行 2 字节
        let data = [0b1000_0000, 0b0100_0000, 0, 0];
        let out = expand_one_bit(&data, 10, 2).unwrap();
        assert_eq!(out.len(), 20);
        assert_eq!(out[0], 255);
        assert_eq!(out[9], 255);
        assert!(out[10..].iter().all(|&p| p == 0));
    }

    #[test]
    fn test_largest_embedded_raster() {
        let tmp = TempDir::new().unwrap();
        let mut doc = Document::with_version("1.5");
        for (w, h) in [(12, 10), (40, 30)] {
            add_image(
                &mut doc,
                dictionary! {
                    "Subtype" => "Image",
                    "Width" => w,
                    "Height" => h,
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 8,
                },
                vec![90; (w * h) as usize],
            );
        }
        let pages_id = doc.add_object(dictionary! { "Type" => "Pages", "Kids" => Vec::<Object>::new(), "Count" => 0 });
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        let pdf = tmp.path().join("figure.pdf");
        doc.save(&pdf).unwrap();

        let saved = ImageAnalyzer::new()
            .largest_embedded_raster(&pdf, &tmp.path().join("out"))
            .unwrap()
            .unwrap();
        assert!(saved.ends_with("out.png"));
        let img = image::open(&saved).unwrap();
        assert_eq!((img.width(), img.height()), (40, 30));
    }
}
