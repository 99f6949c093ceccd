use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::utils::{PaperError, PaperResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const TAR_MAGIC_OFFSET: usize = 257;
const LATEX_SNIFF_BYTES: usize = 8192;

/// 解开 arXiv 源码包：zip、tar、tar.gz、单个 gzip 压缩的 TeX 或原始 TeX。
/// 返回目录中是否有可用的 .tex 文件
pub fn unpack_bundle(bundle: &Path, dest: &Path) -> PaperResult<bool> {
    let payload = std::fs::read(bundle)?;
    if payload.is_empty() {
        return Ok(false);
    }
    std::fs::create_dir_all(dest)?;

    unpack_bytes(&payload, dest, 0)?;
    let has_tex = list_files(dest).iter().any(|p| has_extension(p, "tex"));
    info!("源码包解压完成: {} (tex: {})", dest.display(), has_tex);
    Ok(has_tex)
}

fn unpack_bytes(payload: &[u8], dest: &Path, depth: u32) -> PaperResult<()> {
    if payload.starts_with(&ZIP_MAGIC) {
        debug!("按 ZIP 解压");
        return unpack_zip(payload, dest);
    }
    if is_tar(payload) {
        debug!("按 TAR 解压");
        return unpack_tar(payload, dest);
    }
    if payload.starts_with(&GZIP_MAGIC) && depth == 0 {
        let mut decoder = GzDecoder::new(payload);
        let mut inner = Vec::new();
        decoder
            .read_to_end(&mut inner)
            .map_err(|e| PaperError::SourceError(format!("gzip 解压失败: {}", e)))?;
        return unpack_bytes(&inner, dest, depth + 1);
    }
    if contains_latex_markers(payload) {
        debug!("源码包是单个 TeX 文件");
        std::fs::write(dest.join("main.tex"), payload)?;
        return Ok(());
    }
    Err(PaperError::SourceError("无法识别的源码包格式".to_string()))
}

fn is_tar(payload: &[u8]) -> bool {
    payload
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5)
        .map(|magic| magic == b"ustar")
        .unwrap_or(false)
}

/// 逐个解压，越界路径由 tar 的 unpack_in 拒绝
fn unpack_tar(payload: &[u8], dest: &Path) -> PaperResult<()> {
    let mut archive = Archive::new(Cursor::new(payload));
    let entries = archive
        .entries()
        .map_err(|e| PaperError::SourceError(format!("tar 读取失败: {}", e)))?;
    for entry in entries {
        let mut entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("tar 条目损坏: {}", e);
                continue;
            }
        };
        match entry.unpack_in(dest) {
            Ok(true) => {}
            Ok(false) => warn!("跳过越界路径: {:?}", entry.path().ok()),
            Err(e) => warn!("tar 条目解压失败: {}", e),
        }
    }
    Ok(())
}

fn unpack_zip(payload: &[u8], dest: &Path) -> PaperResult<()> {
    let mut zip =
        ZipArchive::new(Cursor::new(payload)).map_err(|e| PaperError::SourceError(format!("zip 读取失败: {}", e)))?;
    for i in 0..zip.len() {
        let mut file = match zip.by_index(i) {
            Ok(f) => f,
            Err(e) => {
                warn!("zip 条目损坏: {}", e);
                continue;
            }
        };
        let outpath = match file.enclosed_name() {
            Some(path) => dest.join(path),
            None => {
                warn!("跳过越界路径: {}", file.name());
                continue;
            }
        };

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = std::fs::File::create(&outpath)?;
        std::io::copy(&mut file, &mut outfile)?;
    }
    Ok(())
}

/// 源码包开头是否像 LaTeX
pub fn contains_latex_markers(payload: &[u8]) -> bool {
    let head = &payload[..payload.len().min(LATEX_SNIFF_BYTES)];
    [&b"\\documentclass"[..], b"\\begin{document}", b"\\begin{figure"]
        .iter()
        .any(|marker| head.windows(marker.len()).any(|w| w == *marker))
}

/// 下载的内容是否是 HTML 错误页
pub fn looks_like_html(payload: &[u8]) -> bool {
    let sample = &payload[..payload.len().min(512)];
    let lower = String::from_utf8_lossy(sample).trim_start().to_lowercase();
    lower.starts_with("<!doctype html") || lower.starts_with("<html")
}

/// 目录下全部文件，按路径排序
pub fn list_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .collect();
    files.sort();
    files
}

pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}
