use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::parser::Paper;
use crate::utils::PaperResult;

/// 论文 id 转为缓存目录名：只保留字母数字和 `._-`，其余连续字符替换为 `_`。
/// 结果为空或只有点号时使用 `paper`，保证目录一定落在缓存根目录下
pub fn normalize_key(value: &str) -> String {
    let mut key = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
            key.push(c);
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    let key = key.trim_matches('_');
    if key.chars().all(|c| c == '.') {
        return "paper".to_string();
    }
    key.to_string()
}

/// 单篇论文的缓存目录：<cache_root>/<paper_id>/{downloads,sources,parsed,images}
#[derive(Debug, Clone)]
pub struct PaperWorkspace {
    key: String,
    paper_dir: PathBuf,
}

impl PaperWorkspace {
    pub fn open(cache_root: &Path, paper_id: &str) -> PaperResult<Self> {
        let key = normalize_key(paper_id);
        let workspace = Self {
            paper_dir: cache_root.join(&key),
            key,
        };

        for dir in [
            workspace.downloads_dir(),
            workspace.sources_dir(),
            workspace.parsed_dir(),
            workspace.images_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        debug!("工作目录: {}", workspace.paper_dir.display());
        Ok(workspace)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn paper_dir(&self) -> &Path {
        &self.paper_dir
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.paper_dir.join("downloads")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.paper_dir.join("sources")
    }

    pub fn parsed_dir(&self) -> PathBuf {
        self.paper_dir.join("parsed")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.paper_dir.join("images")
    }

    pub fn pdf_path(&self) -> PathBuf {
        self.downloads_dir().join(format!("{}.pdf", self.key))
    }

    pub fn source_bundle_path(&self) -> PathBuf {
        self.downloads_dir().join(format!("{}-source.bin", self.key))
    }

    pub fn parsed_path(&self) -> PathBuf {
        self.parsed_dir().join(format!("{}.json", self.key))
    }

    /// 清空图片目录，重复提取时覆盖而不是累积
    pub fn reset_images(&self) -> PaperResult<PathBuf> {
        let dir = self.images_dir();
        reset_dir(&dir)?;
        Ok(dir)
    }

    pub fn reset_sources(&self) -> PaperResult<PathBuf> {
        let dir = self.sources_dir();
        reset_dir(&dir)?;
        Ok(dir)
    }

    /// 临时目录，提取完成后由调用方删除
    pub fn scratch_dir(&self, name: &str) -> PaperResult<PathBuf> {
        let dir = self.paper_dir.join(format!("_{}", name));
        reset_dir(&dir)?;
        Ok(dir)
    }

    /// 写入 parsed/<id>.json，先写临时文件再改名
    pub fn save_paper(&self, paper: &Paper) -> PaperResult<PathBuf> {
        let path = self.parsed_path();
        let tmp = path.with_extension("json.part");
        let mut content = serde_json::to_string_pretty(paper)?;
        content.push('\n');
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        info!("解析结果已保存: {}", path.display());
        Ok(path)
    }

    pub fn load_paper(&self) -> PaperResult<Paper> {
        let content = std::fs::read_to_string(self.parsed_path())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn remove(self) -> PaperResult<()> {
        if self.paper_dir.exists() {
            std::fs::remove_dir_all(&self.paper_dir)?;
        }
        Ok(())
    }
}

/// 列出缓存根目录下已有的论文
pub fn list_keys(cache_root: &Path) -> PaperResult<Vec<String>> {
    let mut keys = Vec::new();
    if !cache_root.exists() {
        return Ok(keys);
    }
    for entry in std::fs::read_dir(cache_root)? {
        let entry = entry?;
        if entry.path().is_dir() {
            keys.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    keys.sort();
    Ok(keys)
}

fn reset_dir(dir: &Path) -> PaperResult<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("hep-th/9901001"), "hep-th_9901001");
        assert_eq!(normalize_key("2301.00001v2"), "2301.00001v2");
        assert_eq!(normalize_key("  "), "paper");
        assert_eq!(normalize_key("My Paper (final)"), "My_Paper_final");
        assert_eq!(normalize_key("..\\evil"), ".._evil");
        assert_eq!(normalize_key("论文 一"), "论文_一");
        for dots in [".", "..", "...", "/../"] {
            assert_eq!(normalize_key(dots), "paper", "{}", dots);
        }
        assert_eq!(normalize_key("../.."), ".._..");
    }

    #[test]
    fn test_dot_keys_stay_inside_cache_root() {
        let tmp = TempDir::new().unwrap();
        let precious = tmp.path().join("precious.txt");
        std::fs::write(&precious, b"keep").unwrap();
        let cache = tmp.path().join("cache");

        for key in ["..", ".", "../..", "/"] {
            let ws = PaperWorkspace::open(&cache, key).unwrap();
            assert_eq!(ws.paper_dir().parent(), Some(cache.as_path()), "{}", key);
            ws.reset_images().unwrap();
            ws.remove().unwrap();
        }
        assert!(precious.is_file());
        assert!(cache.is_dir());
    }

    #[test]
    fn test_open_creates_layout() {
        let tmp = TempDir::new().unwrap();
        let ws = PaperWorkspace::open(tmp.path(), "cs/0101001").unwrap();
        assert_eq!(ws.key(), "cs_0101001");
        for sub in ["downloads", "sources", "parsed", "images"] {
            assert!(tmp.path().join("cs_0101001").join(sub).is_dir(), "{}", sub);
        }
        assert!(ws.parsed_path().ends_with("parsed/cs_0101001.json"));
    }

    #[test]
    fn test_reset_images_clears_previous_run() {
        let tmp = TempDir::new().unwrap();
        let ws = PaperWorkspace::open(tmp.path(), "2301.00001").unwrap();
        std::fs::write(ws.images_dir().join("stale.png"), b"old").unwrap();

        ws.reset_images().unwrap();
        assert_eq!(std::fs::read_dir(ws.images_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_save_paper_is_byte_stable() {
        let tmp = TempDir::new().unwrap();
        let ws = PaperWorkspace::open(tmp.path(), "2301.00001").unwrap();
        let paper = Paper {
            id: "2301.00001".to_string(),
            title: "Title".to_string(),
            ..Paper::default()
        };

        let path = ws.save_paper(&paper).unwrap();
        let first = std::fs::read(&path).unwrap();
        ws.save_paper(&paper).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(ws.load_paper().unwrap(), paper);
    }

    #[test]
    fn test_list_and_remove() {
        let tmp = TempDir::new().unwrap();
        PaperWorkspace::open(tmp.path(), "b").unwrap();
        let a = PaperWorkspace::open(tmp.path(), "a").unwrap();
        assert_eq!(list_keys(tmp.path()).unwrap(), vec!["a", "b"]);

        a.remove().unwrap();
        assert_eq!(list_keys(tmp.path()).unwrap(), vec!["b"]);
    }
}
