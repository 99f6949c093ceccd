pub mod keywords;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use anyhow::Result;

pub use keywords::StyleKeywordConfig;

pub const SETTINGS_PATH: &str = "config/settings.toml";
pub const STYLES_PATH: &str = "config/styles.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub fetcher: FetcherConfig,
    pub extraction: ExtractionConfig,
    pub storage: StorageConfig,
    pub selector: SelectorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// 普通请求与下载的最大尝试次数
    pub max_attempts: u32,
    /// arXiv API 经常限流，元数据只请求一次后回退到 abs 页面
    pub metadata_attempts: u32,
    pub backoff_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// auto / always / never
    pub source_policy: String,
    pub auto_skip_pdf_bytes: u64,
    pub auto_skip_pdf_pages: usize,
    pub max_source_images: usize,
    pub source_min_bytes: u64,
    pub max_fallback_figures: usize,
    /// 两个区域 IoU 超过该值视为同一张图
    pub duplicate_iou: f64,
    /// 小区域有多少比例落在大区域内时视为子图
    pub containment_ratio: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub max_images: usize,
    /// 导出图片的最大宽度（像素）
    pub max_width: u32,
}

impl AppConfig {
    /// 读取 config/settings.toml，并允许 PAPER2WECHAT__SECTION__KEY 环境变量覆盖
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(SETTINGS_PATH))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(config::Environment::with_prefix("PAPER2WECHAT").separator("__"))
            .build()?;
        let config: AppConfig = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn cache_root(&self) -> PathBuf {
        PathBuf::from(&self.storage.cache_dir)
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: "paper2wechat/1.0".to_string(),
            max_attempts: 4,
            metadata_attempts: 1,
            backoff_base_ms: 1400,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            source_policy: "auto".to_string(),
            auto_skip_pdf_bytes: 30 * 1024 * 1024,
            auto_skip_pdf_pages: 50,
            max_source_images: 12,
            source_min_bytes: 12 * 1024,
            max_fallback_figures: 8,
            duplicate_iou: 0.6,
            containment_ratio: 0.8,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: ".paper2wechat".to_string(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_images: 5,
            max_width: 1920,
        }
    }
}
