use serde::{Deserialize, Serialize};
use anyhow::Result;
use std::path::Path;

use crate::style::StyleCategory;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeightedToken {
    pub token: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryKeywords {
    pub category: StyleCategory,
    pub prior: f64,
    pub keywords: Vec<WeightedToken>,
    pub intent_hints: Vec<WeightedToken>,
}

/// 风格关键词表：每个风格一组加权关键词和意图提示词
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StyleKeywordConfig {
    pub categories: Vec<CategoryKeywords>,
}

impl StyleKeywordConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: StyleKeywordConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn category(&self, category: StyleCategory) -> Option<&CategoryKeywords> {
        self.categories.iter().find(|c| c.category == category)
    }
}

fn table(entries: &[(&str, f64)]) -> Vec<WeightedToken> {
    entries
        .iter()
        .map(|(token, weight)| WeightedToken {
            token: token.to_string(),
            weight: *weight,
        })
        .collect()
}

impl Default for StyleKeywordConfig {
    fn default() -> Self {
        Self {
            categories: vec![
                CategoryKeywords {
                    category: StyleCategory::Science,
                    prior: 0.8,
                    keywords: table(&[
                        ("theorem", 1.8),
                        ("lemma", 1.8),
                        ("proof", 1.8),
                        ("convergence", 1.4),
                        ("hypothesis", 1.2),
                        ("ablation", 1.0),
                        ("significance", 1.0),
                        ("reproducibility", 1.4),
                        ("科学", 1.6),
                        ("严谨", 1.6),
                        ("定理", 1.8),
                        ("证明", 1.8),
                        ("收敛", 1.4),
                        ("可复现", 1.4),
                    ]),
                    intent_hints: table(&[
                        ("严谨", 0.9),
                        ("理论", 0.8),
                        ("methodology", 0.8),
                        ("scientific", 0.8),
                    ]),
                },
                CategoryKeywords {
                    category: StyleCategory::Tech,
                    prior: 1.0,
                    keywords: table(&[
                        ("system", 1.2),
                        ("architecture", 1.4),
                        ("framework", 1.4),
                        ("pipeline", 1.4),
                        ("implementation", 1.4),
                        ("latency", 1.4),
                        ("throughput", 1.4),
                        ("deployment", 1.4),
                        ("inference", 1.2),
                        ("benchmark", 1.0),
                        ("工程", 1.6),
                        ("架构", 1.6),
                        ("实现", 1.6),
                        ("部署", 1.5),
                        ("性能", 1.2),
                    ]),
                    intent_hints: table(&[
                        ("工程", 0.9),
                        ("实现", 0.9),
                        ("architecture", 0.8),
                        ("engineering", 0.8),
                    ]),
                },
                CategoryKeywords {
                    category: StyleCategory::Trend,
                    prior: 0.8,
                    keywords: table(&[
                        ("foundation model", 1.8),
                        ("llm", 1.8),
                        ("multimodal", 1.6),
                        ("agent", 1.2),
                        ("emergent", 1.3),
                        ("paradigm", 1.5),
                        ("frontier", 1.4),
                        ("future", 1.2),
                        ("趋势", 1.6),
                        ("前沿", 1.6),
                        ("范式", 1.5),
                        ("未来", 1.3),
                        ("突破", 1.4),
                    ]),
                    intent_hints: table(&[
                        ("趋势", 0.9),
                        ("前沿", 0.8),
                        ("future", 0.8),
                    ]),
                },
                CategoryKeywords {
                    category: StyleCategory::Applied,
                    prior: 0.9,
                    keywords: table(&[
                        ("production", 1.5),
                        ("industry", 1.3),
                        ("business", 1.5),
                        ("clinical", 1.6),
                        ("hospital", 1.6),
                        ("finance", 1.4),
                        ("cost", 1.4),
                        ("roi", 1.6),
                        ("case study", 1.2),
                        ("应用", 1.6),
                        ("落地", 1.8),
                        ("业务", 1.6),
                        ("成本", 1.6),
                        ("临床", 1.6),
                    ]),
                    intent_hints: table(&[
                        ("落地", 0.9),
                        ("应用", 0.8),
                        ("business", 0.8),
                        ("roi", 0.8),
                    ]),
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_covers_every_category() {
        let config = StyleKeywordConfig::default();
        for category in StyleCategory::ALL {
            assert!(config.category(category).is_some(), "{:?}", category);
        }
    }

    #[test]
    fn test_toml_roundtrip_keeps_token_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("styles.toml");
        let toml_text = toml::to_string_pretty(&StyleKeywordConfig::default()).unwrap();
        std::fs::write(&path, toml_text).unwrap();

        let loaded = StyleKeywordConfig::load(&path).unwrap();
        let science = loaded.category(StyleCategory::Science).unwrap();
        assert_eq!(science.keywords[0].token, "theorem");
        assert_eq!(science.prior, 0.8);
    }
}
