pub mod input;

pub use input::{load_style_text, StyleText};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::StyleKeywordConfig;
use crate::utils::round3;

/// 置信度不低于该值才算 high
pub const HIGH_CONFIDENCE: f64 = 0.78;
/// 置信度不低于该值才算 medium
pub const MEDIUM_CONFIDENCE: f64 = 0.64;
/// top1 与 top2 的相对差距不超过该比例时给出混合风格提示
pub const HYBRID_CLOSE_RATIO: f64 = 0.20;

const KEYWORD_HIT_CAP: usize = 4;
const INTENT_HIT_CAP: usize = 3;
const NO_SIGNAL: &str = "no strong style signals found";

static CJK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x{4e00}-\x{9fff}]").expect("invalid CJK regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StyleCategory {
    #[serde(rename = "academic-science", alias = "science")]
    Science,
    #[serde(rename = "academic-tech", alias = "tech")]
    Tech,
    #[serde(rename = "academic-trend", alias = "trend")]
    Trend,
    #[serde(rename = "academic-applied", alias = "applied")]
    Applied,
}

impl StyleCategory {
    pub const ALL: [StyleCategory; 4] = [
        StyleCategory::Science,
        StyleCategory::Tech,
        StyleCategory::Trend,
        StyleCategory::Applied,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StyleCategory::Science => "academic-science",
            StyleCategory::Tech => "academic-tech",
            StyleCategory::Trend => "academic-trend",
            StyleCategory::Applied => "academic-applied",
        }
    }

    pub fn axis(&self) -> &'static str {
        match self {
            StyleCategory::Science => "rigor",
            StyleCategory::Tech => "engineering",
            StyleCategory::Trend => "trend",
            StyleCategory::Applied => "applied",
        }
    }

    /// 分数相同时的优先级，数值越小越优先
    fn priority(&self) -> usize {
        match self {
            StyleCategory::Tech => 0,
            StyleCategory::Applied => 1,
            StyleCategory::Science => 2,
            StyleCategory::Trend => 3,
        }
    }
}

impl fmt::Display for StyleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= HIGH_CONFIDENCE {
            ConfidenceBand::High
        } else if confidence >= MEDIUM_CONFIDENCE {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    pub fn decision_hint(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "prefer_top_candidate",
            ConfidenceBand::Medium => "agent_decide_with_top2",
            ConfidenceBand::Low => "agent_decide_freely",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "high",
            ConfidenceBand::Medium => "medium",
            ConfidenceBand::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleCandidate {
    pub style: StyleCategory,
    pub score: f64,
    pub reason_signals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleRecommendation {
    pub recommended_style: StyleCategory,
    pub confidence: f64,
    pub confidence_band: ConfidenceBand,
    pub reason_signals: Vec<String>,
    pub top_candidates: Vec<StyleCandidate>,
    pub hybrid_style_hint: Option<String>,
    pub style_axes: BTreeMap<String, f64>,
    pub decision_hint: String,
    /// 按排名顺序的 (风格, 分数)
    pub score_board: Vec<(StyleCategory, f64)>,
}

struct CategoryScore {
    category: StyleCategory,
    score: f64,
    reasons: Vec<String>,
}

/// 根据关键词密度推荐文章风格。纯函数：相同输入总是得到相同结果。
pub fn recommend_style(text: &str, intent_hint: &str, keywords: &StyleKeywordConfig) -> StyleRecommendation {
    let mut ranked = score_categories(text, intent_hint, keywords);
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.category.priority().cmp(&b.category.priority()))
    });

    let top = &ranked[0];
    let second_score = ranked.get(1).map(|c| c.score).unwrap_or(0.0);

    let margin = top.score - second_score;
    let denominator = (top.score + second_score).max(1e-6);
    let confidence = round3((0.52 + 0.36 * (margin / denominator)).clamp(0.5, 0.95));
    let band = ConfidenceBand::from_confidence(confidence);

    let reasons_or_default = |reasons: &[String], limit: usize| -> Vec<String> {
        if reasons.is_empty() {
            vec![NO_SIGNAL.to_string()]
        } else {
            reasons.iter().take(limit).cloned().collect()
        }
    };

    let top_candidates = ranked
        .iter()
        .take(2)
        .map(|c| StyleCandidate {
            style: c.category,
            score: round3(c.score),
            reason_signals: reasons_or_default(&c.reasons, 4),
        })
        .collect();

    let hybrid_style_hint = if ranked.len() > 1 && margin / top.score.max(1e-6) <= HYBRID_CLOSE_RATIO {
        Some(format!("{} + {}", ranked[0].category, ranked[1].category))
    } else {
        None
    };

    StyleRecommendation {
        recommended_style: top.category,
        confidence,
        confidence_band: band,
        reason_signals: reasons_or_default(&top.reasons, 6),
        top_candidates,
        hybrid_style_hint,
        style_axes: style_axes(&ranked),
        decision_hint: band.decision_hint().to_string(),
        score_board: ranked.iter().map(|c| (c.category, round3(c.score))).collect(),
    }
}

fn score_categories(text: &str, intent_hint: &str, keywords: &StyleKeywordConfig) -> Vec<CategoryScore> {
    let lower = text.to_lowercase();
    let hint = intent_hint.trim().to_lowercase();

    StyleCategory::ALL
        .iter()
        .map(|&category| {
            let mut score = 0.0;
            let mut reasons = Vec::new();

            if let Some(table) = keywords.category(category) {
                score = table.prior;
                for entry in &table.keywords {
                    let hits = count_token(&lower, &entry.token.to_lowercase());
                    if hits == 0 {
                        continue;
                    }
                    score += hits.min(KEYWORD_HIT_CAP) as f64 * entry.weight;
                    reasons.push(format!("{} x{}", entry.token, hits));
                }

                if !hint.is_empty() {
                    for entry in &table.intent_hints {
                        let hits = count_token(&hint, &entry.token.to_lowercase());
                        if hits == 0 {
                            continue;
                        }
                        score += hits.min(INTENT_HIT_CAP) as f64 * entry.weight;
                        reasons.push(format!("intent:{}", entry.token));
                    }
                }
            }

            CategoryScore { category, score, reasons }
        })
        .collect()
}

/// 中文和多词短语按子串计数，英文单词按词边界计数
fn count_token(text: &str, token: &str) -> usize {
    if token.is_empty() {
        return 0;
    }
    if CJK_RE.is_match(token) || token.contains(' ') {
        return text.matches(token).count();
    }
    match Regex::new(&format!(r"\b{}\b", regex::escape(token))) {
        Ok(re) => re.find_iter(text).count(),
        Err(_) => text.matches(token).count(),
    }
}

fn style_axes(ranked: &[CategoryScore]) -> BTreeMap<String, f64> {
    let max_score = ranked
        .iter()
        .map(|c| c.score)
        .fold(f64::MIN, f64::max)
        .max(1e-6);

    let mut axes: BTreeMap<String, f64> = StyleCategory::ALL
        .iter()
        .map(|c| (c.axis().to_string(), 1.0))
        .collect();
    for c in ranked {
        let ratio = c.score.max(0.0) / max_score;
        let value = ((1.0 + 4.0 * ratio) * 100.0).round() / 100.0;
        axes.insert(c.category.axis().to_string(), value);
    }
    axes
}

/// 纯文本输出，供命令行直接阅读
pub fn format_plain(result: &StyleRecommendation, source_kind: &str) -> String {
    let mut lines = vec![
        format!("source: {}", source_kind),
        format!("recommended_style: {}", result.recommended_style),
        format!("confidence: {} ({})", result.confidence, result.confidence_band.as_str()),
        format!("decision_hint: {}", result.decision_hint),
    ];

    if let Some(ref hybrid) = result.hybrid_style_hint {
        lines.push(format!("hybrid_style_hint: {}", hybrid));
    }

    lines.push("top_candidates:".to_string());
    for candidate in &result.top_candidates {
        lines.push(format!("- {}: {}", candidate.style, candidate.score));
        for reason in &candidate.reason_signals {
            lines.push(format!("  - {}", reason));
        }
    }

    lines.push("style_axes (1-5):".to_string());
    for (axis, score) in &result.style_axes {
        lines.push(format!("- {}: {}", axis, score));
    }

    lines.push("score_board:".to_string());
    for (style, score) in &result.score_board {
        lines.push(format!("- {}: {}", style, score));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recommend(text: &str) -> StyleRecommendation {
        recommend_style(text, "", &StyleKeywordConfig::default())
    }

    #[test]
    fn test_empty_text_falls_back_to_priors() {
        let result = recommend("");
        // priors: tech 1.0 > applied 0.9 > science 0.8 = trend 0.8
        assert_eq!(result.recommended_style, StyleCategory::Tech);
        assert_eq!(result.reason_signals, vec![NO_SIGNAL.to_string()]);
        assert_eq!(result.confidence_band, ConfidenceBand::Low);
        assert_eq!(result.score_board[2].0, StyleCategory::Science);
        assert_eq!(result.score_board[3].0, StyleCategory::Trend);
    }

    #[test]
    fn test_scorer_is_deterministic() {
        let text = "We prove a convergence theorem and a lemma for the proposed system architecture.";
        let first = recommend(text);
        let second = recommend(text);
        assert_eq!(first, second);
    }

    #[test]
    fn test_strong_science_signal_is_high_confidence() {
        let text = "Theorem 1. Proof. Lemma 2. Proof of the theorem. The lemma yields convergence. \
                    Convergence proof follows from the theorem and lemma.";
        let result = recommend(text);
        assert_eq!(result.recommended_style, StyleCategory::Science);
        assert_eq!(result.confidence_band, ConfidenceBand::High);
        assert!(result.confidence >= HIGH_CONFIDENCE);
        assert_eq!(result.decision_hint, "prefer_top_candidate");
        assert!(result.hybrid_style_hint.is_none());
    }

    #[test]
    fn test_close_scores_are_not_high() {
        let text = "system architecture theorem proof";
        let result = recommend(text);
        assert_ne!(result.confidence_band, ConfidenceBand::High);
        assert!(result.hybrid_style_hint.is_some());
    }

    #[test]
    fn test_band_thresholds() {
        assert_eq!(ConfidenceBand::from_confidence(0.78), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::from_confidence(0.779), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::from_confidence(0.64), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::from_confidence(0.639), ConfidenceBand::Low);
    }

    #[test]
    fn test_word_boundary_matching() {
        assert_eq!(count_token("systems and a system", "system"), 1);
        assert_eq!(count_token("a foundation model and foundation models", "foundation model"), 2);
        assert_eq!(count_token("该方法落地简单，落地成本低", "落地"), 2);
    }

    #[test]
    fn test_hits_are_capped() {
        let many = "theorem ".repeat(10);
        let result = recommend(&many);
        let science = result
            .score_board
            .iter()
            .find(|(c, _)| *c == StyleCategory::Science)
            .unwrap();
        // prior 0.8 + 4 * 1.8
        assert_eq!(science.1, 8.0);
        assert!(result.reason_signals.contains(&"theorem x10".to_string()));
    }

    #[test]
    fn test_intent_hint_biases_result() {
        let result = recommend_style("", "希望偏工程实现", &StyleKeywordConfig::default());
        assert_eq!(result.recommended_style, StyleCategory::Tech);
        assert!(result.reason_signals.iter().any(|r| r == "intent:工程"));
    }

    #[test]
    fn test_axes_scale_to_top_score() {
        let result = recommend("clinical hospital production business cost");
        assert_eq!(result.recommended_style, StyleCategory::Applied);
        assert_eq!(result.style_axes["applied"], 5.0);
        assert!(result.style_axes["rigor"] < 5.0);
    }

    #[test]
    fn test_category_serializes_with_full_label() {
        let json = serde_json::to_string(&StyleCategory::Trend).unwrap();
        assert_eq!(json, "\"academic-trend\"");
        let parsed: StyleCategory = serde_json::from_str("\"applied\"").unwrap();
        assert_eq!(parsed, StyleCategory::Applied);
    }
}
