// 分析结果信封：优先结构化抽取，失败后按中文小节启发式解析。
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::error;

pub const RISK_LOW: &str = "低风险";
pub const RISK_MEDIUM: &str = "中等风险";
pub const RISK_HIGH: &str = "高风险";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEnvelope {
    pub summary: String,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub risk_level: Option<String>,
    pub confidence: Option<f64>,
    pub raw: String,
}

impl AnalysisEnvelope {
    pub fn empty(raw: &str) -> Self {
        Self {
            summary: String::new(),
            insights: Vec::new(),
            recommendations: Vec::new(),
            risk_level: None,
            confidence: None,
            raw: raw.to_string(),
        }
    }
}

fn fenced_json_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        match Regex::new(r"(?is)```json[ \t]*\r?\n(?P<body>.*?)```") {
            Ok(regex) => Some(regex),
            Err(err) => {
                error!("invalid envelope fenced block regex: {err}");
                None
            }
        }
    })
    .as_ref()
}

fn confidence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        match Regex::new(r"置信度[：:]?\s*([0-9]+(?:\.[0-9]+)?)(%?)") {
            Ok(regex) => Some(regex),
            Err(err) => {
                error!("invalid envelope confidence regex: {err}");
                None
            }
        }
    })
    .as_ref()
}

/// 把模型最终回复解析成结构化信封。未能抽取的字段置空。
pub fn parse_envelope(text: &str) -> AnalysisEnvelope {
    if let Some(envelope) = parse_fenced_json(text) {
        return envelope;
    }
    parse_sections(text)
}

fn parse_fenced_json(text: &str) -> Option<AnalysisEnvelope> {
    let regex = fenced_json_regex()?;
    for captures in regex.captures_iter(text) {
        let body = captures.name("body")?.as_str();
        let Ok(value) = serde_json::from_str::<Value>(body) else {
            continue;
        };
        let Value::Object(map) = &value else {
            continue;
        };
        let known = ["summary", "insights", "recommendations", "risk_level", "confidence"];
        if !known.iter().any(|key| map.contains_key(*key)) {
            continue;
        }
        let mut envelope = AnalysisEnvelope::empty(text);
        envelope.summary = map
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        envelope.insights = string_list(map.get("insights"));
        envelope.recommendations = string_list(map.get("recommendations"));
        envelope.risk_level = map
            .get("risk_level")
            .and_then(Value::as_str)
            .and_then(normalize_risk_level);
        envelope.confidence = map
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|value| value.clamp(0.0, 1.0));
        return Some(envelope);
    }
    None
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Some(Value::String(text)) if !text.trim().is_empty() => vec![text.trim().to_string()],
        _ => Vec::new(),
    }
}

/// 启发式小节扫描，关键词对齐中文分析报告的常见结构。
fn parse_sections(text: &str) -> AnalysisEnvelope {
    let mut envelope = AnalysisEnvelope::empty(text);
    let mut current: Option<&str> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if ["分析", "洞察", "发现"].iter().any(|kw| line.contains(kw)) {
            current = Some("insights");
        } else if ["建议", "推荐", "策略"].iter().any(|kw| line.contains(kw)) {
            current = Some("recommendations");
        }
        if line.contains(RISK_HIGH) {
            envelope.risk_level = Some(RISK_HIGH.to_string());
        } else if line.contains(RISK_LOW) {
            envelope.risk_level = Some(RISK_LOW.to_string());
        } else if line.contains(RISK_MEDIUM) || line.contains("风险等级") {
            envelope.risk_level = Some(RISK_MEDIUM.to_string());
        }
        if envelope.confidence.is_none() {
            envelope.confidence = extract_confidence(line);
        }
        if let Some(bullet) = strip_bullet(line) {
            match current {
                Some("insights") => envelope.insights.push(bullet),
                Some("recommendations") => envelope.recommendations.push(bullet),
                _ => {}
            }
        }
    }

    envelope.summary = truncate_chars(text.trim(), 300);
    if envelope.insights.is_empty() && envelope.recommendations.is_empty() {
        // 整体无结构时退化为单条洞察
        let head = truncate_chars(text.trim(), 200);
        if !head.is_empty() {
            envelope.insights.push(head);
        }
    }
    envelope
}

fn strip_bullet(line: &str) -> Option<String> {
    let stripped = line
        .trim_start_matches(['•', '-', '*', '·'])
        .trim_start_matches(|ch: char| ch.is_ascii_digit())
        .trim_start_matches(['.', '、', ')', '）'])
        .trim();
    if stripped == line || stripped.is_empty() {
        return None;
    }
    Some(stripped.to_string())
}

fn extract_confidence(line: &str) -> Option<f64> {
    let captures = confidence_regex()?.captures(line)?;
    let number = captures.get(1)?.as_str().parse::<f64>().ok()?;
    let is_percent = captures
        .get(2)
        .map(|m| m.as_str() == "%")
        .unwrap_or(false);
    let value = if is_percent || number > 1.0 {
        number / 100.0
    } else {
        number
    };
    Some(value.clamp(0.0, 1.0))
}

pub fn normalize_risk_level(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed == RISK_LOW || trimmed == RISK_MEDIUM || trimmed == RISK_HIGH {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut output: String = text.chars().take(limit).collect();
    output.push_str("...");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_json_envelope() {
        let text = r#"结论如下：
```json
{
  "summary": "贵州茅台走势稳健",
  "insights": ["股价累计上涨 8.2%", "成交量温和放大"],
  "recommendations": ["可继续持有"],
  "risk_level": "中等风险",
  "confidence": 0.85
}
```
以上供参考。"#;
        let envelope = parse_envelope(text);
        assert_eq!(envelope.summary, "贵州茅台走势稳健");
        assert_eq!(envelope.insights.len(), 2);
        assert_eq!(envelope.recommendations, vec!["可继续持有"]);
        assert_eq!(envelope.risk_level.as_deref(), Some(RISK_MEDIUM));
        assert_eq!(envelope.confidence, Some(0.85));
        assert_eq!(envelope.raw, text);
    }

    #[test]
    fn test_fenced_json_clamps_confidence_and_checks_risk() {
        let text = "```json\n{\"summary\": \"x\", \"confidence\": 1.7, \"risk_level\": \"超高风险\"}\n```";
        let envelope = parse_envelope(text);
        assert_eq!(envelope.confidence, Some(1.0));
        assert_eq!(envelope.risk_level, None);
    }

    #[test]
    fn test_heuristic_section_extraction() {
        let text = "分析发现：\n- 股价呈上涨趋势\n- 波动率偏高\n投资建议：\n- 分批建仓\n风险等级：高风险\n置信度：0.7";
        let envelope = parse_envelope(text);
        assert_eq!(envelope.insights, vec!["股价呈上涨趋势", "波动率偏高"]);
        assert_eq!(envelope.recommendations, vec!["分批建仓"]);
        assert_eq!(envelope.risk_level.as_deref(), Some(RISK_HIGH));
        assert_eq!(envelope.confidence, Some(0.7));
    }

    #[test]
    fn test_heuristic_percent_confidence() {
        let text = "分析：\n- 动能减弱\n置信度: 85%";
        let envelope = parse_envelope(text);
        assert_eq!(envelope.confidence, Some(0.85));
    }

    #[test]
    fn test_unstructured_text_becomes_summary_and_single_insight() {
        let text = "市场整体处于震荡阶段，短期方向不明。";
        let envelope = parse_envelope(text);
        assert_eq!(envelope.summary, text);
        assert_eq!(envelope.insights.len(), 1);
        assert!(envelope.recommendations.is_empty());
        assert_eq!(envelope.risk_level, None);
        assert_eq!(envelope.confidence, None);
    }
}
