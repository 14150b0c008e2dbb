// 规则分析器：模型不可用时的降级路径，只依赖本地规则与一次数据拉取。
use crate::analyst::envelope::{AnalysisEnvelope, RISK_HIGH, RISK_LOW, RISK_MEDIUM};
use crate::table::Table;
use crate::tools::{self, ToolContext, TOOL_FETCH_MARKET_DATA};
use chrono::{Duration, Local};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::{error, warn};

const FALLBACK_INTERFACE: &str = "stock_zh_a_hist";
const FALLBACK_WINDOW_DAYS: i64 = 180;

fn digit_run_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(r"[0-9]+") {
        Ok(regex) => Some(regex),
        Err(err) => {
            error!("invalid fallback digit run regex: {err}");
            None
        }
    })
    .as_ref()
}

/// 从用户问题里提取六位股票代码，保持出现顺序去重。
/// 只认恰好六位的独立数字串，避免把订单号之类的长数字误判成代码。
pub fn extract_stock_codes(query: &str) -> Vec<String> {
    let Some(regex) = digit_run_regex() else {
        return Vec::new();
    };
    let mut codes = Vec::new();
    for found in regex.find_iter(query) {
        let run = found.as_str();
        if run.len() != 6 {
            continue;
        }
        if !codes.iter().any(|existing| existing == run) {
            codes.push(run.to_string());
        }
    }
    codes
}

/// 降级分析：识别股票代码后最多发起一次数据拉取，产出模板化信封。
/// confidence 恒为 null，摘要注明降级模式。
pub async fn rule_based_analysis(context: &ToolContext, query: &str) -> AnalysisEnvelope {
    let codes = extract_stock_codes(query);
    // 降级模式没有模型原文，raw 留空
    let mut envelope = AnalysisEnvelope::empty("");
    envelope.confidence = None;

    let Some(code) = codes.first() else {
        envelope.summary =
            "当前处于降级分析模式，问题中未识别到股票代码，仅提供一般性参考。".to_string();
        envelope.insights = vec![
            "A股市场整体呈结构性分化特征，个股研判需要明确标的".to_string(),
            "建议提供六位股票代码以获得基于行情数据的分析".to_string(),
        ];
        envelope.recommendations = vec![
            "关注主要指数走势与成交量变化".to_string(),
            "保持分散配置，控制单一标的仓位".to_string(),
        ];
        envelope.risk_level = Some(RISK_MEDIUM.to_string());
        return envelope;
    };

    let today = Local::now().date_naive();
    let start = today - Duration::days(FALLBACK_WINDOW_DAYS);
    let args = json!({
        "interface": FALLBACK_INTERFACE,
        "params": {
            "symbol": code,
            "period": "daily",
            "start_date": start.format("%Y%m%d").to_string(),
            "end_date": today.format("%Y%m%d").to_string(),
        },
        "page": 1,
        "page_size": 200,
    });

    envelope.summary = format!(
        "当前处于降级分析模式，基于本地规则对 {code} 给出基础分析，结论仅供参考。"
    );
    envelope.insights.push(format!("已识别股票代码: {code}"));

    match tools::execute_tool(context, TOOL_FETCH_MARKET_DATA, &args).await {
        Ok(result) => {
            let closes = extract_close_series(&result);
            let mut risk_score = 1u32;
            if closes.len() > 1 {
                let change =
                    (closes[closes.len() - 1] - closes[0]) / closes[0].abs().max(f64::EPSILON)
                        * 100.0;
                envelope.insights.push(describe_price_change(change));
                risk_score += if change.abs() > 10.0 {
                    3
                } else if change.abs() > 5.0 {
                    2
                } else {
                    1
                };
                envelope
                    .recommendations
                    .push(recommend_for_change(change).to_string());
            } else {
                envelope
                    .insights
                    .push("区间内行情记录不足，无法计算涨跌幅".to_string());
            }
            if closes.len() > 5 {
                let volatility = daily_volatility(&closes);
                envelope.insights.push(describe_volatility(volatility));
                risk_score += if volatility > 3.0 {
                    3
                } else if volatility > 1.5 {
                    2
                } else {
                    1
                };
            }
            envelope.risk_level = Some(risk_level_for_score(risk_score).to_string());
        }
        Err(err) => {
            warn!("降级分析取数失败: {err}");
            envelope
                .insights
                .push(format!("行情数据获取失败: {}", err.message()));
            envelope
                .recommendations
                .push("建议稍后重试或通过其他渠道核对行情".to_string());
            envelope.risk_level = Some(RISK_MEDIUM.to_string());
        }
    }

    if envelope.recommendations.is_empty() {
        envelope
            .recommendations
            .push("结合基本面与技术面综合判断，控制仓位".to_string());
    }
    envelope
}

/// 从工具结果的分页记录里取收盘价序列，兼容中英文列名。
fn extract_close_series(result: &Value) -> Vec<f64> {
    let Some(records) = result.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    let table = match Table::from_records(records) {
        Ok(table) => table,
        Err(_) => return Vec::new(),
    };
    let column = table
        .column_index("收盘")
        .or_else(|| table.column_index("close"));
    let Some(column) = column else {
        return Vec::new();
    };
    table
        .rows
        .iter()
        .filter_map(|row| row.get(column).and_then(|cell| cell.as_f64()))
        .collect()
}

fn daily_volatility(closes: &[f64]) -> f64 {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|pair| pair[0].abs() > f64::EPSILON)
        .map(|pair| (pair[1] - pair[0]) / pair[0] * 100.0)
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt()
}

fn describe_price_change(change: f64) -> String {
    if change > 5.0 {
        format!("股价呈现上涨趋势，区间累计涨幅 {change:.2}%")
    } else if change > 0.0 {
        format!("股价温和上涨，区间累计涨幅 {change:.2}%")
    } else if change > -5.0 {
        format!("股价小幅回落，区间累计跌幅 {:.2}%", change.abs())
    } else {
        format!("股价明显回调，区间累计跌幅 {:.2}%", change.abs())
    }
}

fn describe_volatility(volatility: f64) -> String {
    if volatility > 3.0 {
        format!("股价波动较大，日均波动率 {volatility:.2}%")
    } else if volatility > 1.5 {
        format!("股价波动适中，日均波动率 {volatility:.2}%")
    } else {
        format!("股价相对稳定，日均波动率 {volatility:.2}%")
    }
}

fn recommend_for_change(change: f64) -> &'static str {
    if change > 10.0 {
        "涨幅较大，注意回调风险，可考虑分批止盈"
    } else if change > 0.0 {
        "走势偏强，可继续跟踪，设置好止盈止损"
    } else if change > -10.0 {
        "短期承压，关注支撑位企稳信号"
    } else {
        "跌幅较深，等待企稳信号再考虑介入"
    }
}

fn risk_level_for_score(score: u32) -> &'static str {
    if score >= 6 {
        RISK_HIGH
    } else if score >= 3 {
        RISK_MEDIUM
    } else {
        RISK_LOW
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_stock_codes() {
        assert_eq!(extract_stock_codes("分析000001最近表现"), vec!["000001"]);
        assert_eq!(
            extract_stock_codes("对比600519和000858哪个更好，600519優先"),
            vec!["600519", "000858"]
        );
        assert!(extract_stock_codes("今天大盘怎么样").is_empty());
        // 七位数字不是股票代码
        assert!(extract_stock_codes("订单号1234567").is_empty());
    }

    #[test]
    fn test_volatility_and_descriptions() {
        let closes = vec![10.0, 10.1, 9.9, 10.2, 10.0, 10.3];
        let volatility = daily_volatility(&closes);
        assert!(volatility > 0.0);
        assert!(describe_volatility(volatility).contains("日均波动率"));
        assert!(describe_price_change(8.0).contains("8.00%"));
        assert!(describe_price_change(-7.5).contains("7.50%"));
    }

    #[test]
    fn test_risk_level_scoring() {
        assert_eq!(risk_level_for_score(2), RISK_LOW);
        assert_eq!(risk_level_for_score(4), RISK_MEDIUM);
        assert_eq!(risk_level_for_score(7), RISK_HIGH);
    }

    #[test]
    fn test_extract_close_series_cn_column() {
        let result = json!({
            "data": [
                {"日期": "2024-01-01", "收盘": 10.0},
                {"日期": "2024-01-02", "收盘": "10.5"}
            ]
        });
        assert_eq!(extract_close_series(&result), vec![10.0, 10.5]);
    }
}
