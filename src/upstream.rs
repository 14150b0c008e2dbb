// 上游调用器：对数据侧车的纯转发，带重试、超时与结果规模防护。
// 缓存不在这里，见 cache.rs。
use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::table::Table;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// 重试策略：指数退避加满幅抖动，只重试网络类与上游 5xx。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = rand::thread_rng().gen_range(0..=scaled.as_millis().max(1) as u64);
        Duration::from_millis(jitter_ms)
    }
}

enum CallFailure {
    Transient(GatewayError),
    Fatal(GatewayError),
}

pub struct UpstreamInvoker {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    policy: RetryPolicy,
    max_result_bytes: u64,
}

impl UpstreamInvoker {
    pub fn new(http: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_s.max(1)),
            policy: RetryPolicy {
                attempts: config.retry.max(1),
                base_delay: Duration::from_millis(config.backoff_ms.max(1)),
            },
            max_result_bytes: config.max_result_bytes,
        }
    }

    /// 调用命名接口并归一化为表格。墙钟上限覆盖全部重试。
    pub async fn call(
        &self,
        interface: &str,
        params: &Map<String, Value>,
    ) -> Result<Table, GatewayError> {
        let fut = self.call_with_retry(interface, params);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::UpstreamTimeout(format!(
                "上游接口超时: {interface}"
            ))),
        }
    }

    async fn call_with_retry(
        &self,
        interface: &str,
        params: &Map<String, Value>,
    ) -> Result<Table, GatewayError> {
        let mut attempt = 0u32;
        let mut last_err = GatewayError::Upstream(format!("上游接口不可用: {interface}"));
        while attempt < self.policy.attempts {
            match self.call_once(interface, params).await {
                Ok(table) => return Ok(table),
                Err(CallFailure::Fatal(err)) => return Err(err),
                Err(CallFailure::Transient(err)) => {
                    warn!(
                        "上游调用失败（第 {} 次）: {interface}, {err}",
                        attempt + 1
                    );
                    last_err = err;
                }
            }
            attempt += 1;
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }
        }
        Err(last_err)
    }

    async fn call_once(
        &self,
        interface: &str,
        params: &Map<String, Value>,
    ) -> Result<Table, CallFailure> {
        let payload = json!({ "interface": interface, "params": params });
        let response = self
            .http
            .post(format!("{}/call", self.endpoint))
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                CallFailure::Transient(GatewayError::Upstream(format!(
                    "上游请求失败: {err}"
                )))
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            CallFailure::Transient(GatewayError::Upstream(format!(
                "读取上游响应失败: {err}"
            )))
        })?;
        if !status.is_success() {
            return Err(classify_status(interface, status, &body));
        }
        let value = serde_json::from_str::<Value>(&body).map_err(|err| {
            CallFailure::Fatal(GatewayError::Parse(format!("上游响应不是 JSON: {err}")))
        })?;
        let records = extract_records(&value).ok_or_else(|| {
            CallFailure::Fatal(GatewayError::Parse(
                "上游响应缺少记录数组".to_string(),
            ))
        })?;
        let table = Table::from_records(records).map_err(CallFailure::Fatal)?;
        let serialized = table.serialized_len() as u64;
        if serialized > self.max_result_bytes {
            return Err(CallFailure::Fatal(GatewayError::ResultTooLarge(format!(
                "结果超出大小上限: {serialized} 字节"
            ))));
        }
        debug!(
            "上游调用成功: {interface}, 记录数 {}",
            table.record_count()
        );
        Ok(table)
    }
}

fn classify_status(interface: &str, status: StatusCode, body: &str) -> CallFailure {
    let detail = body.chars().take(256).collect::<String>();
    if status == StatusCode::NOT_FOUND {
        return CallFailure::Fatal(GatewayError::UnknownInterface(format!(
            "上游不存在接口: {interface}"
        )));
    }
    if status.is_client_error() {
        // 上游明确判定参数非法，重试没有意义。
        return CallFailure::Fatal(GatewayError::InvalidParameters(format!(
            "上游拒绝参数: {detail}"
        )));
    }
    CallFailure::Transient(GatewayError::Upstream(format!(
        "上游错误 {status}: {detail}"
    )))
}

fn extract_records(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("data").and_then(Value::as_array),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_records_accepts_both_shapes() {
        let bare = json!([{"a": 1}]);
        assert_eq!(extract_records(&bare).unwrap().len(), 1);
        let wrapped = json!({"data": [{"a": 1}, {"a": 2}]});
        assert_eq!(extract_records(&wrapped).unwrap().len(), 2);
        assert!(extract_records(&json!("text")).is_none());
    }

    #[test]
    fn test_classify_status_fatal_vs_transient() {
        let fatal = classify_status("x", StatusCode::UNPROCESSABLE_ENTITY, "bad param");
        assert!(matches!(
            fatal,
            CallFailure::Fatal(GatewayError::InvalidParameters(_))
        ));
        let missing = classify_status("x", StatusCode::NOT_FOUND, "");
        assert!(matches!(
            missing,
            CallFailure::Fatal(GatewayError::UnknownInterface(_))
        ));
        let transient = classify_status("x", StatusCode::BAD_GATEWAY, "boom");
        assert!(matches!(
            transient,
            CallFailure::Transient(GatewayError::Upstream(_))
        ));
    }

    #[test]
    fn test_retry_delay_bounded_by_backoff_window() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        for attempt in 0..4 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= Duration::from_millis(100 * (1 << attempt)));
        }
    }
}
