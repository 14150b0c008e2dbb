// 分析调度器：驱动模型↔工具循环，回合数与墙钟双重封顶，模型不可达时降级。
pub mod envelope;
pub mod fallback;

use crate::cache::DataCache;
use crate::catalog::Catalog;
use crate::config::LlmConfig;
use crate::error::GatewayError;
use crate::files::FileStore;
use crate::llm::{is_llm_configured, ChatMessage, LlmClient, ToolCall};
use crate::tools::{self, ToolContext};
use crate::upstream::UpstreamInvoker;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use envelope::AnalysisEnvelope;

/// 调度状态机。Done 产出信封，Degraded 交给规则分析器。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingModel,
    ExecutingTools,
    Done,
    Degraded,
}

pub struct Analyst {
    config: LlmConfig,
    catalog: Arc<Catalog>,
    cache: Arc<DataCache>,
    invoker: Arc<UpstreamInvoker>,
    files: Arc<FileStore>,
    http: reqwest::Client,
}

impl Analyst {
    pub fn new(
        config: LlmConfig,
        catalog: Arc<Catalog>,
        cache: Arc<DataCache>,
        invoker: Arc<UpstreamInvoker>,
        files: Arc<FileStore>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            catalog,
            cache,
            invoker,
            files,
            http,
        }
    }

    fn tool_context(&self, caller: &str) -> ToolContext {
        ToolContext {
            caller: caller.to_string(),
            catalog: self.catalog.clone(),
            cache: self.cache.clone(),
            invoker: self.invoker.clone(),
            files: self.files.clone(),
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "你是一个专业的中国金融市场数据分析助手。你的任务是理解用户需求，\
             选择合适的数据接口，通过工具获取数据并给出专业分析。\n\n\
             分析原则：基于数据事实，给出具体数字支持结论，明确数据时间范围，\
             谨慎给出投资建议并提示风险。\n\n\
             {}\n\
             最终回复请输出一个 ```json 代码块，包含字段 summary、insights、\
             recommendations、risk_level（低风险/中等风险/高风险）与 confidence（0 到 1）。",
            self.catalog.format_for_prompt()
        )
    }

    /// 简单对话：单轮补全，不挂工具。
    pub async fn chat(&self, prompt: &str) -> Result<String, GatewayError> {
        if !is_llm_configured(&self.config) {
            return Err(GatewayError::ModelUnreachable(
                "模型服务未配置".to_string(),
            ));
        }
        let client = LlmClient::new(self.http.clone(), self.config.clone());
        let messages = vec![
            ChatMessage::text("system", "你是一个专业的中国金融市场数据分析助手。"),
            ChatMessage::text("user", prompt),
        ];
        let timeout = Duration::from_secs(self.config.timeout_s.max(1));
        match tokio::time::timeout(timeout, client.complete(&messages)).await {
            Ok(Ok(response)) => Ok(response.content),
            Ok(Err(err)) => Err(GatewayError::ModelUnreachable(format!(
                "模型调用失败: {err}"
            ))),
            Err(_) => Err(GatewayError::ModelUnreachable(
                "模型调用超时".to_string(),
            )),
        }
    }

    /// 分析入口。use_llm=false 或模型未配置时直接走规则分析；
    /// 模型不可达且没有任何部分结果时同样降级。
    pub async fn analyze(
        &self,
        query: &str,
        caller: &str,
        use_llm: bool,
    ) -> Result<AnalysisEnvelope, GatewayError> {
        let context = self.tool_context(caller);
        if !use_llm || !is_llm_configured(&self.config) {
            debug!("analyst phase: {:?}", Phase::Degraded);
            return Ok(fallback::rule_based_analysis(&context, query).await);
        }
        match self.drive_model_loop(query, &context).await {
            Ok(envelope) => Ok(envelope),
            Err(err) => {
                warn!("模型分析失败，切换规则分析: {err}");
                Ok(fallback::rule_based_analysis(&context, query).await)
            }
        }
    }

    /// 模型循环：每轮要么返回最终回复，要么给出一批工具调用。
    /// 批内并行执行，但历史按发射顺序追加，保证转录确定性。
    async fn drive_model_loop(
        &self,
        query: &str,
        context: &ToolContext,
    ) -> Result<AnalysisEnvelope, GatewayError> {
        let client = LlmClient::new(self.http.clone(), self.config.clone());
        let tool_defs = tools::openai_tool_defs();
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_s.max(1));
        let max_rounds = self.config.max_rounds.max(1);

        let mut messages = vec![
            ChatMessage::text("system", self.system_prompt()),
            ChatMessage::text("user", query),
        ];
        let mut phase = Phase::AwaitingModel;
        let mut last_content = String::new();

        for round in 0..max_rounds {
            debug!("analyst phase: {phase:?}, round {round}");
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                phase = Phase::Degraded;
                break;
            }
            let result = tokio::time::timeout(
                remaining,
                client.complete_with_tools(&messages, Some(tool_defs.as_slice())),
            )
            .await;
            let response = match result {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    if last_content.trim().is_empty() {
                        return Err(GatewayError::ModelUnreachable(format!(
                            "模型调用失败: {err}"
                        )));
                    }
                    phase = Phase::Degraded;
                    break;
                }
                Err(_) => {
                    phase = Phase::Degraded;
                    break;
                }
            };

            if response.tool_calls.is_empty() {
                if response.content.trim().is_empty() {
                    phase = Phase::Degraded;
                    break;
                }
                phase = Phase::Done;
                debug!("analyst phase: {phase:?}");
                return Ok(envelope::parse_envelope(&response.content));
            }

            phase = Phase::ExecutingTools;
            if !response.content.trim().is_empty() {
                last_content = response.content.clone();
            }
            let calls = assign_call_ids(round, response.tool_calls);
            messages.push(assistant_tool_message(&response.content, &calls));

            let executions = calls
                .iter()
                .map(|(_, call)| tools::execute_tool(context, &call.name, &call.arguments));
            let results = join_all(executions).await;
            // 按发射序号回填，模型看到的顺序与请求顺序一致
            for ((call_id, call), result) in calls.iter().zip(results.into_iter()) {
                let observation = observation_payload(&call.name, result);
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Value::String(observation.to_string()),
                    tool_calls: None,
                    tool_call_id: Some(call_id.clone()),
                });
            }
            phase = Phase::AwaitingModel;
        }

        debug!("analyst phase: {phase:?}");
        if !last_content.trim().is_empty() {
            return Ok(envelope::parse_envelope(&last_content));
        }
        Err(GatewayError::ModelUnreachable(
            "模型在限定轮次内未给出最终回复".to_string(),
        ))
    }
}

fn assign_call_ids(round: u32, calls: Vec<ToolCall>) -> Vec<(String, ToolCall)> {
    calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{round}_{index}"));
            (id, call)
        })
        .collect()
}

fn assistant_tool_message(content: &str, calls: &[(String, ToolCall)]) -> ChatMessage {
    let payload = calls
        .iter()
        .map(|(id, call)| {
            json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments.to_string(),
                }
            })
        })
        .collect::<Vec<_>>();
    ChatMessage {
        role: "assistant".to_string(),
        content: Value::String(content.to_string()),
        tool_calls: Some(Value::Array(payload)),
        tool_call_id: None,
    }
}

/// 工具结果观测值。失败不是致命错误，回传给模型自行调整。
fn observation_payload(tool_name: &str, result: Result<Value, GatewayError>) -> Value {
    match result {
        Ok(data) => json!({ "tool": tool_name, "ok": true, "data": data }),
        Err(err) => json!({
            "tool": tool_name,
            "ok": false,
            "error": err.message(),
            "kind": err.code(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_call_ids_keeps_model_ids() {
        let calls = vec![
            ToolCall {
                id: Some("call_abc".to_string()),
                name: "list_my_files".to_string(),
                arguments: json!({}),
            },
            ToolCall {
                id: None,
                name: "describe_interfaces".to_string(),
                arguments: json!({}),
            },
        ];
        let assigned = assign_call_ids(2, calls);
        assert_eq!(assigned[0].0, "call_abc");
        assert_eq!(assigned[1].0, "call_2_1");
    }

    #[test]
    fn test_observation_payload_shapes() {
        let ok = observation_payload("list_my_files", Ok(json!({"files": []})));
        assert_eq!(ok["ok"], json!(true));
        assert_eq!(ok["data"]["files"], json!([]));
        let err = observation_payload(
            "fetch_market_data",
            Err(GatewayError::UnknownInterface("接口不存在".to_string())),
        );
        assert_eq!(err["ok"], json!(false));
        assert_eq!(err["kind"], json!("UNKNOWN_INTERFACE"));
    }

    #[test]
    fn test_assistant_tool_message_serializes_arguments_as_text() {
        let calls = assign_call_ids(
            0,
            vec![ToolCall {
                id: None,
                name: "fetch_market_data".to_string(),
                arguments: json!({"interface": "stock_zh_a_hist", "params": {}}),
            }],
        );
        let message = assistant_tool_message("", &calls);
        let payload = message.tool_calls.unwrap();
        assert!(payload[0]["function"]["arguments"].is_string());
    }
}
