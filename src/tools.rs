// 模型可调用的工具集合：封闭集，启动即确定，始终以调用者身份执行。
use crate::cache::DataCache;
use crate::catalog::Catalog;
use crate::error::GatewayError;
use crate::files::FileStore;
use crate::paginate;
use crate::upstream::UpstreamInvoker;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const TOOL_FETCH_MARKET_DATA: &str = "fetch_market_data";
pub const TOOL_LIST_MY_FILES: &str = "list_my_files";
pub const TOOL_READ_MY_FILE: &str = "read_my_file";
pub const TOOL_DESCRIBE_INTERFACES: &str = "describe_interfaces";

// 喂给模型的默认页大小，避免单次工具结果撑爆上下文。
const TOOL_DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 工具执行上下文。caller 来自请求鉴权结果，模型无法伪造。
pub struct ToolContext {
    pub caller: String,
    pub catalog: Arc<Catalog>,
    pub cache: Arc<DataCache>,
    pub invoker: Arc<UpstreamInvoker>,
    pub files: Arc<FileStore>,
}

pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: TOOL_FETCH_MARKET_DATA.to_string(),
            description: "按接口名称和参数拉取中国金融市场数据，返回分页后的表格记录。"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "interface": {"type": "string", "description": "要调用的数据接口名称，例如 stock_zh_a_hist"},
                    "params": {"type": "object", "description": "接口参数字典，例如 {\"symbol\": \"600519\", \"period\": \"daily\"}"},
                    "page": {"type": "integer", "description": "页码，从 1 开始"},
                    "page_size": {"type": "integer", "description": "每页记录数，默认 50"}
                },
                "required": ["interface", "params"]
            }),
        },
        ToolSpec {
            name: TOOL_LIST_MY_FILES.to_string(),
            description: "列出当前用户上传的数据文件。".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
        ToolSpec {
            name: TOOL_READ_MY_FILE.to_string(),
            description: "按 CSV 读取当前用户上传的文件并分页返回。".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string", "description": "文件名"},
                    "page": {"type": "integer", "description": "页码，从 1 开始"},
                    "page_size": {"type": "integer", "description": "每页记录数，默认 50"}
                },
                "required": ["filename"]
            }),
        },
        ToolSpec {
            name: TOOL_DESCRIBE_INTERFACES.to_string(),
            description: "查看可用的数据接口及示例参数。".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
    ]
}

/// OpenAI tools 字段形态的工具声明。
pub fn openai_tool_defs() -> Vec<Value> {
    tool_specs()
        .into_iter()
        .map(|spec| {
            json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.input_schema,
                }
            })
        })
        .collect()
}

pub async fn execute_tool(
    context: &ToolContext,
    name: &str,
    args: &Value,
) -> Result<Value, GatewayError> {
    match name.trim() {
        TOOL_FETCH_MARKET_DATA => fetch_market_data(context, args).await,
        TOOL_LIST_MY_FILES => {
            let files = context.files.list(&context.caller).await?;
            Ok(json!({ "files": files }))
        }
        TOOL_READ_MY_FILE => read_my_file(context, args).await,
        TOOL_DESCRIBE_INTERFACES => {
            let interfaces = context
                .catalog
                .list()
                .into_iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "example_params": spec.example_params,
                    })
                })
                .collect::<Vec<_>>();
            Ok(json!({ "interfaces": interfaces }))
        }
        other => Err(GatewayError::InvalidParameters(format!(
            "未知工具: {other}"
        ))),
    }
}

async fn fetch_market_data(context: &ToolContext, args: &Value) -> Result<Value, GatewayError> {
    let interface = args
        .get("interface")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| GatewayError::InvalidParameters("缺少 interface 参数".to_string()))?;
    if !context.catalog.has(interface) {
        return Err(GatewayError::UnknownInterface(format!(
            "接口不存在: {interface}"
        )));
    }
    let params: Map<String, Value> = match args.get("params") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => {
            return Err(GatewayError::InvalidParameters(
                "params 必须是对象".to_string(),
            ))
        }
    };
    let (page, page_size) = page_args(args);
    let invoker = context.invoker.clone();
    let interface_owned = interface.to_string();
    let params_snapshot = params.clone();
    let table = context
        .cache
        .get_or_compute(interface, &params, move || async move {
            invoker.call(&interface_owned, &params_snapshot).await
        })
        .await?;
    let envelope = paginate::paginate(&table, page, page_size);
    serde_json::to_value(&envelope).map_err(GatewayError::internal)
}

async fn read_my_file(context: &ToolContext, args: &Value) -> Result<Value, GatewayError> {
    let filename = args
        .get("filename")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| GatewayError::InvalidParameters("缺少 filename 参数".to_string()))?;
    let (page, page_size) = page_args(args);
    let envelope = context
        .files
        .browse(&context.caller, filename, page, page_size)
        .await?;
    serde_json::to_value(&envelope).map_err(GatewayError::internal)
}

fn page_args(args: &Value) -> (usize, usize) {
    let page = args
        .get("page")
        .and_then(Value::as_u64)
        .map(|value| value as usize)
        .unwrap_or(1);
    let page_size = args
        .get("page_size")
        .and_then(Value::as_u64)
        .map(|value| value as usize)
        .unwrap_or(TOOL_DEFAULT_PAGE_SIZE);
    (page, page_size)
}
