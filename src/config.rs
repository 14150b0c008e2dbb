// 配置读取与环境变量展开，保持 YAML 配置格式。
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fs;
use tracing::warn;

pub const DEFAULT_MAX_RESULT_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub token_secret: Option<String>,
    pub token_ttl_minutes: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersConfig {
    pub path: String,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            path: "data/users.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: "config/akshare_interfaces.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub timeout_s: u64,
    pub retry: u32,
    pub backoff_ms: u64,
    pub max_result_bytes: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8701".to_string(),
            timeout_s: 30,
            retry: 3,
            backoff_ms: 500,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub root: String,
    pub ceiling_bytes: u64,
    pub serve_stale_on_error: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: "data/cache".to_string(),
            ceiling_bytes: 512 * 1024 * 1024,
            serve_stale_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    pub root: String,
    pub max_upload_bytes: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: "data/user_files".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    pub timeout_s: u64,
    pub max_rounds: u32,
    #[serde(default)]
    pub max_output: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: None,
            temperature: Some(0.1),
            timeout_s: 60,
            max_rounds: 6,
            max_output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

impl Config {
    // 统一归一化签名密钥，空白视为未配置。
    pub fn token_secret(&self) -> Option<String> {
        let inline = self
            .security
            .token_secret
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty());
        if let Some(value) = inline {
            return Some(value.to_string());
        }
        env::var("AKGATE_TOKEN_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

pub fn load_config() -> Config {
    let path = env::var("AKGATE_CONFIG_PATH").unwrap_or_else(|_| "config/akgate.yaml".to_string());
    let mut parsed = read_yaml(&path);
    expand_yaml_env(&mut parsed);
    serde_yaml::from_value::<Config>(parsed).unwrap_or_else(|err| {
        warn!("配置解析失败，使用默认配置: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，首次启动回落到默认值。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("读取配置失败: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("解析 YAML 失败: {path}, {err}");
        Value::Null
    })
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("AKGATE_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${AKGATE_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        std::env::set_var("AKGATE_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("prefix-${AKGATE_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );
        std::env::remove_var("AKGATE_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${AKGATE_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn test_defaults_follow_documented_values() {
        let config = Config::default();
        assert_eq!(config.security.token_ttl_minutes, 30);
        assert_eq!(config.upstream.timeout_s, 30);
        assert_eq!(config.upstream.retry, 3);
        assert_eq!(config.llm.timeout_s, 60);
        assert_eq!(config.llm.max_rounds, 6);
        assert_eq!(config.files.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }
}
