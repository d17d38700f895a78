// 配置读取与覆盖合并，保持与现有 YAML 配置格式兼容。
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub video: VideoConfig,
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

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub models: HashMap<String, LlmModelConfig>,
    #[serde(default)]
    pub tasks: TaskModelConfig,
}

/// 按任务类型选择模型：普通对话、调研（Wanderer）、构建（Tinkerer）。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskModelConfig {
    #[serde(default)]
    pub chat: String,
    #[serde(default)]
    pub research: String,
    #[serde(default)]
    pub build: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmModelConfig {
    #[serde(default, alias = "enabled")]
    pub enable: Option<bool>,
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub max_output: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stream_include_usage: Option<bool>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub mock_if_unconfigured: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// 单次代理调用的超时秒数，超时后丢弃请求并回退普通对话。
    pub timeout_s: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self { timeout_s: 90 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub enabled: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresConfig {
    pub dsn: String,
    #[serde(default)]
    pub connect_timeout_s: u64,
    #[serde(default)]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub timeout_s: u64,
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

impl McpConfig {
    /// 按名称查找已启用的服务，未配置或禁用时返回 None。
    pub fn enabled_server(&self, name: &str) -> Option<&McpServerConfig> {
        self.servers
            .iter()
            .find(|server| server.enabled && server.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpServerConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_tools: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// 审批通过的文件写入与 serve 路由的根目录。
    pub root: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: "./data/workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnowledgeConfig {
    // 环境变量展开后可能是字符串形式的布尔值
    #[serde(default, deserialize_with = "flexible_bool")]
    pub rag_enabled: bool,
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(flag) => flag,
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Value::Number(num) => num.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VideoConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub poster: String,
}

impl Config {
    /// 按任务类型解析模型配置，未配置时回退默认模型。
    pub fn model_for_task(&self, task: &str) -> Option<&LlmModelConfig> {
        let name = match task {
            "research" => self.llm.tasks.research.trim(),
            "build" => self.llm.tasks.build.trim(),
            _ => self.llm.tasks.chat.trim(),
        };
        let name = if name.is_empty() {
            self.llm.default.trim()
        } else {
            name
        };
        if name.is_empty() {
            return None;
        }
        self.llm.models.get(name)
    }
}

pub fn load_config() -> Config {
    // 读取基础配置与覆盖配置，优先使用覆盖内容。
    let base_path =
        env::var("NOAH_CONFIG_PATH").unwrap_or_else(|_| "config/noah.yaml".to_string());
    let override_path = env::var("NOAH_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| "data/config/noah.override.yaml".to_string());

    let mut merged = read_yaml(&base_path);
    if Path::new(&override_path).exists() {
        let override_value = read_yaml(&override_path);
        // 只对非空字段做递归覆盖，避免误清空已有配置。
        merge_yaml(&mut merged, override_value);
    }

    expand_yaml_env(&mut merged);

    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("配置解析失败，使用默认配置: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，避免开发环境首次启动失败。
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

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
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
        std::env::remove_var("NOAH_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${NOAH_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        assert_eq!(
            expand_env_placeholders("prefix-${NOAH_TEST_PLACEHOLDER:-d}-suffix"),
            "prefix-d-suffix"
        );

        std::env::set_var("NOAH_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("${NOAH_TEST_PLACEHOLDER:-default}"),
            "value"
        );
        assert_eq!(
            expand_env_placeholders("prefix-${NOAH_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );

        std::env::remove_var("NOAH_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${NOAH_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn test_model_for_task_falls_back_to_default() {
        let mut config = Config::default();
        config.llm.default = "main".to_string();
        config
            .llm
            .models
            .insert("main".to_string(), LlmModelConfig::default());
        config
            .llm
            .models
            .insert("research".to_string(), LlmModelConfig::default());
        config.llm.tasks.research = "research".to_string();

        assert!(config.model_for_task("chat").is_some());
        assert!(config.model_for_task("research").is_some());
        assert!(config.model_for_task("build").is_some());
    }
}
