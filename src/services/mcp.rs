// MCP 客户端：基于 rmcp SDK 的 Streamable HTTP 传输，调用文件与记忆服务。
use crate::core::config::{McpConfig, McpServerConfig};
use anyhow::{anyhow, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParam, CallToolResult, JsonObject};
use rmcp::service::serve_client;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::time::Duration;
use tracing::warn;

pub const FILESYSTEM_SERVER: &str = "filesystem";
pub const MEMORY_SERVER: &str = "memory";

#[derive(Clone, Default)]
struct NoopClientHandler;

impl ClientHandler for NoopClientHandler {}

/// 调用指定 MCP 服务的工具并返回结构化结果。
pub async fn call_tool(
    config: &McpConfig,
    server_name: &str,
    tool_name: &str,
    args: &Value,
) -> Result<Value> {
    let server = config
        .enabled_server(server_name)
        .ok_or_else(|| anyhow!("MCP 服务未启用: {server_name}"))?;
    if !server.allow_tools.is_empty() && !server.allow_tools.contains(&tool_name.to_string()) {
        return Err(anyhow!("MCP 工具不在允许列表中: {tool_name}"));
    }
    let transport = build_transport(config, server)?;
    let service = serve_client(NoopClientHandler, transport).await?;
    let result = service
        .call_tool(CallToolRequestParam {
            name: Cow::Owned(tool_name.to_string()),
            arguments: normalize_mcp_arguments(args),
        })
        .await?;
    Ok(serialize_tool_result(result))
}

fn build_transport(
    config: &McpConfig,
    server: &McpServerConfig,
) -> Result<StreamableHttpClientTransport<reqwest::Client>> {
    let headers = build_mcp_headers(server)?;
    let mut builder = reqwest::Client::builder().default_headers(headers);
    if config.timeout_s > 0 {
        builder = builder.timeout(Duration::from_secs(config.timeout_s));
    }
    let client = builder.build()?;
    let http_config = StreamableHttpClientTransportConfig::with_uri(server.endpoint.clone());
    Ok(StreamableHttpClientTransport::with_client(
        client,
        http_config,
    ))
}

fn build_mcp_headers(server: &McpServerConfig) -> Result<HeaderMap> {
    let mut header_map = HeaderMap::new();
    for (key, value) in &server.headers {
        let name = HeaderName::from_bytes(key.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        header_map.insert(name, value);
    }
    Ok(header_map)
}

fn normalize_mcp_arguments(args: &Value) -> Option<JsonObject> {
    // MCP 只接受对象参数，其它类型统一视为无参数。
    match args {
        Value::Object(map) => Some(map.clone()),
        _ => None,
    }
}

fn serialize_tool_result(result: CallToolResult) -> Value {
    let content = result
        .content
        .into_iter()
        .map(|block| serde_json::to_value(block).unwrap_or(Value::Null))
        .collect::<Vec<_>>();
    json!({
        "content": content,
        "structured_content": result.structured_content,
        "meta": result.meta,
        "is_error": result.is_error,
    })
}

/// 通过 filesystem 服务写文件。服务未启用时返回 None，由调用方回退本地写入。
pub async fn write_file(config: &McpConfig, path: &str, content: &str) -> Option<Result<Value>> {
    config.enabled_server(FILESYSTEM_SERVER)?;
    Some(
        call_tool(
            config,
            FILESYSTEM_SERVER,
            "write_file",
            &json!({ "path": path, "content": content }),
        )
        .await,
    )
}

/// 记录跨会话记忆。火忘调用，失败仅打日志。
pub async fn record_memory(config: &McpConfig, session_id: &str, observation: &str) {
    if config.enabled_server(MEMORY_SERVER).is_none() {
        return;
    }
    let args = json!({
        "entities": [{
            "name": format!("session:{session_id}"),
            "entityType": "chat_session",
            "observations": [observation],
        }]
    });
    if let Err(err) = call_tool(config, MEMORY_SERVER, "create_entities", &args).await {
        warn!("记录记忆失败: {err}");
    }
}

/// 检索与查询相关的记忆，服务未启用或失败时返回 None。
pub async fn recall_memory(config: &McpConfig, query: &str) -> Option<Value> {
    config.enabled_server(MEMORY_SERVER)?;
    match call_tool(config, MEMORY_SERVER, "search_nodes", &json!({ "query": query })).await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("检索记忆失败: {err}");
            None
        }
    }
}

/// 把工具结果里的文本块拼成一段纯文本，无文本时返回 None。
pub fn flatten_tool_text(result: &Value) -> Option<String> {
    let blocks = result.get("content")?.as_array()?;
    let text = blocks
        .iter()
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_server(name: &str, enabled: bool) -> McpConfig {
        McpConfig {
            timeout_s: 5,
            servers: vec![McpServerConfig {
                name: name.to_string(),
                endpoint: "http://127.0.0.1:9/mcp".to_string(),
                enabled,
                allow_tools: Vec::new(),
                headers: Default::default(),
            }],
        }
    }

    #[tokio::test]
    async fn test_disabled_server_rejected() {
        let config = config_with_server(FILESYSTEM_SERVER, false);
        let result = call_tool(&config, FILESYSTEM_SERVER, "write_file", &json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_file_none_when_unconfigured() {
        let config = McpConfig::default();
        assert!(write_file(&config, "a.html", "<html></html>").await.is_none());
    }

    #[tokio::test]
    async fn test_recall_memory_none_when_unconfigured() {
        let config = config_with_server(MEMORY_SERVER, false);
        assert!(recall_memory(&config, "anything").await.is_none());
    }

    #[test]
    fn test_flatten_tool_text() {
        let result = json!({
            "content": [
                { "type": "text", "text": "note one" },
                { "type": "text", "text": "note two" },
            ]
        });
        assert_eq!(flatten_tool_text(&result).unwrap(), "note one\nnote two");
        assert!(flatten_tool_text(&json!({ "content": [] })).is_none());
        assert!(flatten_tool_text(&json!({})).is_none());
    }

    #[test]
    fn test_normalize_arguments() {
        assert!(normalize_mcp_arguments(&json!({"a": 1})).is_some());
        assert!(normalize_mcp_arguments(&Value::Null).is_none());
        assert!(normalize_mcp_arguments(&json!([1, 2])).is_none());
    }
}
