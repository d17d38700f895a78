// API 请求与响应数据结构，保持与现有接口字段一致。
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
    /// 处理本轮请求的代理：noah / wanderer / tinkerer / boutique / safety。
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_operation_id: Option<String>,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub radio_silence: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interface_locked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactPayload {
    pub artifact_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(rename = "input_tokens")]
    pub input: u64,
    #[serde(rename = "output_tokens")]
    pub output: u64,
    #[serde(rename = "total_tokens")]
    pub total: u64,
}
