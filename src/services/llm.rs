// LLM 适配：支持 OpenAI 兼容的 Chat Completions 与 Anthropic Messages 调用。
use crate::core::config::LlmModelConfig;
use crate::core::schemas::TokenUsage;
use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use tracing::warn;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_ANTHROPIC_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAiCompatible,
    Anthropic,
}

pub fn normalize_provider(provider: Option<&str>) -> Provider {
    let raw = provider.unwrap_or("").trim();
    match raw.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
        "anthropic" | "claude" => Provider::Anthropic,
        _ => Provider::OpenAiCompatible,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmModelConfig,
    provider: Provider,
}

impl LlmClient {
    pub fn new(http: Client, config: LlmModelConfig) -> Self {
        let provider = normalize_provider(config.provider.as_deref());
        Self {
            http,
            config,
            provider,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        match self.provider {
            Provider::OpenAiCompatible => self.complete_openai(messages).await,
            Provider::Anthropic => self.complete_anthropic(messages).await,
        }
    }

    /// 流式补全，每产生一段增量文本就回调一次。
    pub async fn stream_complete<F, Fut>(
        &self,
        messages: &[ChatMessage],
        on_delta: F,
    ) -> Result<LlmResponse>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.provider {
            Provider::OpenAiCompatible => self.stream_openai(messages, on_delta).await,
            Provider::Anthropic => self.stream_anthropic(messages, on_delta).await,
        }
    }

    async fn complete_openai(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        let response = self
            .http
            .post(self.openai_endpoint())
            .headers(self.openai_headers())
            .json(&self.build_openai_payload(messages, false, false))
            .send()
            .await?;
        let status = response.status();
        let body_text = response.text().await.context("read llm response body")?;
        let body = parse_body(&body_text);
        if !status.is_success() {
            let detail = if body == Value::Null {
                json!({ "raw": truncate_text(&body_text, 2048) })
            } else {
                body
            };
            return Err(anyhow!("LLM request failed: {status} {detail}"));
        }
        if body == Value::Null {
            return Err(anyhow!(
                "LLM response parse failed: {}",
                truncate_text(&body_text, 2048)
            ));
        }
        let content = body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .and_then(|value| value.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let usage = normalize_usage(body.get("usage"));
        Ok(LlmResponse { content, usage })
    }

    async fn complete_anthropic(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        let response = self
            .http
            .post(self.anthropic_endpoint())
            .headers(self.anthropic_headers())
            .json(&self.build_anthropic_payload(messages, false))
            .send()
            .await?;
        let status = response.status();
        let body_text = response.text().await.context("read llm response body")?;
        let body = parse_body(&body_text);
        if !status.is_success() {
            let detail = if body == Value::Null {
                json!({ "raw": truncate_text(&body_text, 2048) })
            } else {
                body
            };
            return Err(anyhow!("LLM request failed: {status} {detail}"));
        }
        if body == Value::Null {
            return Err(anyhow!(
                "LLM response parse failed: {}",
                truncate_text(&body_text, 2048)
            ));
        }
        // Anthropic 将文本拆在 content 数组内，拼接所有 text 块。
        let content = body
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let usage = normalize_usage(body.get("usage"));
        Ok(LlmResponse { content, usage })
    }

    async fn stream_openai<F, Fut>(
        &self,
        messages: &[ChatMessage],
        mut on_delta: F,
    ) -> Result<LlmResponse>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut include_usage = self.config.stream_include_usage.unwrap_or(true);
        let mut usage_fallback = include_usage;
        loop {
            let response = self
                .http
                .post(self.openai_endpoint())
                .headers(self.openai_headers())
                .json(&self.build_openai_payload(messages, true, include_usage))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let text = match response.text().await {
                    Ok(value) => value,
                    Err(err) => {
                        return Err(anyhow!(
                            "LLM stream request failed: {status} (read body failed: {err})"
                        ));
                    }
                };
                // 部分网关不认识 stream_options，降级重试一次。
                if usage_fallback && include_usage && matches!(status.as_u16(), 400 | 422) {
                    include_usage = false;
                    usage_fallback = false;
                    continue;
                }
                return Err(anyhow!(
                    "LLM stream request failed: {status} {}",
                    truncate_text(&text, 2048)
                ));
            }
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut combined = String::new();
            let mut usage: Option<TokenUsage> = None;
            let mut saw_done = false;
            while let Some(item) = stream.next().await {
                let bytes = item?;
                let part = String::from_utf8_lossy(&bytes);
                buffer.push_str(&part);
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer = buffer[pos + 1..].to_string();
                    if line.is_empty() || !line.starts_with("data:") {
                        continue;
                    }
                    let data = line.trim_start_matches("data:").trim();
                    if data == "[DONE]" {
                        saw_done = true;
                        break;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(payload) => {
                            if let Some(new_usage) = normalize_usage(payload.get("usage")) {
                                usage = Some(new_usage);
                            }
                            let content_delta = payload
                                .get("choices")
                                .and_then(|value| value.get(0))
                                .and_then(|value| value.get("delta"))
                                .and_then(|value| value.get("content"))
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            if !content_delta.is_empty() {
                                combined.push_str(content_delta);
                                on_delta(content_delta.to_string()).await?;
                            }
                        }
                        Err(err) => {
                            warn!(
                                "LLM stream json parse failed: {err}, data={}",
                                truncate_text(data, 512)
                            );
                        }
                    }
                }
                if saw_done {
                    break;
                }
            }
            if !saw_done {
                warn!("LLM stream ended without [DONE]");
            }
            return Ok(LlmResponse {
                content: combined,
                usage,
            });
        }
    }

    async fn stream_anthropic<F, Fut>(
        &self,
        messages: &[ChatMessage],
        mut on_delta: F,
    ) -> Result<LlmResponse>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let response = self
            .http
            .post(self.anthropic_endpoint())
            .headers(self.anthropic_headers())
            .json(&self.build_anthropic_payload(messages, true))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "LLM stream request failed: {status} {}",
                truncate_text(&text, 2048)
            ));
        }
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut combined = String::new();
        let mut input_tokens: u64 = 0;
        let mut output_tokens: u64 = 0;
        while let Some(item) = stream.next().await {
            let bytes = item?;
            let part = String::from_utf8_lossy(&bytes);
            buffer.push_str(&part);
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer = buffer[pos + 1..].to_string();
                if line.is_empty() || !line.starts_with("data:") {
                    continue;
                }
                let data = line.trim_start_matches("data:").trim();
                let payload = match serde_json::from_str::<Value>(data) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(
                            "LLM stream json parse failed: {err}, data={}",
                            truncate_text(data, 512)
                        );
                        continue;
                    }
                };
                match payload.get("type").and_then(Value::as_str).unwrap_or("") {
                    "content_block_delta" => {
                        let delta = payload
                            .get("delta")
                            .and_then(|value| value.get("text"))
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        if !delta.is_empty() {
                            combined.push_str(delta);
                            on_delta(delta.to_string()).await?;
                        }
                    }
                    "message_start" => {
                        input_tokens = payload
                            .get("message")
                            .and_then(|value| value.get("usage"))
                            .and_then(|value| value.get("input_tokens"))
                            .and_then(Value::as_u64)
                            .unwrap_or(0);
                    }
                    "message_delta" => {
                        output_tokens = payload
                            .get("usage")
                            .and_then(|value| value.get("output_tokens"))
                            .and_then(Value::as_u64)
                            .unwrap_or(output_tokens);
                    }
                    _ => {}
                }
            }
        }
        let usage = if input_tokens == 0 && output_tokens == 0 {
            None
        } else {
            Some(TokenUsage {
                input: input_tokens,
                output: output_tokens,
                total: input_tokens + output_tokens,
            })
        };
        Ok(LlmResponse {
            content: combined,
            usage,
        })
    }

    fn openai_endpoint(&self) -> String {
        let base = self
            .base_url()
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn anthropic_endpoint(&self) -> String {
        let base = self
            .base_url()
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string());
        format!("{base}/v1/messages")
    }

    fn base_url(&self) -> Option<String> {
        self.config
            .base_url
            .as_deref()
            .map(|value| value.trim().trim_end_matches('/'))
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
    }

    fn openai_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = &self.config.api_key {
            if !api_key.is_empty() {
                let value = format!("Bearer {api_key}");
                if let Ok(header_value) = value.parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, header_value);
                }
            }
        }
        headers
    }

    fn anthropic_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = &self.config.api_key {
            if !api_key.is_empty() {
                if let Ok(header_value) = api_key.parse() {
                    headers.insert("x-api-key", header_value);
                }
            }
        }
        if let Ok(version) = ANTHROPIC_VERSION.parse() {
            headers.insert("anthropic-version", version);
        }
        headers
    }

    fn build_openai_payload(
        &self,
        messages: &[ChatMessage],
        stream: bool,
        include_usage: bool,
    ) -> Value {
        let temperature = round_f32(self.config.temperature.unwrap_or(0.7));
        let mut payload = json!({
            "model": self.config.model.clone().unwrap_or_else(|| "gpt-4".to_string()),
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
        });
        if stream && include_usage {
            payload["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max_output) = self.config.max_output {
            if max_output > 0 {
                payload["max_tokens"] = json!(max_output);
            }
        }
        if let Some(stop) = &self.config.stop {
            if !stop.is_empty() {
                payload["stop"] = json!(stop);
            }
        }
        payload
    }

    fn build_anthropic_payload(&self, messages: &[ChatMessage], stream: bool) -> Value {
        // Anthropic 要求 system 为顶层字段，且 max_tokens 必填。
        let system = messages
            .iter()
            .filter(|message| message.role == "system")
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let conversation: Vec<&ChatMessage> = messages
            .iter()
            .filter(|message| message.role != "system")
            .collect();
        let max_tokens = self
            .config
            .max_output
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_ANTHROPIC_MAX_TOKENS);
        let mut payload = json!({
            "model": self.config.model.clone().unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            "messages": conversation,
            "max_tokens": max_tokens,
            "temperature": round_f32(self.config.temperature.unwrap_or(0.7)),
            "stream": stream,
        });
        if !system.is_empty() {
            payload["system"] = json!(system);
        }
        if let Some(stop) = &self.config.stop {
            if !stop.is_empty() {
                payload["stop_sequences"] = json!(stop);
            }
        }
        payload
    }
}

pub fn build_llm_client(config: &LlmModelConfig, http: Client) -> LlmClient {
    LlmClient::new(http, config.clone())
}

pub fn is_llm_configured(config: &LlmModelConfig) -> bool {
    if !config.enable.unwrap_or(true) {
        return false;
    }
    let has_endpoint = match normalize_provider(config.provider.as_deref()) {
        // Anthropic 有默认 base_url，只要有 key 即可工作。
        Provider::Anthropic => config
            .api_key
            .as_ref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false),
        Provider::OpenAiCompatible => config
            .base_url
            .as_ref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false),
    };
    has_endpoint
        && config
            .model
            .as_ref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
}

fn parse_body(body_text: &str) -> Value {
    match serde_json::from_str::<Value>(body_text) {
        Ok(value) => value,
        Err(err) => {
            warn!(
                "LLM response json parse failed: {err}, body={}",
                truncate_text(body_text, 2048)
            );
            Value::Null
        }
    }
}

fn normalize_usage(raw: Option<&Value>) -> Option<TokenUsage> {
    let raw = raw?;
    let Value::Object(map) = raw else {
        return None;
    };
    let to_u64 = |value: Option<&Value>| -> Option<u64> {
        match value {
            Some(Value::Number(num)) => num.as_u64(),
            Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
            _ => None,
        }
    };
    let input = to_u64(map.get("input_tokens"))
        .or_else(|| to_u64(map.get("prompt_tokens")))
        .unwrap_or(0);
    let output = to_u64(map.get("output_tokens"))
        .or_else(|| to_u64(map.get("completion_tokens")))
        .unwrap_or(0);
    let total = to_u64(map.get("total_tokens")).unwrap_or(input + output);
    if input == 0 && output == 0 && total == 0 {
        return None;
    }
    Some(TokenUsage {
        input,
        output,
        total,
    })
}

fn round_f32(value: f32) -> f64 {
    const DECIMALS: i32 = 6;
    let factor = 10_f64.powi(DECIMALS);
    ((value as f64) * factor).round() / factor
}

pub fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut output = text[..end].to_string();
    output.push_str("...");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_provider() {
        assert_eq!(normalize_provider(None), Provider::OpenAiCompatible);
        assert_eq!(
            normalize_provider(Some("openai_compatible")),
            Provider::OpenAiCompatible
        );
        assert_eq!(normalize_provider(Some("Anthropic")), Provider::Anthropic);
        assert_eq!(normalize_provider(Some("claude")), Provider::Anthropic);
    }

    #[test]
    fn test_normalize_usage() {
        let usage = normalize_usage(Some(&json!({
            "prompt_tokens": 10,
            "completion_tokens": 5,
        })));
        let usage = usage.unwrap();
        assert_eq!(usage.input, 10);
        assert_eq!(usage.output, 5);
        assert_eq!(usage.total, 15);

        assert!(normalize_usage(Some(&json!({}))).is_none());
        assert!(normalize_usage(None).is_none());
    }

    #[test]
    fn test_anthropic_payload_hoists_system() {
        let config = LlmModelConfig {
            provider: Some("anthropic".to_string()),
            model: Some("claude-sonnet-4-20250514".to_string()),
            ..Default::default()
        };
        let client = LlmClient::new(Client::new(), config);
        let messages = vec![
            ChatMessage::new("system", "you are a helper"),
            ChatMessage::new("user", "hi"),
        ];
        let payload = client.build_anthropic_payload(&messages, false);
        assert_eq!(payload["system"], "you are a helper");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
        assert_eq!(payload["max_tokens"], 4096);
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("0123456789ab", 10), "0123456789...");
    }
}
