// 工件解析与会话内缓存：从 LLM 输出提取 TITLE/TOOL 结构。
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArtifact {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub artifact_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub content_hash: String,
    pub agent: String,
    pub created_at: f64,
}

/// 会话 → 工件列表的内存缓存，进程生命周期内有效。
#[derive(Default)]
pub struct ArtifactStore {
    by_session: DashMap<String, Vec<StoredArtifact>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, session_id: &str, artifact: StoredArtifact) {
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .push(artifact);
    }

    pub fn list(&self, session_id: &str) -> Vec<StoredArtifact> {
        self.by_session
            .get(session_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }
}

fn title_tool_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)TITLE:\s*(?P<title>[^\r\n]+)\r?\n\s*TOOL:\s*\r?\n?(?P<content>.+)\z")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

/// 解析代理输出。优先 JSON 代码块，其次 TITLE:/TOOL: 文本格式。
pub fn parse_structured_response(text: &str) -> Option<ParsedArtifact> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(parsed) = parse_json_block(trimmed) {
        return Some(parsed);
    }

    let caps = title_tool_regex().captures(trimmed)?;
    let title = caps.name("title")?.as_str().trim().to_string();
    let content = caps.name("content")?.as_str().trim().to_string();
    if title.is_empty() || content.is_empty() {
        return None;
    }
    Some(ParsedArtifact { title, content })
}

fn parse_json_block(text: &str) -> Option<ParsedArtifact> {
    // 代码围栏内或整体即 JSON 都接受。
    let candidate = if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        let end = rest.find("```")?;
        rest[..end].trim()
    } else if text.starts_with('{') {
        text
    } else {
        return None;
    };
    let value: Value = serde_json::from_str(candidate).ok()?;
    let title = value.get("title")?.as_str()?.trim().to_string();
    let content = value
        .get("content")
        .or_else(|| value.get("tool"))?
        .as_str()?
        .trim()
        .to_string();
    if title.is_empty() || content.is_empty() {
        return None;
    }
    Some(ParsedArtifact { title, content })
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// 按标题与内容粗分类，供分析库与前端分组使用。
pub fn categorize(title: &str, content: &str) -> &'static str {
    let haystack = format!("{} {}", title.to_lowercase(), content.to_lowercase());
    if haystack.contains("timer") || haystack.contains("pomodoro") || haystack.contains("stopwatch")
    {
        "time"
    } else if haystack.contains("calculat") || haystack.contains("convert") {
        "math"
    } else if haystack.contains("count") || haystack.contains("text") {
        "text"
    } else if haystack.contains("color") || haystack.contains("colour") {
        "design"
    } else if haystack.contains("game") {
        "game"
    } else {
        "utility"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_tool_round_trip() {
        let parsed = parse_structured_response("TITLE: X\nTOOL:\nY").unwrap();
        assert_eq!(parsed.title, "X");
        assert_eq!(parsed.content, "Y");
    }

    #[test]
    fn test_multiline_tool_body() {
        let text = "TITLE: My Widget\nTOOL:\n<!DOCTYPE html>\n<html><body>hi</body></html>";
        let parsed = parse_structured_response(text).unwrap();
        assert_eq!(parsed.title, "My Widget");
        assert!(parsed.content.starts_with("<!DOCTYPE html>"));
        assert!(parsed.content.ends_with("</html>"));
    }

    #[test]
    fn test_json_block_preferred() {
        let text = "```json\n{\"title\": \"Calc\", \"content\": \"<html></html>\"}\n```";
        let parsed = parse_structured_response(text).unwrap();
        assert_eq!(parsed.title, "Calc");
        assert_eq!(parsed.content, "<html></html>");
    }

    #[test]
    fn test_unstructured_text_is_none() {
        assert!(parse_structured_response("just a normal chat reply").is_none());
        assert!(parse_structured_response("").is_none());
    }

    #[test]
    fn test_content_hash_is_stable() {
        let first = content_hash("abc");
        let second = content_hash("abc");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_ne!(content_hash("abd"), first);
    }

    #[test]
    fn test_categorize() {
        assert_eq!(categorize("Pomodoro Timer", ""), "time");
        assert_eq!(categorize("Calculator", ""), "math");
        assert_eq!(categorize("Word Counter", ""), "text");
        assert_eq!(categorize("Something Else", ""), "utility");
    }

    #[test]
    fn test_store_per_session() {
        let store = ArtifactStore::new();
        store.save(
            "sess_a",
            StoredArtifact {
                artifact_id: "tool_1".to_string(),
                title: "T".to_string(),
                content: "<html></html>".to_string(),
                category: "utility".to_string(),
                content_hash: content_hash("<html></html>"),
                agent: "tinkerer".to_string(),
                created_at: 0.0,
            },
        );
        assert_eq!(store.list("sess_a").len(), 1);
        assert!(store.list("sess_b").is_empty());
    }
}
