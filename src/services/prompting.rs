// 提示词模板：Noah 主对话、Wanderer 调研、Tinkerer 构建。
use crate::core::schemas::HistoryMessage;
use crate::services::llm::ChatMessage;

pub const NOAH_SYSTEM_PROMPT: &str = "You are Noah, a thoughtful conversational assistant living \
inside a web page. You answer plainly and concretely, keep replies short unless the user asks \
for depth, and never invent facts. When the user wants an interactive tool built, other parts \
of the system handle that; you handle conversation.";

pub const WANDERER_SYSTEM_PROMPT: &str = "You are Wanderer, Noah's research agent. Investigate \
the user's question and produce a compact, well-organized summary of the relevant facts, \
trade-offs, and concrete details a builder would need. Plain text only. No code, no HTML. \
Do not pad with caveats.";

pub const TINKERER_SYSTEM_PROMPT: &str = "You are Tinkerer, Noah's build agent. Produce one \
complete, self-contained HTML document implementing the tool the user asked for. Inline all \
CSS and JavaScript. No external resources. Respond in EXACTLY this format and nothing else:\n\
TITLE: <short human-readable tool name>\n\
TOOL:\n\
<the complete HTML document>";

pub const CLARIFY_SYSTEM_PROMPT: &str = "You are Noah. The user's request is ambiguous: it is \
unclear whether they want a conversation, research, or a tool built. Ask one short clarifying \
question that helps them pick. Do not answer the request itself.";

/// 组装对话消息：系统提示 + 截断后的历史 + 当前输入。
pub fn build_chat_messages(
    system_prompt: &str,
    history: &[HistoryMessage],
    user_message: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new("system", system_prompt));
    // 只保留最近 20 条，控制上下文长度。
    let start = history.len().saturating_sub(20);
    for item in &history[start..] {
        let role = match item.role.as_str() {
            "assistant" => "assistant",
            _ => "user",
        };
        if !item.content.trim().is_empty() {
            messages.push(ChatMessage::new(role, item.content.clone()));
        }
    }
    messages.push(ChatMessage::new("user", user_message));
    messages
}

/// Tinkerer 的用户消息：可携带 Wanderer 的调研结果作为上下文。
pub fn build_tinkerer_request(user_message: &str, research_context: Option<&str>) -> String {
    match research_context {
        Some(context) if !context.trim().is_empty() => {
            format!("{user_message}\n\nResearch notes to ground the build:\n{context}")
        }
        _ => user_message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_chat_messages_truncates_history() {
        let history: Vec<HistoryMessage> = (0..30)
            .map(|index| HistoryMessage {
                role: if index % 2 == 0 { "user" } else { "assistant" }.to_string(),
                content: format!("message {index}"),
            })
            .collect();
        let messages = build_chat_messages(NOAH_SYSTEM_PROMPT, &history, "hello");
        // system + 20 条历史 + 当前输入
        assert_eq!(messages.len(), 22);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("hello"));
    }

    #[test]
    fn test_build_tinkerer_request_with_context() {
        let plain = build_tinkerer_request("build a timer", None);
        assert_eq!(plain, "build a timer");
        let with_context = build_tinkerer_request("build a timer", Some("timers use setInterval"));
        assert!(with_context.contains("Research notes"));
        assert!(with_context.contains("setInterval"));
    }
}
