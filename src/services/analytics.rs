// 会话分析：指纹换会话、对话序号、消息与工具落库。写入全部火忘。
use crate::storage::{
    ConversationRecord, GeneratedToolRecord, MessageRecord, SessionRecord, StorageBackend,
    ToolUsageEventRecord,
};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Clone)]
pub struct AnalyticsService {
    storage: Arc<dyn StorageBackend>,
}

impl AnalyticsService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// 按指纹取会话，不存在则创建。这一步失败会向上传播，
    /// 因为后续落库都挂在会话编号上。
    pub fn ensure_session(&self, fingerprint: &str, environment: &str) -> Result<SessionRecord> {
        let now = now_epoch();
        if let Some(existing) = self.storage.get_session_by_fingerprint(fingerprint)? {
            self.storage.touch_session(&existing.session_id, now)?;
            return Ok(SessionRecord {
                last_seen_at: now,
                ..existing
            });
        }
        let record = SessionRecord {
            session_id: format!("sess_{}", uuid::Uuid::new_v4().simple()),
            fingerprint: fingerprint.to_string(),
            environment: environment.to_string(),
            created_at: now,
            last_seen_at: now,
        };
        self.storage.insert_session(&record)?;
        Ok(record)
    }

    pub fn start_conversation(&self, session_id: &str) -> Result<ConversationRecord> {
        self.storage.create_conversation(session_id, now_epoch())
    }

    /// 记录一条消息的统计信息，不落原文。火忘。
    pub fn log_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        response_time_ms: f64,
        agent: &str,
    ) {
        let record = MessageRecord {
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content_length: content.chars().count() as i64,
            word_count: word_count(content) as i64,
            response_time_ms,
            agent: agent.to_string(),
            created_at: now_epoch(),
        };
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = storage.insert_message(&record) {
                warn!("记录消息统计失败: {err}");
            }
        });
    }

    /// 记录生成的工具。火忘。
    #[allow(clippy::too_many_arguments)]
    pub fn log_generated_tool(
        &self,
        tool_id: &str,
        session_id: &str,
        conversation_id: Option<&str>,
        title: &str,
        content: &str,
        content_hash: &str,
        category: &str,
        agent: &str,
        generation_ms: f64,
    ) {
        let record = GeneratedToolRecord {
            tool_id: tool_id.to_string(),
            session_id: session_id.to_string(),
            conversation_id: conversation_id.map(str::to_string),
            title: title.to_string(),
            content: content.to_string(),
            content_hash: content_hash.to_string(),
            category: category.to_string(),
            agent: agent.to_string(),
            generation_ms,
            created_at: now_epoch(),
        };
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = storage.insert_generated_tool(&record) {
                warn!("记录生成工具失败: {err}");
            }
        });
    }

    /// 记录前端上报的工具使用事件。火忘。
    pub fn log_tool_usage(&self, tool_id: &str, session_id: &str, event_type: &str) {
        let record = ToolUsageEventRecord {
            tool_id: tool_id.to_string(),
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            created_at: now_epoch(),
        };
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = storage.insert_tool_usage_event(&record) {
                warn!("记录工具使用事件失败: {err}");
            }
        });
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use tempfile::TempDir;

    fn analytics(dir: &TempDir) -> AnalyticsService {
        let storage = Arc::new(SqliteStorage::new(
            dir.path().join("test.db").to_string_lossy().to_string(),
        ));
        storage.ensure_initialized().unwrap();
        AnalyticsService::new(storage)
    }

    #[test]
    fn test_ensure_session_reuses_fingerprint() {
        let dir = TempDir::new().unwrap();
        let analytics = analytics(&dir);
        let first = analytics.ensure_session("fp_abc", "desktop").unwrap();
        let second = analytics.ensure_session("fp_abc", "desktop").unwrap();
        assert_eq!(first.session_id, second.session_id);
        let other = analytics.ensure_session("fp_xyz", "mobile").unwrap();
        assert_ne!(first.session_id, other.session_id);
    }

    #[test]
    fn test_conversation_sequence_increments() {
        let dir = TempDir::new().unwrap();
        let analytics = analytics(&dir);
        let session = analytics.ensure_session("fp_abc", "desktop").unwrap();
        let first = analytics.start_conversation(&session.session_id).unwrap();
        let second = analytics.start_conversation(&session.session_id).unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        // 其它会话独立计数
        let other = analytics.ensure_session("fp_xyz", "mobile").unwrap();
        let fresh = analytics.start_conversation(&other.session_id).unwrap();
        assert_eq!(fresh.sequence, 1);
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count("one two  three"), 3);
        assert_eq!(word_count(""), 0);
    }
}
