// 存储模块：封装 SQLite/Postgres 持久化读写，提供统一的会话分析接口。

mod postgres;
mod sqlite;

use crate::core::config::StorageConfig;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;

pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub fingerprint: String,
    pub environment: String,
    pub created_at: f64,
    pub last_seen_at: f64,
}

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub session_id: String,
    pub sequence: i64,
    pub started_at: f64,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub conversation_id: String,
    pub role: String,
    pub content_length: i64,
    pub word_count: i64,
    pub response_time_ms: f64,
    pub agent: String,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct GeneratedToolRecord {
    pub tool_id: String,
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub title: String,
    pub content: String,
    pub content_hash: String,
    pub category: String,
    pub agent: String,
    pub generation_ms: f64,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct ToolUsageEventRecord {
    pub tool_id: String,
    pub session_id: String,
    pub event_type: String,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct FileOperationRecord {
    pub operation_id: String,
    pub session_id: String,
    pub path: String,
    pub state: String,
    pub error: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

/// 存储后端抽象，统一封装会话/对话/消息/工具的持久化读写。
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;
    fn backend_name(&self) -> &'static str;

    fn get_session_by_fingerprint(&self, fingerprint: &str) -> Result<Option<SessionRecord>>;
    fn insert_session(&self, record: &SessionRecord) -> Result<()>;
    fn touch_session(&self, session_id: &str, last_seen_at: f64) -> Result<()>;

    /// 在单条语句内分配会话内递增序号，避免读后写竞争。
    fn create_conversation(&self, session_id: &str, now: f64) -> Result<ConversationRecord>;

    fn insert_message(&self, record: &MessageRecord) -> Result<()>;
    fn insert_generated_tool(&self, record: &GeneratedToolRecord) -> Result<()>;
    fn insert_tool_usage_event(&self, record: &ToolUsageEventRecord) -> Result<()>;
    fn list_generated_tools(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<GeneratedToolRecord>>;

    fn upsert_file_operation(&self, record: &FileOperationRecord) -> Result<()>;
    fn get_file_operation(&self, operation_id: &str) -> Result<Option<FileOperationRecord>>;

    /// 聚合统计，供 /api/database 查询使用。
    fn usage_summary(&self) -> Result<Value>;
}

/// 构建存储后端，根据 backend 配置选择 SQLite/Postgres。
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        "postgres" | "postgresql" | "pg" | "auto" => Ok(Arc::new(PostgresStorage::new(
            config.postgres.dsn.clone(),
            config.postgres.connect_timeout_s,
            config.postgres.pool_size,
        )?)),
        other => Err(anyhow!("未知存储后端: {other}")),
    }
}
