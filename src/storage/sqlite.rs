// SQLite 存储实现：本地/开发环境的默认分析库。
use crate::storage::{
    ConversationRecord, FileOperationRecord, GeneratedToolRecord, MessageRecord, SessionRecord,
    StorageBackend, ToolUsageEventRecord,
};
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/noah.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn row_to_tool(row: &rusqlite::Row<'_>) -> rusqlite::Result<GeneratedToolRecord> {
        Ok(GeneratedToolRecord {
            tool_id: row.get(0)?,
            session_id: row.get(1)?,
            conversation_id: row.get(2)?,
            title: row.get(3)?,
            content: row.get(4)?,
            content_hash: row.get(5)?,
            category: row.get(6)?,
            agent: row.get(7)?,
            generation_ms: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_sessions (
              session_id TEXT PRIMARY KEY,
              fingerprint TEXT NOT NULL,
              environment TEXT NOT NULL,
              created_at REAL NOT NULL,
              last_seen_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_sessions_fingerprint
              ON user_sessions (fingerprint);
            CREATE TABLE IF NOT EXISTS conversations (
              conversation_id TEXT PRIMARY KEY,
              session_id TEXT NOT NULL,
              sequence INTEGER NOT NULL,
              started_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_session
              ON conversations (session_id, sequence);
            CREATE TABLE IF NOT EXISTS messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              conversation_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content_length INTEGER NOT NULL,
              word_count INTEGER NOT NULL,
              response_time_ms REAL NOT NULL,
              agent TEXT NOT NULL,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
              ON messages (conversation_id, id);
            CREATE TABLE IF NOT EXISTS generated_tools (
              tool_id TEXT PRIMARY KEY,
              session_id TEXT NOT NULL,
              conversation_id TEXT,
              title TEXT NOT NULL,
              content TEXT NOT NULL,
              content_hash TEXT NOT NULL,
              category TEXT NOT NULL,
              agent TEXT NOT NULL,
              generation_ms REAL NOT NULL,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_generated_tools_session
              ON generated_tools (session_id, created_at);
            CREATE TABLE IF NOT EXISTS tool_usage_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              tool_id TEXT NOT NULL,
              session_id TEXT NOT NULL,
              event_type TEXT NOT NULL,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tool_usage_events_tool
              ON tool_usage_events (tool_id, id);
            CREATE TABLE IF NOT EXISTS file_operations (
              operation_id TEXT PRIMARY KEY,
              session_id TEXT NOT NULL,
              path TEXT NOT NULL,
              state TEXT NOT NULL,
              error TEXT,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn get_session_by_fingerprint(&self, fingerprint: &str) -> Result<Option<SessionRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT session_id, fingerprint, environment, created_at, last_seen_at
                 FROM user_sessions WHERE fingerprint = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![fingerprint],
                |row| {
                    Ok(SessionRecord {
                        session_id: row.get(0)?,
                        fingerprint: row.get(1)?,
                        environment: row.get(2)?,
                        created_at: row.get(3)?,
                        last_seen_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn insert_session(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO user_sessions
             (session_id, fingerprint, environment, created_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.session_id,
                record.fingerprint,
                record.environment,
                record.created_at,
                record.last_seen_at,
            ],
        )?;
        Ok(())
    }

    fn touch_session(&self, session_id: &str, last_seen_at: f64) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE user_sessions SET last_seen_at = ?2 WHERE session_id = ?1",
            params![session_id, last_seen_at],
        )?;
        Ok(())
    }

    fn create_conversation(&self, session_id: &str, now: f64) -> Result<ConversationRecord> {
        let conn = self.open()?;
        let conversation_id = format!("conv_{}", uuid::Uuid::new_v4().simple());
        // 序号在同一条 INSERT 内计算，并发请求下不会重复。
        conn.execute(
            "INSERT INTO conversations (conversation_id, session_id, sequence, started_at)
             VALUES (?1, ?2,
               (SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversations WHERE session_id = ?2),
               ?3)",
            params![conversation_id, session_id, now],
        )?;
        let sequence: i64 = conn.query_row(
            "SELECT sequence FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(ConversationRecord {
            conversation_id,
            session_id: session_id.to_string(),
            sequence,
            started_at: now,
        })
    }

    fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO messages
             (conversation_id, role, content_length, word_count, response_time_ms, agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.conversation_id,
                record.role,
                record.content_length,
                record.word_count,
                record.response_time_ms,
                record.agent,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    fn insert_generated_tool(&self, record: &GeneratedToolRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO generated_tools
             (tool_id, session_id, conversation_id, title, content, content_hash,
              category, agent, generation_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.tool_id,
                record.session_id,
                record.conversation_id,
                record.title,
                record.content,
                record.content_hash,
                record.category,
                record.agent,
                record.generation_ms,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    fn insert_tool_usage_event(&self, record: &ToolUsageEventRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO tool_usage_events (tool_id, session_id, event_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.tool_id,
                record.session_id,
                record.event_type,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    fn list_generated_tools(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<GeneratedToolRecord>> {
        let conn = self.open()?;
        let limit = if limit <= 0 { 100 } else { limit };
        let mut statement = conn.prepare(
            "SELECT tool_id, session_id, conversation_id, title, content, content_hash,
                    category, agent, generation_ms, created_at
             FROM generated_tools WHERE session_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = statement.query_map(params![session_id, limit], Self::row_to_tool)?;
        let mut output = Vec::new();
        for row in rows {
            output.push(row?);
        }
        Ok(output)
    }

    fn upsert_file_operation(&self, record: &FileOperationRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO file_operations
             (operation_id, session_id, path, state, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.operation_id,
                record.session_id,
                record.path,
                record.state,
                record.error,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_file_operation(&self, operation_id: &str) -> Result<Option<FileOperationRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT operation_id, session_id, path, state, error, created_at, updated_at
                 FROM file_operations WHERE operation_id = ?1",
                params![operation_id],
                |row| {
                    Ok(FileOperationRecord {
                        operation_id: row.get(0)?,
                        session_id: row.get(1)?,
                        path: row.get(2)?,
                        state: row.get(3)?,
                        error: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn usage_summary(&self) -> Result<Value> {
        let conn = self.open()?;
        let count = |table: &str| -> Result<i64> {
            let value: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
            Ok(value)
        };
        Ok(json!({
            "sessions": count("user_sessions")?,
            "conversations": count("conversations")?,
            "messages": count("messages")?,
            "generated_tools": count("generated_tools")?,
            "tool_usage_events": count("tool_usage_events")?,
        }))
    }
}
