// Postgres 存储实现：生产环境的分析库，经由 deadpool 连接池访问。
use crate::storage::{
    ConversationRecord, FileOperationRecord, GeneratedToolRecord, MessageRecord, SessionRecord,
    StorageBackend, ToolUsageEventRecord,
};
use anyhow::{anyhow, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

pub struct PostgresStorage {
    pool: Pool,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
    fallback_runtime: tokio::runtime::Runtime,
}

struct PgConn<'a> {
    storage: &'a PostgresStorage,
    client: deadpool_postgres::Client,
}

impl PgConn<'_> {
    fn batch_execute(&mut self, query: &str) -> Result<()> {
        self.storage.block_on(self.client.batch_execute(query))??;
        Ok(())
    }

    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self
            .storage
            .block_on(self.client.execute(query, params))??)
    }

    fn query(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        Ok(self.storage.block_on(self.client.query(query, params))??)
    }

    fn query_one(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<tokio_postgres::Row> {
        Ok(self
            .storage
            .block_on(self.client.query_one(query, params))??)
    }

    fn query_opt(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<tokio_postgres::Row>> {
        Ok(self
            .storage
            .block_on(self.client.query_opt(query, params))??)
    }
}

impl PostgresStorage {
    pub fn new(dsn: String, connect_timeout_s: u64, pool_size: usize) -> Result<Self> {
        let cleaned = dsn.trim().to_string();
        if cleaned.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        let timeout = Duration::from_secs(connect_timeout_s.max(1));
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        config.connect_timeout(timeout);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let pool = Pool::builder(manager)
            .max_size(if pool_size == 0 { 16 } else { pool_size })
            .build()?;
        let fallback_runtime = tokio::runtime::Runtime::new()
            .map_err(|err| anyhow!("create tokio runtime for postgres: {err}"))?;
        Ok(Self {
            pool,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
            fallback_runtime,
        })
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
            Err(_) => Ok(self.fallback_runtime.block_on(fut)),
        }
    }

    fn conn(&self) -> Result<PgConn<'_>> {
        let client = self.block_on(self.pool.get())??;
        Ok(PgConn {
            storage: self,
            client,
        })
    }

    fn row_to_session(row: &tokio_postgres::Row) -> SessionRecord {
        SessionRecord {
            session_id: row.get(0),
            fingerprint: row.get(1),
            environment: row.get(2),
            created_at: row.get(3),
            last_seen_at: row.get(4),
        }
    }

    fn row_to_tool(row: &tokio_postgres::Row) -> GeneratedToolRecord {
        GeneratedToolRecord {
            tool_id: row.get(0),
            session_id: row.get(1),
            conversation_id: row.get(2),
            title: row.get(3),
            content: row.get(4),
            content_hash: row.get(5),
            category: row.get(6),
            agent: row.get(7),
            generation_ms: row.get(8),
            created_at: row.get(9),
        }
    }
}

impl StorageBackend for PostgresStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut conn = self.conn()?;
        conn.batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS user_sessions (
              session_id TEXT PRIMARY KEY,
              fingerprint TEXT NOT NULL,
              environment TEXT NOT NULL,
              created_at DOUBLE PRECISION NOT NULL,
              last_seen_at DOUBLE PRECISION NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_sessions_fingerprint
              ON user_sessions (fingerprint);
            CREATE TABLE IF NOT EXISTS conversations (
              conversation_id TEXT PRIMARY KEY,
              session_id TEXT NOT NULL,
              sequence BIGINT NOT NULL,
              started_at DOUBLE PRECISION NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_session
              ON conversations (session_id, sequence);
            CREATE TABLE IF NOT EXISTS messages (
              id BIGSERIAL PRIMARY KEY,
              conversation_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content_length BIGINT NOT NULL,
              word_count BIGINT NOT NULL,
              response_time_ms DOUBLE PRECISION NOT NULL,
              agent TEXT NOT NULL,
              created_at DOUBLE PRECISION NOT NULL
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
              generation_ms DOUBLE PRECISION NOT NULL,
              created_at DOUBLE PRECISION NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_generated_tools_session
              ON generated_tools (session_id, created_at);
            CREATE TABLE IF NOT EXISTS tool_usage_events (
              id BIGSERIAL PRIMARY KEY,
              tool_id TEXT NOT NULL,
              session_id TEXT NOT NULL,
              event_type TEXT NOT NULL,
              created_at DOUBLE PRECISION NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tool_usage_events_tool
              ON tool_usage_events (tool_id, id);
            CREATE TABLE IF NOT EXISTS file_operations (
              operation_id TEXT PRIMARY KEY,
              session_id TEXT NOT NULL,
              path TEXT NOT NULL,
              state TEXT NOT NULL,
              error TEXT,
              created_at DOUBLE PRECISION NOT NULL,
              updated_at DOUBLE PRECISION NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn get_session_by_fingerprint(&self, fingerprint: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT session_id, fingerprint, environment, created_at, last_seen_at
             FROM user_sessions WHERE fingerprint = $1
             ORDER BY created_at DESC LIMIT 1",
            &[&fingerprint],
        )?;
        Ok(row.as_ref().map(Self::row_to_session))
    }

    fn insert_session(&self, record: &SessionRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_sessions (session_id, fingerprint, environment, created_at, last_seen_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (session_id) DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at",
            &[
                &record.session_id,
                &record.fingerprint,
                &record.environment,
                &record.created_at,
                &record.last_seen_at,
            ],
        )?;
        Ok(())
    }

    fn touch_session(&self, session_id: &str, last_seen_at: f64) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE user_sessions SET last_seen_at = $2 WHERE session_id = $1",
            &[&session_id, &last_seen_at],
        )?;
        Ok(())
    }

    fn create_conversation(&self, session_id: &str, now: f64) -> Result<ConversationRecord> {
        let mut conn = self.conn()?;
        let conversation_id = format!("conv_{}", uuid::Uuid::new_v4().simple());
        // 序号在同一条 INSERT 内计算，并发请求下不会重复。
        let row = conn.query_one(
            "INSERT INTO conversations (conversation_id, session_id, sequence, started_at)
             SELECT $1, $2, COALESCE(MAX(sequence), 0) + 1, $3
             FROM conversations WHERE session_id = $2
             RETURNING sequence",
            &[&conversation_id, &session_id, &now],
        )?;
        let sequence: i64 = row.get(0);
        Ok(ConversationRecord {
            conversation_id,
            session_id: session_id.to_string(),
            sequence,
            started_at: now,
        })
    }

    fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages
             (conversation_id, role, content_length, word_count, response_time_ms, agent, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &record.conversation_id,
                &record.role,
                &record.content_length,
                &record.word_count,
                &record.response_time_ms,
                &record.agent,
                &record.created_at,
            ],
        )?;
        Ok(())
    }

    fn insert_generated_tool(&self, record: &GeneratedToolRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO generated_tools
             (tool_id, session_id, conversation_id, title, content, content_hash,
              category, agent, generation_ms, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (tool_id) DO NOTHING",
            &[
                &record.tool_id,
                &record.session_id,
                &record.conversation_id,
                &record.title,
                &record.content,
                &record.content_hash,
                &record.category,
                &record.agent,
                &record.generation_ms,
                &record.created_at,
            ],
        )?;
        Ok(())
    }

    fn insert_tool_usage_event(&self, record: &ToolUsageEventRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO tool_usage_events (tool_id, session_id, event_type, created_at)
             VALUES ($1, $2, $3, $4)",
            &[
                &record.tool_id,
                &record.session_id,
                &record.event_type,
                &record.created_at,
            ],
        )?;
        Ok(())
    }

    fn list_generated_tools(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<GeneratedToolRecord>> {
        let mut conn = self.conn()?;
        let limit = if limit <= 0 { 100 } else { limit };
        let rows = conn.query(
            "SELECT tool_id, session_id, conversation_id, title, content, content_hash,
                    category, agent, generation_ms, created_at
             FROM generated_tools WHERE session_id = $1
             ORDER BY created_at DESC LIMIT $2",
            &[&session_id, &limit],
        )?;
        Ok(rows.iter().map(Self::row_to_tool).collect())
    }

    fn upsert_file_operation(&self, record: &FileOperationRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO file_operations
             (operation_id, session_id, path, state, error, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (operation_id) DO UPDATE SET
               state = EXCLUDED.state,
               error = EXCLUDED.error,
               updated_at = EXCLUDED.updated_at",
            &[
                &record.operation_id,
                &record.session_id,
                &record.path,
                &record.state,
                &record.error,
                &record.created_at,
                &record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_file_operation(&self, operation_id: &str) -> Result<Option<FileOperationRecord>> {
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT operation_id, session_id, path, state, error, created_at, updated_at
             FROM file_operations WHERE operation_id = $1",
            &[&operation_id],
        )?;
        Ok(row.map(|row| FileOperationRecord {
            operation_id: row.get(0),
            session_id: row.get(1),
            path: row.get(2),
            state: row.get(3),
            error: row.get(4),
            created_at: row.get(5),
            updated_at: row.get(6),
        }))
    }

    fn usage_summary(&self) -> Result<Value> {
        let mut conn = self.conn()?;
        let mut count = |table: &str| -> Result<i64> {
            let row = conn.query_one(&format!("SELECT COUNT(*) FROM {table}"), &[])?;
            Ok(row.get(0))
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
