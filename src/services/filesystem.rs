// 文件操作审批流：pending -> approved -> executing -> completed / rejected。
use crate::core::config::McpConfig;
use crate::services::mcp;
use crate::storage::{FileOperationRecord, StorageBackend};
use anyhow::{anyhow, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperationState {
    Pending,
    Approved,
    Executing,
    Completed,
    Rejected,
}

impl FileOperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperationState::Pending => "pending",
            FileOperationState::Approved => "approved",
            FileOperationState::Executing => "executing",
            FileOperationState::Completed => "completed",
            FileOperationState::Rejected => "rejected",
        }
    }

    /// 合法迁移边。executing 只能由 approved 进入。
    pub fn can_transition(&self, next: FileOperationState) -> bool {
        use FileOperationState::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Executing) | (Executing, Completed)
        )
    }
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub operation_id: String,
    pub session_id: String,
    pub path: String,
    pub content: String,
    pub state: FileOperationState,
    pub created_at: f64,
}

pub struct FileOperationService {
    pending: DashMap<String, PendingOperation>,
    storage: Arc<dyn StorageBackend>,
    mcp: McpConfig,
    workspace_root: PathBuf,
}

fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl FileOperationService {
    pub fn new(storage: Arc<dyn StorageBackend>, mcp: McpConfig, workspace_root: &str) -> Self {
        Self {
            pending: DashMap::new(),
            storage,
            mcp,
            workspace_root: PathBuf::from(workspace_root),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// 登记一次待审批的写入，返回操作编号。
    pub fn propose(&self, session_id: &str, filename: &str, content: &str) -> Result<String> {
        let relative = sanitize_relative_path(filename)?;
        let operation_id = format!("fop_{}", uuid::Uuid::new_v4().simple());
        let now = now_epoch();
        let operation = PendingOperation {
            operation_id: operation_id.clone(),
            session_id: session_id.to_string(),
            path: relative,
            content: content.to_string(),
            state: FileOperationState::Pending,
            created_at: now,
        };
        self.persist(&operation, None, now);
        self.pending.insert(operation_id.clone(), operation);
        Ok(operation_id)
    }

    /// 审批并执行写入。失败时记录错误但保留 executing 状态供排查。
    pub async fn approve_and_execute(&self, operation_id: &str) -> Result<PendingOperation> {
        let mut operation = self
            .pending
            .get(operation_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| anyhow!("文件操作不存在: {operation_id}"))?;
        self.transition(&mut operation, FileOperationState::Approved)?;
        self.transition(&mut operation, FileOperationState::Executing)?;

        let result = self.execute_write(&operation).await;
        match result {
            Ok(()) => {
                self.transition(&mut operation, FileOperationState::Completed)?;
                self.pending.remove(operation_id);
                Ok(operation)
            }
            Err(err) => {
                warn!("文件写入失败: {operation_id}, {err}");
                let now = now_epoch();
                self.persist(&operation, Some(err.to_string()), now);
                self.pending.insert(operation_id.to_string(), operation);
                Err(err)
            }
        }
    }

    /// 拒绝一次写入。
    pub fn reject(&self, operation_id: &str) -> Result<PendingOperation> {
        let mut operation = self
            .pending
            .get(operation_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| anyhow!("文件操作不存在: {operation_id}"))?;
        self.transition(&mut operation, FileOperationState::Rejected)?;
        self.pending.remove(operation_id);
        Ok(operation)
    }

    pub fn get(&self, operation_id: &str) -> Option<PendingOperation> {
        self.pending.get(operation_id).map(|entry| entry.clone())
    }

    /// 将 serve 路由的相对路径解析到工作区内，拒绝越界访问。
    pub fn resolve_serve_path(&self, relative: &str) -> Result<PathBuf> {
        let cleaned = sanitize_relative_path(relative)?;
        Ok(self.workspace_root.join(cleaned))
    }

    fn transition(
        &self,
        operation: &mut PendingOperation,
        next: FileOperationState,
    ) -> Result<()> {
        if !operation.state.can_transition(next) {
            return Err(anyhow!(
                "非法状态迁移: {} -> {}",
                operation.state.as_str(),
                next.as_str()
            ));
        }
        operation.state = next;
        let now = now_epoch();
        self.persist(operation, None, now);
        if let Some(mut entry) = self.pending.get_mut(&operation.operation_id) {
            entry.state = next;
        }
        Ok(())
    }

    async fn execute_write(&self, operation: &PendingOperation) -> Result<()> {
        // 优先走 MCP filesystem 服务，未配置时直接写工作区。
        if let Some(result) = mcp::write_file(&self.mcp, &operation.path, &operation.content).await
        {
            return result.map(|_| ());
        }
        let target = self.workspace_root.join(&operation.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, operation.content.as_bytes()).await?;
        Ok(())
    }

    fn persist(&self, operation: &PendingOperation, error: Option<String>, now: f64) {
        let record = FileOperationRecord {
            operation_id: operation.operation_id.clone(),
            session_id: operation.session_id.clone(),
            path: operation.path.clone(),
            state: operation.state.as_str().to_string(),
            error,
            created_at: operation.created_at,
            updated_at: now,
        };
        if let Err(err) = self.storage.upsert_file_operation(&record) {
            warn!("记录文件操作状态失败: {err}");
        }
    }
}

/// 规范化相对路径：剥掉前导分隔符，拒绝 `..` 与绝对路径。
fn sanitize_relative_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_start_matches(['/', '\\']);
    if trimmed.is_empty() {
        return Err(anyhow!("文件路径不能为空"));
    }
    let path = Path::new(trimmed);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(anyhow!("文件路径不合法: {raw}")),
        }
    }
    Ok(trimmed.replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> FileOperationService {
        let storage = Arc::new(SqliteStorage::new(
            dir.path().join("test.db").to_string_lossy().to_string(),
        ));
        storage.ensure_initialized().unwrap();
        FileOperationService::new(
            storage,
            McpConfig::default(),
            &dir.path().join("workspace").to_string_lossy(),
        )
    }

    #[test]
    fn test_executing_unreachable_without_approved() {
        use FileOperationState::*;
        assert!(!Pending.can_transition(Executing));
        assert!(!Rejected.can_transition(Executing));
        assert!(!Completed.can_transition(Executing));
        assert!(Pending.can_transition(Approved));
        assert!(Approved.can_transition(Executing));
        assert!(Executing.can_transition(Completed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_propose_then_execute_writes_file() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let operation_id = service
            .propose("sess_1", "tools/widget.html", "<html></html>")
            .unwrap();
        let done = service.approve_and_execute(&operation_id).await.unwrap();
        assert_eq!(done.state, FileOperationState::Completed);
        let written = std::fs::read_to_string(
            dir.path().join("workspace").join("tools/widget.html"),
        )
        .unwrap();
        assert_eq!(written, "<html></html>");
        // 执行完成后从待审批表移除
        assert!(service.get(&operation_id).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reject_removes_operation() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let operation_id = service.propose("sess_1", "a.html", "x").unwrap();
        let rejected = service.reject(&operation_id).unwrap();
        assert_eq!(rejected.state, FileOperationState::Rejected);
        assert!(service.get(&operation_id).is_none());
        assert!(!dir.path().join("workspace").join("a.html").exists());
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert!(sanitize_relative_path("../etc/passwd").is_err());
        assert!(sanitize_relative_path("a/../../b").is_err());
        assert!(sanitize_relative_path("").is_err());
        assert_eq!(sanitize_relative_path("/tools/a.html").unwrap(), "tools/a.html");
    }
}
