// 全局状态：配置、存储、各服务实例。
use crate::core::config::Config;
use crate::services::agents::AgentRuntime;
use crate::services::analytics::AnalyticsService;
use crate::services::artifacts::ArtifactStore;
use crate::services::filesystem::FileOperationService;
use crate::storage::{build_storage, SqliteStorage, StorageBackend};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageBackend>,
    pub analytics: AnalyticsService,
    pub artifacts: Arc<ArtifactStore>,
    pub file_ops: Arc<FileOperationService>,
    pub agents: Arc<AgentRuntime>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = init_storage(&config)?;
        let analytics = AnalyticsService::new(storage.clone());
        let artifacts = Arc::new(ArtifactStore::new());
        let file_ops = Arc::new(FileOperationService::new(
            storage.clone(),
            config.mcp.clone(),
            &config.workspace.root,
        ));
        let http = reqwest::Client::new();
        let agents = Arc::new(AgentRuntime::new(&config, http.clone()));
        Ok(Self {
            config: Arc::new(config),
            storage,
            analytics,
            artifacts,
            file_ops,
            agents,
            http,
        })
    }
}

fn init_storage(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.storage.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };

    match backend.as_str() {
        "sqlite" | "default" => init_storage_strict(config),
        "postgres" | "postgresql" | "pg" => init_storage_strict(config).map_err(|err| {
            anyhow!(
                "Postgres 存储初始化失败: {err}（请启动 PostgreSQL 或将 storage.backend 改为 sqlite/auto）"
            )
        }),
        "auto" => init_storage_auto(config),
        other => Err(anyhow!("未知存储后端: {other}")),
    }
}

fn init_storage_strict(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let storage = build_storage(&config.storage)?;
    storage.ensure_initialized()?;
    Ok(storage)
}

fn init_storage_auto(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    // auto 模式：Postgres 不可用时回退 SQLite，保证本地可启动。
    match init_storage_strict(config) {
        Ok(storage) => Ok(storage),
        Err(err) => {
            warn!("Postgres 初始化失败，回退 SQLite: {err}");
            let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(
                config.storage.db_path.trim().to_string(),
            ));
            storage.ensure_initialized()?;
            Ok(storage)
        }
    }
}
