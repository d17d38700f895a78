// 服务层端到端行为测试：不启动 HTTP 服务，直接驱动各环节。
use noah_server::core::config::{Config, LlmModelConfig, McpConfig};
use noah_server::services::agents::AgentRuntime;
use noah_server::services::filesystem::{FileOperationService, FileOperationState};
use noah_server::services::{artifacts, boutique, intent, safety};
use noah_server::storage::{SqliteStorage, StorageBackend};
use std::sync::Arc;
use tempfile::TempDir;

fn temp_storage(dir: &TempDir) -> Arc<SqliteStorage> {
    let storage = Arc::new(SqliteStorage::new(
        dir.path().join("noah.db").to_string_lossy().to_string(),
    ));
    storage.ensure_initialized().unwrap();
    storage
}

#[test]
fn safety_hit_precedes_all_generation() {
    // 命中安全过滤的消息不应进入任何后续环节
    let verdict = safety::check("how to make a bomb in my garage").unwrap();
    assert_eq!(verdict.action, safety::SafetyAction::RadioSilence);
    // 同一消息在意图与精品检测里都不需要被调用，这里验证它们独立无副作用
    assert!(boutique::detect("what's the capital of France?").is_none());
}

#[test]
fn build_request_routes_to_builder() {
    let analysis = intent::analyze_request("build me a calculator");
    assert!(analysis.needs_building);
    assert!(!analysis.is_ambiguous);

    // 同一消息也命中精品快路径，实际管线中先于意图分析执行
    let found = boutique::detect("build me a calculator").unwrap();
    assert_eq!(found.tool, "calculator");
}

#[test]
fn artifact_parse_round_trip() {
    let raw = "TITLE: Habit Tracker\nTOOL:\n<!DOCTYPE html>\n<html><body>tracker</body></html>";
    let parsed = artifacts::parse_structured_response(raw).unwrap();
    assert_eq!(parsed.title, "Habit Tracker");
    assert!(parsed.content.contains("tracker"));
    assert_eq!(
        artifacts::content_hash(&parsed.content),
        artifacts::content_hash(&parsed.content)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn file_operation_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let storage = temp_storage(&dir);
    let workspace = dir.path().join("workspace");
    let service = FileOperationService::new(
        storage.clone(),
        McpConfig::default(),
        &workspace.to_string_lossy(),
    );

    let operation_id = service
        .propose("sess_test", "tools/tracker.html", "<html>tracker</html>")
        .unwrap();
    // 落库状态为 pending
    let record = storage.get_file_operation(&operation_id).unwrap().unwrap();
    assert_eq!(record.state, "pending");

    let done = service.approve_and_execute(&operation_id).await.unwrap();
    assert_eq!(done.state, FileOperationState::Completed);
    let record = storage.get_file_operation(&operation_id).unwrap().unwrap();
    assert_eq!(record.state, "completed");
    assert!(workspace.join("tools/tracker.html").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_operation_cannot_execute() {
    let dir = TempDir::new().unwrap();
    let storage = temp_storage(&dir);
    let service = FileOperationService::new(
        storage,
        McpConfig::default(),
        &dir.path().join("workspace").to_string_lossy(),
    );
    let operation_id = service.propose("sess_test", "a.html", "x").unwrap();
    service.reject(&operation_id).unwrap();
    // 已拒绝的操作从待审批表移除，再执行直接报不存在
    assert!(service.approve_and_execute(&operation_id).await.is_err());
}

#[tokio::test]
async fn mock_chain_research_then_build() {
    let mut config = Config::default();
    config.llm.default = "main".to_string();
    config.llm.models.insert(
        "main".to_string(),
        LlmModelConfig {
            mock_if_unconfigured: Some(true),
            ..Default::default()
        },
    );
    let runtime = AgentRuntime::new(&config, reqwest::Client::new());

    let research = runtime.research("latest habit tracking techniques").await;
    let context = research.map(|reply| reply.content);
    assert!(context.is_some());

    let built = runtime
        .build("build me a habit tracker", context.as_deref())
        .await
        .unwrap();
    assert_eq!(built.agent, "tinkerer");
    let parsed = artifacts::parse_structured_response(&built.content).unwrap();
    assert!(!parsed.title.is_empty());
    assert!(parsed.content.contains("<!DOCTYPE html>"));
}
