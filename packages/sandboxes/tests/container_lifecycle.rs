// ABOUTME: Integration tests for the container tier against a real Docker daemon
// ABOUTME: Skipped unless Docker is reachable; run with `cargo test -- --ignored`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use runbox_config::EngineSettings;
use runbox_sandboxes::{
    ContainerManager, ExecutionOrchestrator, ExecutionRecord, ExecutionStatus,
    InMemoryExecutionStore, IsolationTier, LanguageProfiles, ResourceLimits, Tool, ToolType,
};
use serde_json::json;

/// Connect to Docker, or `None` when the daemon is unavailable
async fn docker() -> Option<ContainerManager> {
    match ContainerManager::new().await {
        Ok(manager) => Some(manager),
        Err(e) => {
            eprintln!("Skipping: Docker not available ({})", e);
            None
        }
    }
}

async fn setup(manager: ContainerManager) -> ExecutionOrchestrator {
    let settings = EngineSettings {
        container_sandbox_enabled: true,
        stats_interval: Duration::from_millis(200),
        ..Default::default()
    };
    ExecutionOrchestrator::new(Arc::new(InMemoryExecutionStore::new()), settings)
        .with_container_runtime(
            Arc::new(manager),
            Arc::new(LanguageProfiles::builtin().unwrap()),
        )
}

fn container_tool(limits: ResourceLimits) -> Tool {
    Tool {
        id: "sh".to_string(),
        name: "Shell".to_string(),
        tool_type: ToolType::Execution,
        command: "bash".to_string(),
        parameters: Vec::new(),
        resource_limits: limits,
        isolation: IsolationTier::Container,
    }
}

async fn wait_for_terminal(orch: &ExecutionOrchestrator, id: &str) -> ExecutionRecord {
    for _ in 0..600 {
        let record = orch.get_status(id, "tester").await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("execution {} never finished", id);
}

async fn leftover_containers(manager: &ContainerManager, execution_id: &str) -> usize {
    manager
        .list_containers(Some(execution_id))
        .await
        .unwrap()
        .len()
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_shell_script_json_result() {
    let Some(manager) = docker().await else { return };
    let orch = setup(manager.clone()).await;

    let ticket = orch
        .execute(
            &container_tool(ResourceLimits::default()),
            HashMap::from([(
                "code".to_string(),
                json!("echo '{\"answer\": 42}'; echo data > out.txt"),
            )]),
            "tester",
        )
        .await
        .unwrap();

    let record = wait_for_terminal(&orch, &ticket.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Completed, "{:?}", record.error);

    let result = record.result.unwrap();
    assert_eq!(result.value, json!({"answer": 42}));
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].name, "out.txt");

    assert_eq!(leftover_containers(&manager, &ticket.execution_id).await, 0);
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_non_zero_exit_fails() {
    let Some(manager) = docker().await else { return };
    let orch = setup(manager).await;

    let ticket = orch
        .execute(
            &container_tool(ResourceLimits::default()),
            HashMap::from([("code".to_string(), json!("echo oops; exit 3"))]),
            "tester",
        )
        .await
        .unwrap();

    let record = wait_for_terminal(&orch, &ticket.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("process exited with code 3"));
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_container_timeout_cleans_up() {
    let Some(manager) = docker().await else { return };
    let orch = setup(manager.clone()).await;

    let limits = ResourceLimits {
        max_execution_time_ms: Some(1_000),
        ..Default::default()
    };
    let ticket = orch
        .execute(
            &container_tool(limits),
            HashMap::from([("code".to_string(), json!("sleep 60"))]),
            "tester",
        )
        .await
        .unwrap();

    let record = wait_for_terminal(&orch, &ticket.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("timed out"));

    assert_eq!(leftover_containers(&manager, &ticket.execution_id).await, 0);
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_network_is_disabled_by_default() {
    let Some(manager) = docker().await else { return };
    let orch = setup(manager).await;

    let ticket = orch
        .execute(
            &container_tool(ResourceLimits::default()),
            HashMap::from([(
                "code".to_string(),
                json!("wget -q -T 2 -O - http://example.com >/dev/null"),
            )]),
            "tester",
        )
        .await
        .unwrap();

    let record = wait_for_terminal(&orch, &ticket.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
}
