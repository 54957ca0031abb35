//! End-to-end scenarios run against a configurable in-process mock adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orkestra_core::adapter::{
    AdapterCapabilities, AdapterOutcome, AdapterRegistry, CancelOutcome, Connector, ValidationResult,
};
use orkestra_core::concurrency::CancelToken;
use orkestra_core::config::AppConfig;
use orkestra_core::domain::{EngineType, ExecutionState, LogEntry, Priority, WorkflowDefinition, WorkflowParameters};
use orkestra_core::error::{ErrorKind, OrkestraError, OrkestraResult};
use orkestra_core::facade::OrchestrationFacade;

/// Mock adapter with a configurable delay, a scripted failure sequence
/// (consumed from the front on each call), and a cancellation latency.
#[derive(Debug)]
struct MockAdapter {
    delay: Duration,
    failures: parking_lot::Mutex<Vec<ErrorKind>>,
    cancel_latency: Duration,
    blocks_forever: bool,
    attempts: AtomicU32,
}

impl MockAdapter {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            failures: parking_lot::Mutex::new(Vec::new()),
            cancel_latency: Duration::from_millis(0),
            blocks_forever: false,
            attempts: AtomicU32::new(0),
        }
    }

    fn with_failures(mut self, failures: Vec<ErrorKind>) -> Self {
        self.failures = parking_lot::Mutex::new(failures);
        self
    }

    fn blocking(mut self, cancel_latency: Duration) -> Self {
        self.blocks_forever = true;
        self.cancel_latency = cancel_latency;
        self
    }
}

#[async_trait]
impl Connector for MockAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Custom(99)
    }

    async fn validate_workflow(&self, _workflow: &WorkflowDefinition) -> ValidationResult {
        ValidationResult::ok()
    }

    async fn execute_workflow(
        &self,
        _execution_id: &str,
        _workflow: &WorkflowDefinition,
        _parameters: &WorkflowParameters,
        cancel: CancelToken,
    ) -> AdapterOutcome {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if self.blocks_forever {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tokio::time::sleep(self.cancel_latency).await;
                    return AdapterOutcome::cancelled();
                }
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            }
        }

        tokio::time::sleep(self.delay).await;

        let next_failure = self.failures.lock().pop();
        match next_failure {
            Some(kind) => AdapterOutcome::failed(OrkestraError::new(kind, "scripted failure")),
            None => AdapterOutcome::completed(serde_json::json!({"ok": true})),
        }
    }

    async fn get_execution_status(&self, _execution_id: &str) -> OrkestraResult<AdapterOutcome> {
        // Mirrors a remote engine still running: the timeout force-fail path
        // polls this and must not see it as terminal.
        Ok(AdapterOutcome {
            state: orkestra_core::domain::ExecutionState::Running,
            result: None,
            error: None,
        })
    }

    async fn get_execution_logs(&self, _execution_id: &str) -> OrkestraResult<Vec<LogEntry>> {
        Ok(Vec::new())
    }

    async fn cancel_execution(&self, _execution_id: &str) -> CancelOutcome {
        CancelOutcome { success: true, message: None }
    }

    async fn test_connection(&self) -> bool {
        true
    }

    fn get_capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }
}

fn workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        id: None,
        name: "scenario-workflow".into(),
        description: None,
        engine_type: EngineType::Custom(99),
        definition: serde_json::json!({}),
        version: None,
        metadata: HashMap::new(),
    }
}

async fn wait_for_terminal(facade: &OrchestrationFacade, id: &str, timeout: Duration) -> Option<ExecutionState> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(state) = facade.get_execution_status(id) {
            if state.is_terminal() {
                return Some(state);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_1_happy_path() {
    let mut config = AppConfig::default();
    config.scaling.min_workers = 2;
    config.scaling.max_workers = 4;
    config.default_timeout = Duration::from_secs(10);

    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(EngineType::Custom(99), Arc::new(MockAdapter::new(Duration::from_millis(50))));

    let facade = Arc::new(OrchestrationFacade::new(config, adapters));
    facade.start();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = facade
            .execute_workflow(workflow(), WorkflowParameters::new(), Some(Priority::Normal), None, None)
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        let state = wait_for_terminal(&facade, id, Duration::from_secs(2)).await;
        assert_eq!(state, Some(ExecutionState::Completed));
    }

    let metrics = facade.get_execution_metrics();
    assert_eq!(metrics.total_executions, 5);
    assert_eq!(metrics.successful_executions, 5);
    assert_eq!(metrics.failed_executions, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_3_retry_then_success() {
    let mut config = AppConfig::default();
    config.scaling.min_workers = 1;
    config.fault_tolerance.max_retries = 2;
    config.fault_tolerance.retry_delay = Duration::from_millis(10);

    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(
        EngineType::Custom(99),
        Arc::new(MockAdapter::new(Duration::from_millis(10)).with_failures(vec![ErrorKind::Network])),
    );

    let facade = Arc::new(OrchestrationFacade::new(config, adapters));
    facade.start();

    let id = facade
        .execute_workflow(workflow(), WorkflowParameters::new(), None, None, None)
        .await
        .unwrap();

    let state = wait_for_terminal(&facade, &id, Duration::from_secs(2)).await;
    assert_eq!(state, Some(ExecutionState::Completed));

    let record = facade.get_execution_result(&id).unwrap();
    assert_eq!(record.retry_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_4_retries_exhausted() {
    let mut config = AppConfig::default();
    config.scaling.min_workers = 1;
    config.fault_tolerance.max_retries = 2;
    config.fault_tolerance.retry_delay = Duration::from_millis(5);

    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(
        EngineType::Custom(99),
        Arc::new(
            MockAdapter::new(Duration::from_millis(5))
                .with_failures(vec![ErrorKind::Network, ErrorKind::Network, ErrorKind::Network]),
        ),
    );

    let facade = Arc::new(OrchestrationFacade::new(config, adapters));
    facade.start();

    let id = facade
        .execute_workflow(workflow(), WorkflowParameters::new(), None, None, None)
        .await
        .unwrap();

    let state = wait_for_terminal(&facade, &id, Duration::from_secs(2)).await;
    assert_eq!(state, Some(ExecutionState::Failed));
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_5_timeout() {
    let mut config = AppConfig::default();
    config.scaling.min_workers = 1;
    config.default_timeout = Duration::from_millis(500);

    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(
        EngineType::Custom(99),
        Arc::new(MockAdapter::new(Duration::ZERO).blocking(Duration::from_millis(50))),
    );

    let facade = Arc::new(OrchestrationFacade::new(config, adapters));
    facade.start();

    let started = tokio::time::Instant::now();
    let id = facade
        .execute_workflow(
            workflow(),
            WorkflowParameters::new(),
            None,
            Some(Duration::from_millis(500)),
            None,
        )
        .await
        .unwrap();

    let state = wait_for_terminal(&facade, &id, Duration::from_secs(2)).await;
    assert_eq!(state, Some(ExecutionState::Failed));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_7_cancellation_while_queued() {
    let mut config = AppConfig::default();
    config.scaling.min_workers = 0;
    config.scaling.max_workers = 1;

    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(EngineType::Custom(99), Arc::new(MockAdapter::new(Duration::from_secs(5))));

    let facade = Arc::new(OrchestrationFacade::new(config, adapters));
    // Intentionally do not start background loops: no worker will ever
    // pick up the request, so it stays queued for the cancel.

    let id = facade
        .execute_workflow(workflow(), WorkflowParameters::new(), None, None, None)
        .await
        .unwrap();

    facade.cancel_execution(&id).unwrap();
    let state = facade.get_execution_status(&id).unwrap();
    assert_eq!(state, ExecutionState::Cancelled);
}
