//! Orchestration Facade: the stateless public entry point. Resolves the
//! adapter, validates the workflow, fills defaults, and only then enqueues
//! through the execution service.

use std::sync::Arc;
use std::time::Duration;

use crate::adapter::AdapterRegistry;
use crate::config::AppConfig;
use crate::domain::{ExecutionRequest, ExecutionState, Priority, WorkflowDefinition, WorkflowParameters};
use crate::error::{OrkestraError, OrkestraResult};
use crate::events::SharedEventBus;
use crate::queue::QueueSnapshot;
use crate::scheduler::CronScheduler;
use crate::service::{ExecutionService, ServiceMetrics, WorkersStatus};

pub struct OrchestrationFacade {
    config: AppConfig,
    adapters: Arc<AdapterRegistry>,
    service: Arc<ExecutionService>,
    scheduler: Arc<CronScheduler>,
    scheduler_cancel: crate::concurrency::CancelToken,
    events: SharedEventBus,
}

impl OrchestrationFacade {
    pub fn new(config: AppConfig, adapters: Arc<AdapterRegistry>) -> Self {
        let events: SharedEventBus = Arc::new(crate::events::EventBus::default());
        let queue = Arc::new(crate::queue::PriorityQueue::new(config.queue.max_size));
        let service = Arc::new(ExecutionService::new(
            config.clone(),
            queue.clone(),
            events.clone(),
            adapters.clone(),
        ));
        let scheduler = Arc::new(CronScheduler::new(queue, events.clone()));
        Self {
            config,
            adapters,
            service,
            scheduler,
            scheduler_cancel: crate::concurrency::CancelToken::new(),
            events,
        }
    }

    pub fn events(&self) -> SharedEventBus {
        self.events.clone()
    }

    /// Resolves the adapter, validates the workflow, fills defaults, then
    /// enqueues. Returns VALIDATION_FAILED or NO_ADAPTER_REGISTERED without
    /// ever touching the queue.
    pub async fn execute_workflow(
        &self,
        workflow: WorkflowDefinition,
        parameters: WorkflowParameters,
        priority: Option<Priority>,
        timeout: Option<Duration>,
        max_retries: Option<u32>,
    ) -> OrkestraResult<String> {
        workflow
            .validate_structure()
            .map_err(OrkestraError::validation_failed)?;

        let adapter = self.adapters.resolve(workflow.engine_type)?;

        let validation = adapter.validate_workflow(&workflow).await;
        if !validation.is_valid {
            let details = validation
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(OrkestraError::validation_failed("workflow failed adapter validation").with_details(details));
        }

        let mut request = ExecutionRequest::new(workflow, parameters);
        request.priority = priority.unwrap_or_default();
        request.timeout = timeout.unwrap_or(self.config.default_timeout);
        request.max_retries = max_retries.unwrap_or(self.config.fault_tolerance.max_retries);

        self.service.submit_execution(request)
    }

    pub fn schedule_workflow(
        &self,
        cron_expression: impl Into<String>,
        timezone: chrono_tz::Tz,
        workflow: WorkflowDefinition,
        parameters: WorkflowParameters,
        priority: Option<Priority>,
    ) -> OrkestraResult<String> {
        workflow
            .validate_structure()
            .map_err(OrkestraError::validation_failed)?;
        self.adapters.resolve(workflow.engine_type)?;
        self.scheduler.add_schedule(
            cron_expression,
            timezone,
            workflow,
            parameters,
            priority.unwrap_or_default(),
        )
    }

    pub fn unschedule_workflow(&self, schedule_id: &str) -> bool {
        self.scheduler.remove_schedule(schedule_id)
    }

    pub fn cancel_execution(&self, execution_id: &str) -> OrkestraResult<()> {
        self.service.cancel_execution(execution_id)
    }

    pub fn get_execution_status(&self, execution_id: &str) -> OrkestraResult<ExecutionState> {
        self.service.get_execution_status(execution_id)
    }

    pub fn get_execution_result(&self, execution_id: &str) -> OrkestraResult<crate::domain::ExecutionRecord> {
        self.service.get_execution_result(execution_id)
    }

    pub fn get_queue_stats(&self) -> QueueSnapshot {
        self.service.queue_snapshot()
    }

    pub fn get_scheduler_stats(&self) -> Vec<crate::scheduler::Schedule> {
        self.scheduler.list()
    }

    pub fn get_workers_status(&self) -> Vec<WorkersStatus> {
        self.service.get_workers_status()
    }

    pub fn get_execution_metrics(&self) -> ServiceMetrics {
        self.service.get_execution_metrics()
    }

    pub fn start(self: &Arc<Self>) {
        self.service.start();
        let scheduler = self.scheduler.clone();
        let cancel = self.scheduler_cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await });
    }

    pub async fn stop(&self, drain_timeout: Duration) {
        self.scheduler_cancel.cancel();
        self.service.stop(drain_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterCapabilities, AdapterOutcome, CancelOutcome, ValidationIssue, ValidationResult};
    use crate::domain::{EngineType, LogEntry};
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct StrictAdapter;

    #[async_trait]
    impl crate::adapter::Connector for StrictAdapter {
        fn engine_type(&self) -> EngineType {
            EngineType::Airflow
        }
        async fn validate_workflow(&self, workflow: &WorkflowDefinition) -> ValidationResult {
            if workflow.name == "reject-me" {
                ValidationResult::invalid(vec![ValidationIssue {
                    field: "name".into(),
                    message: "blocked".into(),
                    code: "BLOCKED".into(),
                }])
            } else {
                ValidationResult::ok()
            }
        }
        async fn execute_workflow(
            &self,
            _execution_id: &str,
            _workflow: &WorkflowDefinition,
            _parameters: &WorkflowParameters,
            _cancel: crate::concurrency::CancelToken,
        ) -> AdapterOutcome {
            AdapterOutcome::completed(serde_json::json!({}))
        }
        async fn get_execution_status(&self, _execution_id: &str) -> OrkestraResult<AdapterOutcome> {
            Ok(AdapterOutcome::completed(serde_json::json!({})))
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

    fn facade() -> OrchestrationFacade {
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(EngineType::Airflow, Arc::new(StrictAdapter));
        OrchestrationFacade::new(AppConfig::default(), adapters)
    }

    fn workflow(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: None,
            name: name.into(),
            description: None,
            engine_type: EngineType::Airflow,
            definition: serde_json::json!({}),
            version: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn rejects_invalid_workflow_without_enqueuing() {
        let facade = facade();
        let err = facade
            .execute_workflow(workflow("reject-me"), HashMap::new(), None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ValidationFailed);
        assert_eq!(facade.get_queue_stats().total, 0);
    }

    #[tokio::test]
    async fn fails_fast_when_no_adapter_registered() {
        let adapters = Arc::new(AdapterRegistry::new());
        let facade = OrchestrationFacade::new(AppConfig::default(), adapters);
        let err = facade
            .execute_workflow(workflow("ok"), HashMap::new(), None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NoAdapterRegistered);
    }

    #[tokio::test]
    async fn accepted_workflow_is_queued() {
        let facade = facade();
        let id = facade
            .execute_workflow(workflow("ok"), HashMap::new(), None, None, None)
            .await
            .unwrap();
        assert!(!id.is_empty());
    }
}
