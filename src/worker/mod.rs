//! A worker owns at most `capacity` in-flight executions at a time. It
//! accepts one request from the dispatcher, drives it through the adapter
//! under the retry driver and circuit breaker, and enforces the deadline.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::adapter::Connector;
use crate::concurrency::CancelToken;
use crate::domain::{EngineType, ExecutionRecord, ExecutionRequest, ExecutionState, WorkerStatus};
use crate::error::{ErrorKind, OrkestraError};
use crate::resilience::{retry_with_backoff, CircuitBreaker, RetryConfig};

/// Grace period after the deadline during which the worker waits for the
/// adapter to observe cancellation before forcing a FAILED terminal state.
const DEFAULT_GRACE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerTotals {
    pub executions: u64,
    pub failures: u64,
}

/// Bookkeeping owned by a single worker. Cloning shares the underlying
/// counters; the dispatcher holds one `Arc<Worker>` per pool slot.
pub struct Worker {
    id: String,
    capacity: u32,
    engine_types: Vec<EngineType>,
    status: Mutex<WorkerStatus>,
    current_load: AtomicU32,
    last_heartbeat_millis: AtomicU64,
    started_at: Instant,
    total_executions: AtomicU64,
    total_failures: AtomicU64,
    running_avg_ms: Mutex<f64>,
    grace_interval: Duration,
    root_cancel: CancelToken,
}

impl Worker {
    pub fn new(id: impl Into<String>, capacity: u32, engine_types: Vec<EngineType>) -> Self {
        let worker = Self {
            id: id.into(),
            capacity,
            engine_types,
            status: Mutex::new(WorkerStatus::Created),
            current_load: AtomicU32::new(0),
            last_heartbeat_millis: AtomicU64::new(0),
            started_at: Instant::now(),
            total_executions: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            running_avg_ms: Mutex::new(0.0),
            grace_interval: DEFAULT_GRACE_INTERVAL,
            root_cancel: CancelToken::new(),
        };
        worker.tick_heartbeat();
        *worker.status.lock() = WorkerStatus::Idle;
        worker
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn engine_types(&self) -> &[EngineType] {
        &self.engine_types
    }

    pub fn serves(&self, engine_type: EngineType) -> bool {
        self.engine_types.iter().any(|e| *e == engine_type)
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    pub fn current_load(&self) -> u32 {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn has_capacity(&self) -> bool {
        self.status() == WorkerStatus::Idle && self.current_load() < self.capacity
    }

    /// Wall-clock time since this worker was spawned.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn totals(&self) -> WorkerTotals {
        WorkerTotals {
            executions: self.total_executions.load(Ordering::Relaxed),
            failures: self.total_failures.load(Ordering::Relaxed),
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let totals = self.totals();
        if totals.executions == 0 {
            0.0
        } else {
            totals.failures as f64 / totals.executions as f64
        }
    }

    pub fn running_average_ms(&self) -> f64 {
        *self.running_avg_ms.lock()
    }

    pub fn tick_heartbeat(&self) {
        let millis = self.started_at.elapsed().as_millis() as u64;
        self.last_heartbeat_millis.store(millis, Ordering::Relaxed);
    }

    /// Age of the last heartbeat. A background health check compares this
    /// against the configured staleness bound to declare a worker DEAD.
    pub fn heartbeat_age(&self) -> Duration {
        let now_millis = self.started_at.elapsed().as_millis() as u64;
        let last = self.last_heartbeat_millis.load(Ordering::Relaxed);
        Duration::from_millis(now_millis.saturating_sub(last))
    }

    pub fn mark_draining(&self) {
        *self.status.lock() = WorkerStatus::Draining;
    }

    pub fn mark_dead(&self) {
        *self.status.lock() = WorkerStatus::Dead;
        self.root_cancel.cancel();
    }

    /// True once a DRAINING worker has no in-flight executions and may be
    /// transitioned to DEAD and removed from the pool.
    pub fn drained(&self) -> bool {
        self.status() == WorkerStatus::Draining && self.current_load() == 0
    }

    pub fn root_cancel_token(&self) -> CancelToken {
        self.root_cancel.clone()
    }

    /// Runs one execution end to end: RUNNING -> terminal. Never returns a
    /// non-terminal record. Delegates adapter calls through `retry_config`
    /// and `breaker`; enforces `request.timeout` plus the grace interval.
    #[instrument(skip_all, fields(worker_id = %self.id, execution_id = %request.id))]
    pub async fn run_execution(
        &self,
        request: &ExecutionRequest,
        adapter: Arc<dyn Connector>,
        breaker: Arc<CircuitBreaker>,
        retry_config: &RetryConfig,
        cancel: CancelToken,
    ) -> ExecutionRecord {
        self.current_load.fetch_add(1, Ordering::Relaxed);
        *self.status.lock() = WorkerStatus::Busy;
        self.tick_heartbeat();

        let mut record = ExecutionRecord::pending(request.id.clone());
        record.state = ExecutionState::Running;
        record.started_at = Some(SystemTime::now());
        record.owning_worker = Some(self.id.clone());

        let execution_cancel = cancel;
        let started = Instant::now();

        let outcome = tokio::select! {
            result = self.drive_adapter(request, adapter.clone(), breaker, retry_config, execution_cancel.clone()) => result,
            _ = tokio::time::sleep(request.timeout) => {
                warn!("execution deadline elapsed, asserting cancellation");
                execution_cancel.cancel();
                self.await_unwind_or_force_fail(adapter, request, execution_cancel).await
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        record.ended_at = Some(SystemTime::now());
        record.metrics.duration_ms = Some(elapsed_ms);
        self.update_running_average(elapsed_ms);

        self.total_executions.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok((value, retry_count)) => {
                record.state = ExecutionState::Completed;
                record.result = Some(value);
                record.retry_count = retry_count;
            }
            Err(OrkestraOutcome::Cancelled) => {
                record.state = ExecutionState::Cancelled;
            }
            Err(OrkestraOutcome::Failed(err, retry_count)) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                record.state = ExecutionState::Failed;
                record.error = Some(err);
                record.retry_count = retry_count;
            }
        }

        self.current_load.fetch_sub(1, Ordering::Relaxed);
        *self.status.lock() = WorkerStatus::Idle;
        self.tick_heartbeat();
        info!(state = ?record.state, duration_ms = elapsed_ms, "execution finished");
        record
    }

    async fn drive_adapter(
        &self,
        request: &ExecutionRequest,
        adapter: Arc<dyn Connector>,
        breaker: Arc<CircuitBreaker>,
        retry_config: &RetryConfig,
        cancel: CancelToken,
    ) -> Result<(serde_json::Value, u32), OrkestraOutcome> {
        let workflow = request.workflow.clone();
        let parameters = request.parameters.clone();
        let execution_id = request.id.clone();
        let last_attempt = Arc::new(AtomicU32::new(0));
        let last_attempt_inner = last_attempt.clone();

        let result = retry_with_backoff(retry_config, move |attempt| {
            last_attempt_inner.store(attempt, Ordering::Relaxed);
            let adapter = adapter.clone();
            let breaker = breaker.clone();
            let workflow = workflow.clone();
            let parameters = parameters.clone();
            let cancel = cancel.clone();
            let execution_id = execution_id.clone();
            async move {
                breaker
                    .execute(|| async {
                        let outcome = adapter
                            .execute_workflow(&execution_id, &workflow, &parameters, cancel.clone())
                            .await;
                        match outcome.state {
                            ExecutionState::Completed => {
                                Ok(outcome.result.unwrap_or(serde_json::Value::Null))
                            }
                            ExecutionState::Cancelled => {
                                Err(OrkestraError::new(ErrorKind::Shutdown, "execution cancelled"))
                            }
                            _ => Err(outcome
                                .error
                                .unwrap_or_else(|| OrkestraError::new(ErrorKind::Internal, "adapter returned non-terminal outcome"))),
                        }
                    })
                    .await
            }
        })
        .await;

        let retry_count = last_attempt.load(Ordering::Relaxed);
        result
            .map(|value| (value, retry_count))
            .map_err(|err| {
                if cancel_implied(&err) {
                    OrkestraOutcome::Cancelled
                } else {
                    OrkestraOutcome::Failed(err, retry_count)
                }
            })
    }

    async fn await_unwind_or_force_fail(
        &self,
        adapter: Arc<dyn Connector>,
        request: &ExecutionRequest,
        cancel: CancelToken,
    ) -> Result<(serde_json::Value, u32), OrkestraOutcome> {
        let _ = cancel;
        let grace = tokio::time::sleep(self.grace_interval);
        tokio::pin!(grace);
        let poll = adapter.get_execution_status(&request.id);
        tokio::select! {
            status = poll => {
                match status {
                    Ok(outcome) if outcome.state == ExecutionState::Completed => {
                        Ok((outcome.result.unwrap_or(serde_json::Value::Null), 0))
                    }
                    _ => Err(OrkestraOutcome::Failed(OrkestraError::execution_timeout(request.timeout.as_millis() as u64), 0)),
                }
            }
            _ = &mut grace => {
                Err(OrkestraOutcome::Failed(OrkestraError::execution_timeout(request.timeout.as_millis() as u64), 0))
            }
        }
    }

    fn update_running_average(&self, sample_ms: u64) {
        let mut avg = self.running_avg_ms.lock();
        let total = self.total_executions.load(Ordering::Relaxed).max(1) as f64;
        *avg += (sample_ms as f64 - *avg) / total;
    }
}

enum OrkestraOutcome {
    Cancelled,
    Failed(OrkestraError, u32),
}

fn cancel_implied(err: &OrkestraError) -> bool {
    err.kind == ErrorKind::Shutdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterCapabilities, AdapterOutcome, CancelOutcome, ValidationResult};
    use crate::domain::{LogEntry, WorkflowDefinition, WorkflowParameters};
    use crate::error::OrkestraResult;
    use crate::resilience::CircuitBreakerConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct ImmediateAdapter;

    #[async_trait]
    impl Connector for ImmediateAdapter {
        fn engine_type(&self) -> EngineType {
            EngineType::Custom(7)
        }
        async fn validate_workflow(&self, _workflow: &WorkflowDefinition) -> ValidationResult {
            ValidationResult::ok()
        }
        async fn execute_workflow(
            &self,
            _execution_id: &str,
            _workflow: &WorkflowDefinition,
            _parameters: &WorkflowParameters,
            _cancel: CancelToken,
        ) -> AdapterOutcome {
            AdapterOutcome::completed(serde_json::json!({"done": true}))
        }
        async fn get_execution_status(&self, _execution_id: &str) -> OrkestraResult<AdapterOutcome> {
            Ok(AdapterOutcome::completed(serde_json::json!({"done": true})))
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

    fn sample_request() -> ExecutionRequest {
        let workflow = WorkflowDefinition {
            id: None,
            name: "wf".into(),
            description: None,
            engine_type: EngineType::Custom(7),
            definition: serde_json::json!({}),
            version: None,
            metadata: HashMap::new(),
        };
        ExecutionRequest::new(workflow, HashMap::new())
    }

    #[tokio::test]
    async fn successful_execution_returns_to_idle() {
        let worker = Worker::new("w1", 1, vec![EngineType::Custom(7)]);
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let retry = RetryConfig::default();
        let request = sample_request();
        let record = worker
            .run_execution(&request, Arc::new(ImmediateAdapter), breaker, &retry, CancelToken::new())
            .await;
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(worker.status(), WorkerStatus::Idle);
        assert_eq!(worker.current_load(), 0);
        assert_eq!(worker.totals().executions, 1);
    }

    #[derive(Debug)]
    struct FlakyAdapter {
        remaining_failures: AtomicU32,
    }

    #[async_trait]
    impl Connector for FlakyAdapter {
        fn engine_type(&self) -> EngineType {
            EngineType::Custom(8)
        }
        async fn validate_workflow(&self, _workflow: &WorkflowDefinition) -> ValidationResult {
            ValidationResult::ok()
        }
        async fn execute_workflow(
            &self,
            _execution_id: &str,
            _workflow: &WorkflowDefinition,
            _parameters: &WorkflowParameters,
            _cancel: CancelToken,
        ) -> AdapterOutcome {
            if self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 { Some(n - 1) } else { None }
            }).is_ok() {
                return AdapterOutcome::failed(OrkestraError::new(ErrorKind::Network, "transient"));
            }
            AdapterOutcome::completed(serde_json::json!({"done": true}))
        }
        async fn get_execution_status(&self, _execution_id: &str) -> OrkestraResult<AdapterOutcome> {
            Ok(AdapterOutcome::completed(serde_json::json!({"done": true})))
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

    #[tokio::test]
    async fn retry_count_reflects_attempts_on_success() {
        let worker = Worker::new("w1", 1, vec![EngineType::Custom(8)]);
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let retry_config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            jitter: false,
        };
        let mut request = sample_request();
        request.workflow.engine_type = EngineType::Custom(8);
        request.engine_type = EngineType::Custom(8);
        let adapter = Arc::new(FlakyAdapter { remaining_failures: AtomicU32::new(1) });
        let record = worker
            .run_execution(&request, adapter, breaker, &retry_config, CancelToken::new())
            .await;
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.retry_count, 1);
    }

    #[test]
    fn serves_checks_engine_membership() {
        let worker = Worker::new("w1", 1, vec![EngineType::Airflow]);
        assert!(worker.serves(EngineType::Airflow));
        assert!(!worker.serves(EngineType::Temporal));
    }
}
