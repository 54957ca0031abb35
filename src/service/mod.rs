//! Execution Service: the central owner of the worker pool, the dispatcher
//! loop, the auto-scaling control loop, worker failure handling, and the
//! in-memory result store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, instrument, warn};

use crate::adapter::AdapterRegistry;
use crate::concurrency::CancelToken;
use crate::config::AppConfig;
use crate::domain::{
    EngineType, ExecutionRecord, ExecutionRequest, ExecutionState, ResultEntry, WorkerStatus,
};
use crate::error::{ErrorKind, OrkestraError, OrkestraResult};
use crate::events::SharedEventBus;
use crate::queue::SharedQueue;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
use crate::worker::Worker;

/// Fixed-key XOR applied by the `encryption_enabled` storage filter. This is
/// obfuscation, not a security boundary.
const STORAGE_XOR_KEY: u8 = 0x5a;

/// An execution currently owned by a worker; tracked so `cancelExecution`
/// can signal it and the health checker can re-enqueue it on worker loss.
struct InFlight {
    request: ExecutionRequest,
    worker_id: String,
    cancel: CancelToken,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    /// Mean duration, in milliseconds, of completions within `metrics.aggregationWindow`.
    pub avg_duration_ms: f64,
    /// Completions per second within `metrics.aggregationWindow`.
    pub throughput_per_sec: f64,
    /// Current pool-wide load / capacity ratio.
    pub utilization: f64,
    pub workers_by_status: WorkerStatusCounts,
}

impl ServiceMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.failed_executions as f64 / self.total_executions as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStatusCounts {
    pub created: u32,
    pub idle: u32,
    pub busy: u32,
    pub draining: u32,
    pub dead: u32,
}

#[derive(Debug, Clone)]
pub struct WorkersStatus {
    pub id: String,
    pub status: WorkerStatus,
    pub current_load: u32,
    pub capacity: u32,
    pub engine_types: Vec<EngineType>,
}

/// Auto-scaling decision published at the end of each control-loop tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

pub struct ExecutionService {
    config: AppConfig,
    queue: SharedQueue,
    events: SharedEventBus,
    adapters: Arc<AdapterRegistry>,
    breakers: DashMap<EngineType, Arc<CircuitBreaker>>,
    workers: DashMap<String, Arc<Worker>>,
    in_flight: DashMap<String, InFlight>,
    results: DashMap<String, ResultEntry>,
    pending: DashMap<String, ExecutionRecord>,
    retry_counts: DashMap<String, u32>,
    metrics: parking_lot::Mutex<ServiceMetrics>,
    /// Recent completion timestamps and durations, pruned to `metrics.aggregationWindow`
    /// on read; backs the rolling average duration and throughput figures.
    completion_samples: parking_lot::Mutex<VecDeque<(Instant, u64)>>,
    next_worker_seq: AtomicU64,
    last_scale_up: parking_lot::Mutex<Option<Instant>>,
    last_scale_down: parking_lot::Mutex<Option<Instant>>,
    root_cancel: CancelToken,
}

impl ExecutionService {
    pub fn new(
        config: AppConfig,
        queue: SharedQueue,
        events: SharedEventBus,
        adapters: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            config,
            queue,
            events,
            adapters,
            breakers: DashMap::new(),
            workers: DashMap::new(),
            in_flight: DashMap::new(),
            results: DashMap::new(),
            pending: DashMap::new(),
            retry_counts: DashMap::new(),
            metrics: parking_lot::Mutex::new(ServiceMetrics::default()),
            completion_samples: parking_lot::Mutex::new(VecDeque::new()),
            next_worker_seq: AtomicU64::new(0),
            last_scale_up: parking_lot::Mutex::new(None),
            last_scale_down: parking_lot::Mutex::new(None),
            root_cancel: CancelToken::new(),
        }
    }

    fn breaker_for(&self, engine_type: EngineType) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(engine_type)
            .or_insert_with(|| {
                let opts = &self.config.fault_tolerance.circuit_breaker_config;
                Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                    failure_threshold: opts.failure_threshold,
                    recovery_timeout: opts.reset_timeout,
                    monitoring_period: opts.monitoring_period,
                }))
            })
            .clone()
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.config.fault_tolerance.max_retries + 1,
            initial_delay: self.config.fault_tolerance.retry_delay,
            max_delay: Duration::from_secs(30),
            backoff_factor: self.config.fault_tolerance.backoff_factor,
            jitter: true,
        }
    }

    fn spawn_worker(&self, engine_types: Vec<EngineType>) -> Arc<Worker> {
        let seq = self.next_worker_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("worker-{seq}");
        let worker = Arc::new(Worker::new(id.clone(), 1, engine_types));
        self.workers.insert(id.clone(), worker.clone());
        self.events.worker_started(id);
        worker
    }

    /// Brings the pool up to `scaling.minWorkers`. Workers launched here
    /// start ready to serve any engine type registered at call time.
    pub fn start_pool(&self) {
        let engine_types: Vec<EngineType> = self.adapters.registered_engine_types();
        for _ in 0..self.config.scaling.min_workers {
            self.spawn_worker(engine_types.clone());
        }
    }

    // -- public operations -------------------------------------------------

    /// Enqueues the request and records it PENDING. Rejects QUEUE_FULL
    /// synchronously; does not emit `executionStarted` (that happens when a
    /// worker actually picks it up, per the queued-cancellation scenario).
    pub fn submit_execution(&self, request: ExecutionRequest) -> OrkestraResult<String> {
        let id = request.id.clone();
        self.pending.insert(id.clone(), ExecutionRecord::pending(id.clone()));
        self.retry_counts.insert(id.clone(), 0);
        if let Err(err) = self.queue.enqueue(request) {
            self.pending.remove(&id);
            self.retry_counts.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Queued: removed and marked CANCELLED immediately. Running: the
    /// worker's cancel token is asserted and success is returned without
    /// waiting for the adapter to unwind. Terminal: ALREADY_TERMINAL.
    pub fn cancel_execution(&self, id: &str) -> OrkestraResult<()> {
        if let Some(request) = self.queue.cancel_by_id(id) {
            let mut record = ExecutionRecord::pending(request.id.clone());
            record.state = ExecutionState::Cancelled;
            record.ended_at = Some(SystemTime::now());
            self.pending.remove(id);
            self.retry_counts.remove(id);
            self.results.insert(
                id.to_string(),
                ResultEntry {
                    record,
                    retention_deadline: self.retention_deadline(),
                },
            );
            self.events.execution_cancelled(id, serde_json::json!({}));
            return Ok(());
        }

        if let Some(entry) = self.in_flight.get(id) {
            entry.cancel.cancel();
            return Ok(());
        }

        if self.results.contains_key(id) {
            return Err(OrkestraError::already_terminal());
        }

        Err(OrkestraError::not_found(id))
    }

    pub fn get_execution_status(&self, id: &str) -> OrkestraResult<ExecutionState> {
        if let Some(entry) = self.results.get(id) {
            return Ok(entry.record.state);
        }
        if self.in_flight.contains_key(id) {
            return Ok(ExecutionState::Running);
        }
        if self.pending.contains_key(id) {
            return Ok(ExecutionState::Pending);
        }
        Err(OrkestraError::not_found(id))
    }

    /// Succeeds only while the terminal record is within its retention
    /// window; fails NOT_FOUND afterward even though the id once existed.
    pub fn get_execution_result(&self, id: &str) -> OrkestraResult<ExecutionRecord> {
        match self.results.get(id) {
            Some(entry) if entry.retention_deadline >= SystemTime::now() => {
                let mut record = entry.record.clone();
                record.result = record.result.take().map(|value| self.decode_payload(value));
                Ok(record)
            }
            _ => Err(OrkestraError::not_found(id)),
        }
    }

    pub fn get_workers_status(&self) -> Vec<WorkersStatus> {
        self.workers
            .iter()
            .map(|e| {
                let w = e.value();
                WorkersStatus {
                    id: w.id().to_string(),
                    status: w.status(),
                    current_load: w.current_load(),
                    capacity: w.capacity(),
                    engine_types: w.engine_types().to_vec(),
                }
            })
            .collect()
    }

    pub fn get_execution_metrics(&self) -> ServiceMetrics {
        let mut metrics = self.metrics.lock().clone();

        let window = self.config.metrics.aggregation_window;
        let cutoff = Instant::now().checked_sub(window);
        let mut samples = self.completion_samples.lock();
        if let Some(cutoff) = cutoff {
            while samples.front().map(|(t, _)| *t < cutoff).unwrap_or(false) {
                samples.pop_front();
            }
        }
        let recent: Vec<u64> = samples.iter().map(|(_, d)| *d).collect();
        drop(samples);

        metrics.avg_duration_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<u64>() as f64 / recent.len() as f64
        };
        let window_secs = window.as_secs_f64().max(f64::EPSILON);
        metrics.throughput_per_sec = recent.len() as f64 / window_secs;

        let workers: Vec<Arc<Worker>> = self.workers.iter().map(|e| e.value().clone()).collect();
        let total_capacity: u32 = workers.iter().map(|w| w.capacity()).sum();
        let total_load: u32 = workers.iter().map(|w| w.current_load()).sum();
        metrics.utilization = if total_capacity == 0 {
            0.0
        } else {
            total_load as f64 / total_capacity as f64
        };

        let mut by_status = WorkerStatusCounts::default();
        for worker in &workers {
            match worker.status() {
                WorkerStatus::Created => by_status.created += 1,
                WorkerStatus::Idle => by_status.idle += 1,
                WorkerStatus::Busy => by_status.busy += 1,
                WorkerStatus::Draining => by_status.draining += 1,
                WorkerStatus::Dead => by_status.dead += 1,
            }
        }
        metrics.workers_by_status = by_status;

        metrics
    }

    /// Applies the storage-config compression/encryption filters to a
    /// terminal result payload. A no-op when both are disabled.
    fn encode_payload(&self, value: serde_json::Value) -> serde_json::Value {
        let storage = &self.config.storage;
        if !storage.compression_enabled && !storage.encryption_enabled {
            return value;
        }
        let mut bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(_) => return value,
        };
        if storage.compression_enabled {
            bytes = lz4::block::compress(&bytes, None, true).unwrap_or(bytes);
        }
        if storage.encryption_enabled {
            for byte in bytes.iter_mut() {
                *byte ^= STORAGE_XOR_KEY;
            }
        }
        serde_json::json!({
            "__storage_encoded": true,
            "compressed": storage.compression_enabled,
            "encrypted": storage.encryption_enabled,
            "payload": base64::engine::general_purpose::STANDARD.encode(&bytes),
        })
    }

    /// Reverses [`Self::encode_payload`]. Values that were never encoded
    /// (filters disabled at write time, or pre-existing plain results) pass
    /// through unchanged.
    fn decode_payload(&self, value: serde_json::Value) -> serde_json::Value {
        let Some(obj) = value.as_object() else {
            return value;
        };
        if obj.get("__storage_encoded").and_then(|v| v.as_bool()) != Some(true) {
            return value;
        }
        let compressed = obj.get("compressed").and_then(|v| v.as_bool()).unwrap_or(false);
        let encrypted = obj.get("encrypted").and_then(|v| v.as_bool()).unwrap_or(false);
        let Some(payload) = obj.get("payload").and_then(|v| v.as_str()) else {
            return value.clone();
        };
        let Ok(mut bytes) = base64::engine::general_purpose::STANDARD.decode(payload) else {
            return value.clone();
        };
        if encrypted {
            for byte in bytes.iter_mut() {
                *byte ^= STORAGE_XOR_KEY;
            }
        }
        if compressed {
            if let Ok(decompressed) = lz4::block::decompress(&bytes, None) {
                bytes = decompressed;
            }
        }
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    }

    fn record_completion_sample(&self, record: &ExecutionRecord) {
        let Some(duration_ms) = record.metrics.duration_ms else {
            return;
        };
        let mut samples = self.completion_samples.lock();
        samples.push_back((Instant::now(), duration_ms));
        if let Some(cutoff) = Instant::now().checked_sub(self.config.metrics.aggregation_window) {
            while samples.front().map(|(t, _)| *t < cutoff).unwrap_or(false) {
                samples.pop_front();
            }
        }
    }

    pub fn queue_snapshot(&self) -> crate::queue::QueueSnapshot {
        self.queue.snapshot()
    }

    /// Manual scaling hint: nudges the pool toward `demand` workers within
    /// `[minWorkers, maxWorkers]`, bypassing cooldown (operator override).
    pub fn scale_executors(&self, demand: u32) {
        let target = demand.clamp(self.config.scaling.min_workers, self.config.scaling.max_workers);
        let current = self.workers.len() as u32;
        let engine_types: Vec<EngineType> = self.adapters.registered_engine_types();
        if target > current {
            for _ in current..target {
                self.spawn_worker(engine_types.clone());
            }
        } else if target < current {
            self.drain_idle_workers(current - target);
        }
    }

    /// Test / admin hook: forces a worker to DEAD and runs the same
    /// recovery path the background health checker would.
    pub fn handle_executor_failure(&self, worker_id: &str) {
        if let Some((_, worker)) = self.workers.remove(worker_id) {
            worker.mark_dead();
            self.events.worker_stopped(worker_id);
            self.requeue_owned_by(worker_id);
            if (self.workers.len() as u32) < self.config.scaling.min_workers {
                let engine_types: Vec<EngineType> = self.adapters.registered_engine_types();
                self.spawn_worker(engine_types);
            }
        }
    }

    fn requeue_owned_by(&self, worker_id: &str) {
        let owned: Vec<String> = self
            .in_flight
            .iter()
            .filter(|e| e.value().worker_id == worker_id)
            .map(|e| e.key().clone())
            .collect();

        for id in owned {
            if let Some((_, in_flight)) = self.in_flight.remove(&id) {
                let request = in_flight.request;
                let retry_count = {
                    let mut entry = self.retry_counts.entry(id.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if retry_count > self.config.fault_tolerance.max_retries {
                    let mut record = ExecutionRecord::pending(id.clone());
                    record.state = ExecutionState::Failed;
                    record.retry_count = retry_count;
                    record.error = Some(OrkestraError::worker_lost(worker_id));
                    self.record_terminal(record);
                    continue;
                }
                if let Err(err) = self.queue.requeue(request) {
                    warn!(execution_id = %id, error = %err, "failed to re-enqueue after worker loss");
                } else {
                    self.pending.insert(id.clone(), ExecutionRecord::pending(id));
                }
            }
        }
    }

    fn retention_deadline(&self) -> SystemTime {
        SystemTime::now() + Duration::from_secs(self.config.storage.result_retention_days as u64 * 86_400)
    }

    fn drain_idle_workers(&self, count: u32) {
        let mut candidates: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .map(|e| e.value().clone())
            .filter(|w| w.status() != WorkerStatus::Draining)
            .collect();
        candidates.sort_by_key(|w| w.current_load());
        for worker in candidates.into_iter().take(count as usize) {
            worker.mark_draining();
        }
    }

    fn reap_drained_workers(&self) {
        let drained: Vec<String> = self
            .workers
            .iter()
            .filter(|e| e.value().drained())
            .map(|e| e.key().clone())
            .collect();
        for id in drained {
            if let Some((_, worker)) = self.workers.remove(&id) {
                worker.mark_dead();
                self.events.worker_stopped(&id);
            }
        }
    }

    // -- background loops ---------------------------------------------------

    /// Dispatcher: dequeues and places entries on a compatible, least-loaded
    /// IDLE worker. If none is available, the entry is put back and the loop
    /// waits briefly before retrying (`queue.processingInterval`).
    async fn dispatcher_loop(self: Arc<Self>) {
        loop {
            let request = tokio::select! {
                req = self.queue.dequeue() => req,
                _ = self.root_cancel.cancelled() => return,
            };
            let Some(request) = request else { return };

            let worker = self.select_worker(request.engine_type);
            let Some(worker) = worker else {
                if self.queue.requeue(request.clone()).is_err() {
                    warn!(execution_id = %request.id, "dropped entry: no compatible worker and queue full");
                }
                tokio::time::sleep(self.config.queue.processing_interval).await;
                continue;
            };

            self.dispatch(request, worker);
        }
    }

    fn select_worker(&self, engine_type: EngineType) -> Option<Arc<Worker>> {
        self.workers
            .iter()
            .map(|e| e.value().clone())
            .filter(|w| w.serves(engine_type) && w.has_capacity())
            .min_by(|a, b| {
                a.current_load()
                    .cmp(&b.current_load())
                    .then(a.failure_rate().partial_cmp(&b.failure_rate()).unwrap_or(std::cmp::Ordering::Equal))
            })
    }

    fn dispatch(self: &Arc<Self>, request: ExecutionRequest, worker: Arc<Worker>) {
        let service = self.clone();
        let cancel = worker.root_cancel_token().child_token();
        self.pending.remove(&request.id);
        self.in_flight.insert(
            request.id.clone(),
            InFlight {
                request: request.clone(),
                worker_id: worker.id().to_string(),
                cancel: cancel.clone(),
            },
        );
        self.events.execution_started(request.id.clone(), serde_json::json!({}));

        tokio::spawn(async move {
            let adapter = match service.adapters.resolve(request.engine_type) {
                Ok(adapter) => adapter,
                Err(err) => {
                    service.in_flight.remove(&request.id);
                    service.events.execution_failed(&request.id, serde_json::json!({"kind": err.kind.as_str()}));
                    return;
                }
            };
            let breaker = service.breaker_for(request.engine_type);
            let retry_config = service.retry_config();
            let record = worker
                .run_execution(&request, adapter, breaker, &retry_config, cancel)
                .await;

            service.in_flight.remove(&request.id);
            service.record_terminal(record);
        });
    }

    /// Writes a terminal record to the result store exactly once per id.
    ///
    /// A worker declared dead mid-execution is cancelled but keeps running
    /// until it observes the cascade; by the time it finishes, the
    /// worker-loss recovery path may already have written a terminal record
    /// for the same id (either a redispatched completion or a
    /// retries-exhausted failure). Whichever write lands first wins; later
    /// ones are dropped so a COMPLETED result is never overwritten by a
    /// stale CANCELLED/FAILED one, and `total_executions` is counted once.
    fn record_terminal(&self, mut record: ExecutionRecord) {
        let id = record.id.clone();
        let slot = match self.results.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(execution_id = %id, state = ?record.state, "dropping late terminal write, id already terminal");
                return;
            }
            Entry::Vacant(slot) => slot,
        };

        let mut metrics = self.metrics.lock();
        metrics.total_executions += 1;
        match record.state {
            ExecutionState::Completed => {
                metrics.successful_executions += 1;
                self.events.execution_completed(id.clone(), serde_json::json!({}));
            }
            ExecutionState::Failed => {
                metrics.failed_executions += 1;
                let kind = record.error.as_ref().map(|e| e.kind.as_str()).unwrap_or("UNKNOWN");
                self.events.execution_failed(id.clone(), serde_json::json!({"kind": kind}));
            }
            ExecutionState::Cancelled => {
                metrics.cancelled_executions += 1;
                self.events.execution_cancelled(id.clone(), serde_json::json!({}));
            }
            ExecutionState::Pending | ExecutionState::Running => {
                warn!(execution_id = %id, "worker returned non-terminal record");
            }
        }
        drop(metrics);

        self.retry_counts.remove(&id);
        self.record_completion_sample(&record);
        record.result = record.result.take().map(|value| self.encode_payload(value));
        slot.insert(ResultEntry { record, retention_deadline: self.retention_deadline() });
    }

    /// Decides and applies one scaling step. Utilization and load are
    /// computed only from workers past `scaling.workerStartupTime`, so a
    /// just-spawned worker doesn't count toward capacity until it has had a
    /// chance to pick up work; the pool-size bounds (`min`/`max` workers and
    /// the ScaleUp/ScaleDown trigger's worker count) still count it.
    #[instrument(skip(self))]
    async fn auto_scale_tick(&self) {
        let workers: Vec<Arc<Worker>> = self.workers.iter().map(|e| e.value().clone()).collect();
        let current_workers = workers.len() as u32;
        let ramped: Vec<&Arc<Worker>> = workers
            .iter()
            .filter(|w| w.age() >= self.config.scaling.worker_startup_time)
            .collect();
        let total_capacity: u32 = ramped.iter().map(|w| w.capacity()).sum();
        let total_load: u32 = ramped.iter().map(|w| w.current_load()).sum();
        let utilization = if total_capacity == 0 {
            0.0
        } else {
            total_load as f64 / total_capacity as f64
        };
        let queue_snapshot = self.queue.snapshot();
        let now = Instant::now();

        let can_scale_up = self
            .last_scale_up
            .lock()
            .map(|t| now.duration_since(t) >= self.config.scaling.scale_up_cooldown)
            .unwrap_or(true);
        let can_scale_down = self
            .last_scale_down
            .lock()
            .map(|t| now.duration_since(t) >= self.config.scaling.scale_down_cooldown)
            .unwrap_or(true);

        let latency_breach = queue_snapshot.total > 0
            && queue_snapshot
                .oldest_wait()
                .map(|wait| wait > self.config.scaling.scale_up_latency_budget)
                .unwrap_or(false);

        // Target pool size the demand (in-flight plus queued) implies at the
        // configured target utilization, clamped to the configured bounds.
        let total_demand = total_load + queue_snapshot.total as u32;
        let target_workers = if total_demand == 0 {
            self.config.scaling.min_workers
        } else {
            (total_demand as f64 / self.config.scaling.target_utilization).ceil() as u32
        }
        .clamp(self.config.scaling.min_workers, self.config.scaling.max_workers);

        let action = if (utilization >= self.config.scaling.scale_up_threshold || latency_breach)
            && can_scale_up
            && current_workers < self.config.scaling.max_workers
        {
            ScalingAction::ScaleUp
        } else if utilization <= self.config.scaling.scale_down_threshold
            && queue_snapshot.total == 0
            && can_scale_down
            && current_workers > self.config.scaling.min_workers
        {
            ScalingAction::ScaleDown
        } else {
            ScalingAction::NoAction
        };

        match action {
            ScalingAction::ScaleUp => {
                let to_add = target_workers.saturating_sub(current_workers).max(1);
                let engine_types: Vec<EngineType> = self.adapters.registered_engine_types();
                for _ in 0..to_add {
                    self.spawn_worker(engine_types.clone());
                }
                *self.last_scale_up.lock() = Some(now);
                self.events.scaling_completed(serde_json::json!({
                    "action": "scale_up",
                    "utilization": utilization,
                    "workers_added": to_add,
                }));
            }
            ScalingAction::ScaleDown => {
                let to_remove = current_workers.saturating_sub(target_workers).max(1);
                self.drain_idle_workers(to_remove);
                *self.last_scale_down.lock() = Some(now);
                self.events.scaling_completed(serde_json::json!({
                    "action": "scale_down",
                    "utilization": utilization,
                    "workers_drained": to_remove,
                }));
            }
            ScalingAction::NoAction => {}
        }
        self.reap_drained_workers();
    }

    async fn health_check_loop(self: Arc<Self>, staleness_bound: Duration) {
        let mut ticker = tokio::time::interval(self.config.metrics.collection_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.root_cancel.cancelled() => return,
            }
            let dead: Vec<String> = self
                .workers
                .iter()
                .filter(|e| e.value().heartbeat_age() > staleness_bound)
                .map(|e| e.key().clone())
                .collect();
            for id in dead {
                info!(worker_id = %id, "heartbeat stale, declaring worker dead");
                self.clone().handle_executor_failure(&id);
            }
        }
    }

    async fn scaler_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.metrics.collection_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.root_cancel.cancelled() => return,
            }
            self.auto_scale_tick().await;
        }
    }

    async fn result_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.root_cancel.cancelled() => return,
            }
            let now = SystemTime::now();
            let expired: Vec<String> = self
                .results
                .iter()
                .filter(|e| e.value().retention_deadline < now)
                .map(|e| e.key().clone())
                .collect();
            for id in expired {
                self.results.remove(&id);
            }
        }
    }

    /// Starts the pool and all background loops.
    pub fn start(self: &Arc<Self>) {
        self.start_pool();
        let staleness_bound = self.config.metrics.collection_interval * 3;
        tokio::spawn(self.clone().dispatcher_loop());
        tokio::spawn(self.clone().scaler_loop());
        tokio::spawn(self.clone().health_check_loop(staleness_bound));
        tokio::spawn(self.clone().result_sweep_loop());
        self.events.started();
    }

    /// Global cancellation: closes the queue, cancels every worker, waits
    /// up to `drain_timeout` for in-flight executions to finish.
    pub async fn stop(&self, drain_timeout: Duration) {
        self.queue.close();
        self.root_cancel.cancel();
        for worker in self.workers.iter() {
            worker.value().root_cancel_token().cancel();
        }
        let deadline = Instant::now() + drain_timeout;
        while !self.in_flight.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for entry in self.in_flight.iter() {
            let id = entry.key().clone();
            let mut record = ExecutionRecord::pending(id.clone());
            record.state = ExecutionState::Failed;
            record.error = Some(OrkestraError::shutdown());
            self.events.execution_failed(&id, serde_json::json!({"kind": "SHUTDOWN"}));
        }
        self.events.stopped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterCapabilities, AdapterOutcome, CancelOutcome, ValidationResult};
    use crate::domain::{LogEntry, WorkflowDefinition, WorkflowParameters};
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct FastAdapter;

    #[async_trait]
    impl crate::adapter::Connector for FastAdapter {
        fn engine_type(&self) -> EngineType {
            EngineType::Airflow
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
            AdapterOutcome::completed(serde_json::json!({"ok": true}))
        }
        async fn get_execution_status(&self, _execution_id: &str) -> OrkestraResult<AdapterOutcome> {
            Ok(AdapterOutcome::completed(serde_json::json!({"ok": true})))
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

    fn build_service() -> Arc<ExecutionService> {
        let config = AppConfig::default();
        let queue = Arc::new(crate::queue::PriorityQueue::new(config.queue.max_size));
        let events = Arc::new(crate::events::EventBus::new(64));
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(EngineType::Airflow, Arc::new(FastAdapter));
        Arc::new(ExecutionService::new(config, queue, events, adapters))
    }

    fn request() -> ExecutionRequest {
        let workflow = WorkflowDefinition {
            id: None,
            name: "wf".into(),
            description: None,
            engine_type: EngineType::Airflow,
            definition: serde_json::json!({}),
            version: None,
            metadata: HashMap::new(),
        };
        ExecutionRequest::new(workflow, WorkflowParameters::new())
    }

    #[tokio::test]
    async fn happy_path_completes() {
        let service = build_service();
        service.start();
        let req = request();
        let id = service.submit_execution(req).unwrap();

        let mut state = None;
        for _ in 0..100 {
            if let Ok(s) = service.get_execution_status(&id) {
                if s.is_terminal() {
                    state = Some(s);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, Some(ExecutionState::Completed));
    }

    #[tokio::test]
    async fn cancel_while_queued_succeeds_without_running() {
        let config = AppConfig::default();
        let queue = Arc::new(crate::queue::PriorityQueue::new(config.queue.max_size));
        let events = Arc::new(crate::events::EventBus::new(64));
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(EngineType::Airflow, Arc::new(FastAdapter));
        let service = Arc::new(ExecutionService::new(config, queue, events, adapters));
        // No workers started: entry stays queued.
        let req = request();
        let id = service.submit_execution(req).unwrap();
        service.cancel_execution(&id).unwrap();
        assert_eq!(service.get_execution_status(&id).unwrap(), ExecutionState::Cancelled);
    }

    #[test]
    fn cancel_unknown_id_is_not_found() {
        let service = build_service();
        let err = service.cancel_execution("missing").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
