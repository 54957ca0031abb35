//! Core data model: engine types, workflow definitions, execution requests
//! and records, worker descriptors, and queue entries.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed enumeration identifying a family of remote engines. Each value
/// corresponds to at most one registered adapter in a given process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Airflow,
    Temporal,
    StepFunctions,
    /// Open-ended escape hatch for adapters registered outside the three
    /// reference implementations.
    Custom(u32),
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineType::Airflow => write!(f, "airflow"),
            EngineType::Temporal => write!(f, "temporal"),
            EngineType::StepFunctions => write!(f, "step_functions"),
            EngineType::Custom(id) => write!(f, "custom({id})"),
        }
    }
}

/// Priority band. Ordering is the `Ord` derive's declaration order, which
/// Rust ranks variants low-to-high by declaration position; CRITICAL is
/// declared last so that `Priority::Critical > Priority::Low` holds directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Untyped mapping from string to value; semantics are owned by the adapter.
pub type WorkflowParameters = HashMap<String, serde_json::Value>;

/// Immutable workflow definition. Identity, if present, is caller-assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub engine_type: EngineType,
    /// Opaque payload whose schema is known only to the target adapter.
    pub definition: serde_json::Value,
    pub version: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl WorkflowDefinition {
    /// Structural validation independent of any adapter: name length and
    /// presence. Adapter-specific validation happens separately via
    /// `Connector::validate_workflow`.
    pub fn validate_structure(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("workflow name must not be empty".to_string());
        }
        if self.name.chars().count() > 255 {
            return Err("workflow name must be at most 255 characters".to_string());
        }
        Ok(())
    }
}

/// Submitted to the core by a caller (or the cron scheduler).
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: String,
    pub workflow_id: Option<String>,
    pub workflow: WorkflowDefinition,
    pub engine_type: EngineType,
    pub parameters: WorkflowParameters,
    pub priority: Priority,
    pub created_at: SystemTime,
    pub timeout: Duration,
    pub max_retries: u32,
    pub caller_id: String,
}

impl ExecutionRequest {
    pub fn new(workflow: WorkflowDefinition, parameters: WorkflowParameters) -> Self {
        let engine_type = workflow.engine_type;
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow,
            engine_type,
            parameters,
            priority: Priority::default(),
            created_at: SystemTime::now(),
            timeout: Duration::from_secs(30),
            max_retries: 0,
            caller_id: "caller".to_string(),
        }
    }
}

/// Execution lifecycle state. Transitions are monotonic once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

/// Aggregated metrics recorded against a single execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub cpu_millis: Option<u64>,
    pub network_calls: u32,
    pub counters: HashMap<String, i64>,
}

/// Single adapter-sourced log line, ordered by timestamp ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub level: String,
    pub message: String,
}

/// Mutable execution record, the unit of truth tracked by the result store
/// and returned from status/result reads.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: String,
    pub state: ExecutionState,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub result: Option<serde_json::Value>,
    pub error: Option<crate::error::OrkestraError>,
    pub logs: Vec<LogEntry>,
    pub metrics: ExecutionMetrics,
    pub retry_count: u32,
    pub owning_worker: Option<String>,
}

impl ExecutionRecord {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: ExecutionState::Pending,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            logs: Vec::new(),
            metrics: ExecutionMetrics::default(),
            retry_count: 0,
            owning_worker: None,
        }
    }
}

/// Worker operating status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Created,
    Idle,
    Busy,
    Draining,
    Dead,
}

/// Result-store entry: a terminal record plus a retention deadline.
#[derive(Debug, Clone)]
pub struct ResultEntry {
    pub record: ExecutionRecord,
    pub retention_deadline: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_spec() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn terminal_states_are_detected() {
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::Cancelled.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(!ExecutionState::Pending.is_terminal());
    }

    #[test]
    fn workflow_name_validation() {
        let mut wf = WorkflowDefinition {
            id: None,
            name: String::new(),
            description: None,
            engine_type: EngineType::Airflow,
            definition: serde_json::json!({}),
            version: None,
            metadata: HashMap::new(),
        };
        assert!(wf.validate_structure().is_err());
        wf.name = "ok".to_string();
        assert!(wf.validate_structure().is_ok());
    }
}
