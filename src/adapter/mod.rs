//! Engine-adapter contract: the abstract boundary to a remote workflow
//! engine. The core depends only on this contract; no knowledge of
//! individual engines leaks into the core.

pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::concurrency::cancel_token::CancelToken;
use crate::domain::{EngineType, ExecutionState, LogEntry, WorkflowDefinition, WorkflowParameters};
use crate::error::{ErrorKind, OrkestraError, OrkestraResult};

pub use registry::AdapterRegistry;

/// A single structured validation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<ValidationIssue>) -> Self {
        Self {
            is_valid: false,
            errors,
            warnings: Vec::new(),
        }
    }
}

/// Outcome of an adapter-driven execution attempt. `executeWorkflow` must
/// not return a non-terminal state.
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub state: ExecutionState,
    pub result: Option<serde_json::Value>,
    pub error: Option<OrkestraError>,
}

impl AdapterOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            state: ExecutionState::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: OrkestraError) -> Self {
        Self {
            state: ExecutionState::Failed,
            result: None,
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            state: ExecutionState::Cancelled,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AdapterCapabilities {
    pub version: String,
    pub supported_features: Vec<String>,
    pub max_concurrent_executions: u32,
    pub supported_node_types: Vec<String>,
    pub custom_properties: HashMap<String, String>,
}

/// An engine adapter is a capability bundle a component implements.
///
/// Contract guarantees the core relies on: `execute_workflow` must not
/// return a non-terminal state; `cancel_execution` must be idempotent;
/// `validate_workflow` must not touch remote state.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn engine_type(&self) -> EngineType;

    async fn validate_workflow(&self, workflow: &WorkflowDefinition) -> ValidationResult;

    /// Starts execution and blocks until the adapter considers it terminal.
    /// Implementations poll the remote engine at a cadence of their choosing
    /// and must honor cooperative cancellation via `cancel`.
    async fn execute_workflow(
        &self,
        execution_id: &str,
        workflow: &WorkflowDefinition,
        parameters: &WorkflowParameters,
        cancel: CancelToken,
    ) -> AdapterOutcome;

    /// Snapshot; may be called concurrently with `execute_workflow`.
    async fn get_execution_status(&self, execution_id: &str) -> OrkestraResult<AdapterOutcome>;

    /// Lazy, finite, non-restartable; must be sorted by timestamp ascending.
    async fn get_execution_logs(&self, execution_id: &str) -> OrkestraResult<Vec<LogEntry>>;

    /// Best effort; a successful return does not imply the remote engine
    /// has stopped.
    async fn cancel_execution(&self, execution_id: &str) -> CancelOutcome;

    /// Optional best-effort conversion from another engine's definition.
    async fn convert_workflow(
        &self,
        _workflow: &WorkflowDefinition,
        _source_engine: EngineType,
    ) -> OrkestraResult<WorkflowDefinition> {
        Err(OrkestraError::new(
            ErrorKind::UnsupportedConversion,
            "this adapter does not support workflow conversion",
        ))
    }

    async fn test_connection(&self) -> bool;

    fn get_capabilities(&self) -> AdapterCapabilities;
}
