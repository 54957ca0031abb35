//! Error hierarchy for the orchestration core.
//!
//! All failures that can cross the core boundary are translated into an
//! [`OrkestraError`] carrying one of the [`ErrorKind`] values. No raw
//! transport or adapter-internal error type is ever returned to a caller.

use thiserror::Error;

/// Stable, matchable failure classification.
///
/// Kinds are orthogonal to the Rust type that carries them: callers match on
/// `kind()`, not on enum variant, so the adapter boundary can evolve without
/// breaking downstream `match` exhaustiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationFailed,
    NoAdapterRegistered,
    QueueFull,
    CircuitOpen,
    Network,
    Http5xx,
    Http429,
    Http408,
    Http4xxOther,
    RemoteEngineError,
    ExecutionTimeout,
    RetriesExhausted,
    WorkerLost,
    Shutdown,
    AlreadyTerminal,
    NotFound,
    UnsupportedConversion,
    Internal,
}

impl ErrorKind {
    /// Whether the retry driver should treat a failure of this kind as retriable.
    ///
    /// Matches the fixed classification policy in the retry driver spec:
    /// network/5xx/429/408/circuit-open are retriable, everything else is not.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Http5xx
                | ErrorKind::Http429
                | ErrorKind::Http408
                | ErrorKind::CircuitOpen
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::NoAdapterRegistered => "NO_ADAPTER_REGISTERED",
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Http5xx => "HTTP_5XX",
            ErrorKind::Http429 => "HTTP_429",
            ErrorKind::Http408 => "HTTP_408",
            ErrorKind::Http4xxOther => "HTTP_4XX_OTHER",
            ErrorKind::RemoteEngineError => "REMOTE_ENGINE_ERROR",
            ErrorKind::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorKind::RetriesExhausted => "RETRIES_EXHAUSTED",
            ErrorKind::WorkerLost => "WORKER_LOST",
            ErrorKind::Shutdown => "SHUTDOWN",
            ErrorKind::AlreadyTerminal => "ALREADY_TERMINAL",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::UnsupportedConversion => "UNSUPPORTED_CONVERSION",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to a terminal execution record or returned
/// synchronously from a core operation.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct OrkestraError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
    /// Verbatim error text surfaced by the remote engine, if any.
    pub engine_error: Option<String>,
}

impl OrkestraError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            engine_error: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_engine_error(mut self, engine_error: impl Into<String>) -> Self {
        self.engine_error = Some(engine_error.into());
        self
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailed, message)
    }

    pub fn no_adapter_registered(engine_type: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::NoAdapterRegistered,
            format!("no adapter registered for engine type {engine_type}"),
        )
    }

    pub fn queue_full() -> Self {
        Self::new(ErrorKind::QueueFull, "queue is at capacity")
    }

    pub fn circuit_open() -> Self {
        Self::new(ErrorKind::CircuitOpen, "circuit breaker is open")
    }

    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("no record for id {id}"))
    }

    pub fn already_terminal() -> Self {
        Self::new(ErrorKind::AlreadyTerminal, "execution already terminal")
    }

    pub fn execution_timeout(duration_ms: u64) -> Self {
        Self::new(
            ErrorKind::ExecutionTimeout,
            format!("execution exceeded timeout of {duration_ms}ms"),
        )
    }

    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::new(
            ErrorKind::RetriesExhausted,
            format!("retries exhausted after {attempts} attempts"),
        )
    }

    pub fn worker_lost(worker_id: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::WorkerLost,
            format!("owning worker {worker_id} declared dead"),
        )
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "service is shutting down")
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_retriable()
    }

    pub fn user_message(&self) -> String {
        match self.kind {
            ErrorKind::NotFound => format!("{} Please check the execution id.", self.message),
            ErrorKind::QueueFull => {
                "The system is at capacity. Please retry shortly.".to_string()
            }
            ErrorKind::ExecutionTimeout => {
                format!("{} Consider raising the request timeout.", self.message)
            }
            _ => self.message.clone(),
        }
    }

    pub fn severity(&self) -> &'static str {
        match self.kind {
            ErrorKind::Internal | ErrorKind::WorkerLost => "critical",
            ErrorKind::RetriesExhausted
            | ErrorKind::RemoteEngineError
            | ErrorKind::ExecutionTimeout
            | ErrorKind::Shutdown => "error",
            ErrorKind::CircuitOpen | ErrorKind::Network | ErrorKind::Http5xx => "warning",
            _ => "info",
        }
    }
}

impl From<std::io::Error> for OrkestraError {
    fn from(err: std::io::Error) -> Self {
        OrkestraError::new(ErrorKind::Internal, err.to_string())
    }
}

impl From<serde_json::Error> for OrkestraError {
    fn from(err: serde_json::Error) -> Self {
        OrkestraError::new(ErrorKind::Internal, format!("json error: {err}"))
    }
}

pub type OrkestraResult<T> = Result<T, OrkestraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds_match_spec_policy() {
        assert!(ErrorKind::Network.is_retriable());
        assert!(ErrorKind::Http5xx.is_retriable());
        assert!(ErrorKind::Http429.is_retriable());
        assert!(ErrorKind::Http408.is_retriable());
        assert!(ErrorKind::CircuitOpen.is_retriable());
        assert!(!ErrorKind::Http4xxOther.is_retriable());
        assert!(!ErrorKind::RemoteEngineError.is_retriable());
        assert!(!ErrorKind::ValidationFailed.is_retriable());
    }

    #[test]
    fn not_found_user_message_mentions_id() {
        let err = OrkestraError::not_found("exec-1");
        assert!(err.user_message().contains("exec-1"));
    }

    #[test]
    fn severity_classification() {
        assert_eq!(OrkestraError::queue_full().severity(), "info");
        assert_eq!(OrkestraError::worker_lost("w1").severity(), "critical");
    }
}
