//! Priority-queued, auto-scaling execution engine for third-party workflow
//! adapters: a worker pool drives executions through a retry and
//! circuit-breaker fault-tolerance layer, with a cron scheduler and an
//! event bus layered on top of a stateless orchestration facade.

pub mod adapter;
pub mod concurrency;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod facade;
pub mod queue;
pub mod resilience;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use error::{ErrorKind, OrkestraError, OrkestraResult};
pub use facade::OrchestrationFacade;
