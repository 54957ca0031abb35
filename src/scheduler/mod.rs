//! Cron scheduler: holds a set of schedules, sleeps until the earliest
//! next-fire instant, and submits an execution request when it fires.
//! At-most-once-per-interval semantics: a missed instant after a clock
//! jump is never back-fired, only the next future instant is computed.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronExpr;
use parking_lot::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{ExecutionRequest, Priority, WorkflowDefinition, WorkflowParameters};
use crate::error::{ErrorKind, OrkestraError, OrkestraResult};
use crate::events::SharedEventBus;
use crate::queue::SharedQueue;

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: String,
    pub cron_expression: String,
    pub timezone: Tz,
    pub workflow: WorkflowDefinition,
    pub parameters: WorkflowParameters,
    pub priority: Priority,
    pub enabled: bool,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
}

impl Schedule {
    fn parsed_expr(&self) -> OrkestraResult<CronExpr> {
        CronExpr::from_str(&self.cron_expression)
            .map_err(|e| OrkestraError::validation_failed(format!("invalid cron expression: {e}")))
    }

    /// Computes the first fire instant strictly after `after`, in the
    /// schedule's configured timezone.
    fn compute_next_fire(&self, after: DateTime<Utc>) -> OrkestraResult<Option<DateTime<Utc>>> {
        let expr = self.parsed_expr()?;
        let local_after = after.with_timezone(&self.timezone);
        Ok(expr
            .after(&local_after)
            .next()
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

/// Holds schedules and drives a single timer at the earliest next-fire
/// instant across all enabled schedules.
pub struct CronScheduler {
    schedules: RwLock<HashMap<String, Schedule>>,
    queue: SharedQueue,
    events: SharedEventBus,
}

impl CronScheduler {
    pub fn new(queue: SharedQueue, events: SharedEventBus) -> Self {
        Self {
            schedules: RwLock::new(HashMap::new()),
            queue,
            events,
        }
    }

    /// Registers a schedule and computes its initial next-fire time from
    /// now. Returns the generated schedule id.
    pub fn add_schedule(
        &self,
        cron_expression: impl Into<String>,
        timezone: Tz,
        workflow: WorkflowDefinition,
        parameters: WorkflowParameters,
        priority: Priority,
    ) -> OrkestraResult<String> {
        let id = Uuid::new_v4().to_string();
        let mut schedule = Schedule {
            id: id.clone(),
            cron_expression: cron_expression.into(),
            timezone,
            workflow,
            parameters,
            priority,
            enabled: true,
            next_fire: None,
            last_fire: None,
        };
        schedule.next_fire = schedule.compute_next_fire(Utc::now())?;
        self.schedules.write().insert(id.clone(), schedule);
        Ok(id)
    }

    pub fn remove_schedule(&self, id: &str) -> bool {
        self.schedules.write().remove(id).is_some()
    }

    /// Pauses firing without losing schedule identity.
    pub fn disable(&self, id: &str) -> bool {
        if let Some(schedule) = self.schedules.write().get_mut(id) {
            schedule.enabled = false;
            true
        } else {
            false
        }
    }

    pub fn enable(&self, id: &str) -> OrkestraResult<bool> {
        let mut schedules = self.schedules.write();
        let Some(schedule) = schedules.get_mut(id) else {
            return Ok(false);
        };
        schedule.enabled = true;
        schedule.next_fire = schedule.compute_next_fire(Utc::now())?;
        Ok(true)
    }

    pub fn list(&self) -> Vec<Schedule> {
        self.schedules.read().values().cloned().collect()
    }

    /// Earliest next-fire instant across enabled schedules, if any.
    fn earliest_next_fire(&self) -> Option<DateTime<Utc>> {
        self.schedules
            .read()
            .values()
            .filter(|s| s.enabled)
            .filter_map(|s| s.next_fire)
            .min()
    }

    /// Drives the timer loop until `cancel` fires. Call as a long-lived
    /// background task from the orchestration facade's `start`.
    pub async fn run(&self, cancel: crate::concurrency::CancelToken) {
        loop {
            let sleep_duration = match self.earliest_next_fire() {
                Some(fire_at) => {
                    let now = Utc::now();
                    (fire_at - now).to_std().unwrap_or(std::time::Duration::ZERO)
                }
                None => std::time::Duration::from_secs(3600),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.fire_due_schedules().await;
                }
                _ = cancel.cancelled() => {
                    return;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn fire_due_schedules(&self) {
        let now = Utc::now();
        let due_ids: Vec<String> = self
            .schedules
            .read()
            .iter()
            .filter(|(_, s)| s.enabled && s.next_fire.map(|f| f <= now).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();

        for id in due_ids {
            self.fire_one(&id, now).await;
        }
    }

    async fn fire_one(&self, id: &str, fire_time: DateTime<Utc>) {
        let snapshot = self.schedules.read().get(id).cloned();
        let Some(schedule) = snapshot else { return };

        let mut request = ExecutionRequest::new(schedule.workflow.clone(), schedule.parameters.clone());
        request.priority = schedule.priority;
        request.caller_id = "scheduler".to_string();

        let enqueue_result = self.queue.enqueue(request);
        if let Err(err) = &enqueue_result {
            warn!(schedule_id = %id, error = %err, "scheduled submission failed");
            self.events.schedule_error(id, err.to_string());
        } else {
            info!(schedule_id = %id, "scheduled execution submitted");
        }

        let mut schedules = self.schedules.write();
        if let Some(schedule) = schedules.get_mut(id) {
            schedule.last_fire = Some(fire_time);
            // Advance regardless of submission outcome: a queue-full
            // rejection must not cause the same instant to fire again.
            schedule.next_fire = schedule.compute_next_fire(fire_time).ok().flatten();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EngineType;
    use std::collections::HashMap;

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: None,
            name: "scheduled".into(),
            description: None,
            engine_type: EngineType::Airflow,
            definition: serde_json::json!({}),
            version: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn add_schedule_computes_next_fire() {
        let queue = Arc::new(crate::queue::PriorityQueue::new(10));
        let events = Arc::new(crate::events::EventBus::new(8));
        let scheduler = CronScheduler::new(queue, events);
        let id = scheduler
            .add_schedule("*/5 * * * * *", Tz::UTC, workflow(), HashMap::new(), Priority::Normal)
            .unwrap();
        let schedules = scheduler.list();
        let schedule = schedules.iter().find(|s| s.id == id).unwrap();
        assert!(schedule.next_fire.is_some());
    }

    #[test]
    fn disable_pauses_without_removing() {
        let queue = Arc::new(crate::queue::PriorityQueue::new(10));
        let events = Arc::new(crate::events::EventBus::new(8));
        let scheduler = CronScheduler::new(queue, events);
        let id = scheduler
            .add_schedule("*/5 * * * * *", Tz::UTC, workflow(), HashMap::new(), Priority::Normal)
            .unwrap();
        assert!(scheduler.disable(&id));
        let schedules = scheduler.list();
        let schedule = schedules.iter().find(|s| s.id == id).unwrap();
        assert!(!schedule.enabled);
        assert!(scheduler.earliest_next_fire().is_none());
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let queue = Arc::new(crate::queue::PriorityQueue::new(10));
        let events = Arc::new(crate::events::EventBus::new(8));
        let scheduler = CronScheduler::new(queue, events);
        let err = scheduler
            .add_schedule("not a cron expr", Tz::UTC, workflow(), HashMap::new(), Priority::Normal)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);
    }
}
