//! Task dispatch: enqueue-with-delay, per-user rate limiting, and an inline
//! mode that runs tasks synchronously for tests and no-queue deployments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::protocol::Protocol;
use crate::report;

/// Grace period before a delete is applied, so an unbridge-then-delete burst
/// doesn't race its own earlier activities.
pub const DELETE_TASK_DELAY: Duration = Duration::seconds(90);

/// Minimum spacing between one user's tasks, per queue. Queues not listed
/// are not rate limited.
const PER_USER_TASK_RATES: &[(&str, Duration)] = &[("receive", Duration::seconds(10))];

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub queue: String,
    pub params: Value,
    #[serde(default)]
    pub authed_as: Option<String>,
    pub eta: DateTime<Utc>,
}

/// Payload of a `receive` task: one event pulled off a firehose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveTask {
    pub id: String,
    pub source_protocol: Protocol,
    #[serde(default)]
    pub bsky: Option<Value>,
    #[serde(default)]
    pub nostr: Option<Value>,
    #[serde(default)]
    pub our_as1: Option<Value>,
    /// The event's signing identity. Must match the author the payload claims.
    pub authed_as: String,
    #[serde(default)]
    pub received_at: Option<String>,
}

/// The durable task transport. An external queue service in production; the
/// in-process implementation below otherwise.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<()>;
}

/// Runs tasks synchronously in inline mode.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: Task) -> Result<()>;
}

/// tokio-mpsc backed queue. Delayed tasks are parked on the runtime until
/// their eta.
pub struct InProcessQueue {
    tx: tokio::sync::mpsc::UnboundedSender<Task>,
}

impl InProcessQueue {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(InProcessQueue { tx }), rx)
    }
}

#[async_trait]
impl TaskQueue for InProcessQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let delay = (task.eta - Utc::now()).to_std().unwrap_or_default();
        let tx = self.tx.clone();
        if delay.is_zero() {
            tx.send(task).map_err(|e| CoreError::TaskQueue(e.to_string()))?;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(task);
            });
        }
        Ok(())
    }
}

enum Mode {
    Queued(Arc<dyn TaskQueue>),
    Inline(Arc<dyn TaskRunner>),
}

/// The single entry point for scheduling work.
pub struct Dispatcher {
    mode: Mode,
    /// Last slot handed out per `{queue} {user}`.
    slots: DashMap<String, DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Dispatcher { mode: Mode::Queued(queue), slots: DashMap::new() }
    }

    /// Inline mode: tasks run synchronously inside `create_task`, delays and
    /// rate limits are recorded but not waited on.
    pub fn inline(runner: Arc<dyn TaskRunner>) -> Self {
        Dispatcher { mode: Mode::Inline(runner), slots: DashMap::new() }
    }

    /// Earliest slot the given user may schedule into on `queue`. The first
    /// task runs immediately; every later one lands one rate increment past
    /// the previous slot, or past `now` once the backlog has drained.
    /// Missing `authed_as` and unlisted queues bypass the limit.
    pub fn next_slot(
        &self,
        queue: &str,
        authed_as: Option<&str>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let Some(user) = authed_as else {
            return now;
        };
        let Some((_, rate)) = PER_USER_TASK_RATES.iter().find(|(q, _)| *q == queue) else {
            return now;
        };
        match self.slots.entry(format!("{queue} {user}")) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                now
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let slot = (*entry.get()).max(now) + *rate;
                entry.insert(slot);
                slot
            }
        }
    }

    /// Schedules `params` onto `queue`. Errors are reported, never returned;
    /// a failed enqueue must not fail the caller's request.
    pub async fn create_task(
        &self,
        queue: &str,
        params: Value,
        delay: Option<Duration>,
        authed_as: Option<&str>,
    ) {
        let now = Utc::now();
        let eta = self.next_slot(queue, authed_as, now) + delay.unwrap_or_else(Duration::zero);
        let task = Task {
            queue: queue.to_string(),
            params,
            authed_as: authed_as.map(str::to_string),
            eta,
        };
        tracing::debug!(queue, authed_as, eta = %eta, "created task");
        let result = match &self.mode {
            Mode::Queued(q) => q.enqueue(task).await,
            Mode::Inline(runner) => runner.run(task).await,
        };
        if let Err(err) = result {
            report::error(queue, &err);
        }
    }
}
