use std::time::Duration;

use async_trait::async_trait;
use prism_api::{PrismClient, Task, TaskStatus};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Where task status comes from.
#[async_trait]
pub trait TaskSource: Send + Sync + 'static {
    async fn task(&self, task_id: &str) -> prism_api::Result<Task>;
}

#[async_trait]
impl TaskSource for PrismClient {
    async fn task(&self, task_id: &str) -> prism_api::Result<Task> {
        self.get_task(task_id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// The backend reported failure; carries its detail.
    Failed(String),
    /// No terminal state within the window. The task may still finish.
    TimedOut,
}

/// Polls an asynchronous cluster task until it is terminal or the window closes.
pub struct TaskPoller<S = PrismClient> {
    source: S,
    interval: Duration,
}

impl<S: TaskSource> TaskPoller<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self { source, interval }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Poll `task_id` every interval. Transient failures (connection errors,
    /// 5xx, truncated bodies) are retried until the deadline; a definite
    /// rejection such as 401 or 404 is returned as-is.
    pub async fn wait(&self, task_id: &str, timeout: Duration) -> Result<TaskOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.source.task(task_id)).await {
                Err(_) => break,
                Ok(Ok(task)) => match task.status {
                    TaskStatus::Succeeded => return Ok(TaskOutcome::Succeeded),
                    TaskStatus::Failed | TaskStatus::Aborted => {
                        let detail = task
                            .error_detail
                            .filter(|d| !d.is_empty())
                            .unwrap_or_else(|| format!("task ended as {:?}", task.status));
                        return Ok(TaskOutcome::Failed(detail));
                    }
                    status => debug!(
                        task_id,
                        ?status,
                        progress = ?task.percentage_complete,
                        "task still in flight"
                    ),
                },
                Ok(Err(e)) if e.is_transient() => {
                    warn!(task_id, "task poll failed, retrying: {e}");
                }
                Ok(Err(e)) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }

        warn!(task_id, timeout_secs = timeout.as_secs(), "task wait timed out");
        Ok(TaskOutcome::TimedOut)
    }

    /// `wait`, with failure and timeout turned into errors.
    pub async fn finish(&self, task_id: &str, timeout: Duration) -> Result<()> {
        match self.wait(task_id, timeout).await? {
            TaskOutcome::Succeeded => Ok(()),
            TaskOutcome::Failed(detail) => Err(Error::TaskFailed {
                task_id: task_id.to_string(),
                detail,
            }),
            TaskOutcome::TimedOut => Err(Error::TaskTimedOut {
                task_id: task_id.to_string(),
            }),
        }
    }
}
