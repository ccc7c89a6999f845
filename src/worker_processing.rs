use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::CoordError;
use crate::messaging::LogChannel;
use crate::models::{ProgressReport, ProgressStatus};

static STEPS: [u8; 4] = [20, 40, 60, 80];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
  Completed,
  /// Ownership moved to another instance while the task was running.
  Abandoned,
}

fn report(task_id: &str, status: ProgressStatus, progress: u8, message: String) -> ProgressReport {
  ProgressReport {
    task_id: task_id.to_string(),
    status,
    progress,
    message: Some(message),
    actual_hours: None,
  }
}

/// Simulated execution: a few timed steps, each reported on the channel,
/// then completion. Stops quietly if the instance loses the task.
pub async fn execute_task<C: LogChannel>(
  coordinator: &Coordinator<C>,
  task_id: &str,
  step: Duration,
) -> Result<Execution, CoordError> {
  let worker_id = coordinator.id();
  info!("Worker {}: Processing task {}", worker_id, task_id);

  for progress in STEPS {
    sleep(step).await;
    let update = report(task_id, ProgressStatus::InProgress, progress, format!("{progress}% done"));
    match coordinator.report_progress(update, Utc::now()).await {
      Ok(()) => {}
      Err(CoordError::NotOwner { .. }) => {
        warn!("Worker {}: lost task {} at {}%, abandoning", worker_id, task_id, progress);
        return Ok(Execution::Abandoned);
      }
      Err(e) => return Err(e),
    }
  }

  sleep(step).await;
  let done = report(task_id, ProgressStatus::Completed, 100, "completed".to_string());
  match coordinator.report_progress(done, Utc::now()).await {
    Ok(()) => {
      info!("Worker {}: Completed task {}", worker_id, task_id);
      Ok(Execution::Completed)
    }
    Err(CoordError::NotOwner { .. }) => Ok(Execution::Abandoned),
    Err(e) => Err(e),
  }
}

/// Marks a task failed after an execution error so it is not left dangling
/// until the reclaim timeout.
pub async fn fail_task<C: LogChannel>(coordinator: &Coordinator<C>, task_id: &str, reason: &str) -> Result<(), CoordError> {
  warn!("Worker {}: task {} failed: {}", coordinator.id(), task_id, reason);
  coordinator
    .report_progress(report(task_id, ProgressStatus::Failed, 0, reason.to_string()), Utc::now())
    .await
}
