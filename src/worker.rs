use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use futures::future::join_all;
use logmesh::{
  config::Config,
  coordinator::{Coordinator, Observer},
  database::{PgChannel, setup_database},
  graph::TaskGraph,
  leader::Role,
  messaging::LogChannel,
  models::{TaskList, TaskSpec},
  worker_processing::{Execution, execute_task, fail_task},
};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

static STEP: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let identity = config.identity.clone().context("INSTANCE_ID is required to run a worker")?;
  let tasks = match &config.tasks_path {
    Some(path) => load_tasks(path)?,
    None => Vec::new(),
  };

  let db_pool = setup_database(&config.database_url).await?;
  let channel = PgChannel::new(db_pool, config.channel_name.clone());
  let observer = Arc::new(Observer::new(channel, config.protocol.clone()));
  let semaphore = Arc::new(Semaphore::new(identity.max_concurrent_tasks as usize));
  let coordinator = Arc::new(Coordinator::register(observer, identity, Utc::now()).await?);

  let (stop_tx, stop_rx) = watch::channel(false);
  let reconciler = tokio::spawn(reconcile_loop(coordinator.clone(), semaphore, tasks, stop_rx));

  let mut heartbeat = tokio::time::interval(config.protocol.heartbeat_interval);
  let mut claims = tokio::time::interval(config.protocol.poll_interval);
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);
  loop {
    tokio::select! {
      _ = heartbeat.tick() => {
        if let Err(e) = coordinator.heartbeat(Utc::now()).await {
          warn!("Heartbeat failed: {}", e);
        }
      }
      _ = claims.tick() => {
        match coordinator.claim_next(Utc::now()).await {
          Ok(Some(task_id)) => info!("Reserved {}, waiting out the claim window", task_id),
          Ok(None) => {}
          Err(e) => warn!("Claim attempt failed: {}", e),
        }
      }
      _ = &mut ctrl_c => break,
    }
  }

  info!("Worker {} stopping", coordinator.id());
  coordinator.shutdown(Utc::now()).await?;
  let _ = stop_tx.send(true);
  if let Err(e) = reconciler.await {
    error!("Reconcile loop ended abnormally: {}", e);
  }
  Ok(())
}

/// The read side of the worker. Owns every spawned execution so shutdown
/// can wait for them.
async fn reconcile_loop<C: LogChannel>(
  coordinator: Arc<Coordinator<C>>,
  semaphore: Arc<Semaphore>,
  tasks: Vec<TaskSpec>,
  mut stop: watch::Receiver<bool>,
) {
  let mut ticker = tokio::time::interval(coordinator.observer().config().poll_interval);
  let mut running: Vec<JoinHandle<()>> = Vec::new();
  loop {
    tokio::select! {
      _ = ticker.tick() => {}
      _ = stop.changed() => break,
    }
    let now = Utc::now();
    let report = match coordinator.reconcile(now).await {
      Ok(report) => report,
      Err(e) => {
        warn!("Reconcile failed: {}", e);
        continue;
      }
    };
    for conflict in &report.released {
      info!("Released {} after losing to {}", conflict.task_id, conflict.winner);
    }
    if report.role == Some(Role::Leader) {
      publish_missing(&coordinator, &tasks).await;
    }
    if let Err(e) = coordinator.flush_outbox(now).await {
      warn!("Could not flush outbox: {}", e);
    }
    for task_id in report.confirmed {
      running.push(spawn_execution(coordinator.clone(), semaphore.clone(), task_id));
    }
    running.retain(|handle| !handle.is_finished());
  }

  info!("Waiting for {} running tasks", running.len());
  join_all(running).await;
}

async fn publish_missing<C: LogChannel>(coordinator: &Coordinator<C>, tasks: &[TaskSpec]) {
  let Some(view) = coordinator.observer().view() else { return };
  if tasks.is_empty() || tasks.iter().all(|t| view.graph().get(&t.id).is_some()) {
    return;
  }
  if let Err(e) = coordinator.publish_tasks(tasks.to_vec(), Utc::now()).await {
    error!("Failed to publish task list: {}", e);
  }
}

fn spawn_execution<C: LogChannel>(coordinator: Arc<Coordinator<C>>, semaphore: Arc<Semaphore>, task_id: String) -> JoinHandle<()> {
  tokio::spawn(async move {
    let Ok(_permit) = semaphore.acquire_owned().await else { return };
    match execute_task(&coordinator, &task_id, STEP).await {
      Ok(Execution::Completed) => {}
      Ok(Execution::Abandoned) => info!("Task {} handed over to another instance", task_id),
      Err(e) => {
        error!("Processing failed for task {}: {}", task_id, e);
        if let Err(e) = fail_task(&coordinator, &task_id, &e.to_string()).await {
          error!("Could not mark task {} failed: {}", task_id, e);
        }
      }
    }
  })
}

fn load_tasks(path: &str) -> Result<Vec<TaskSpec>> {
  let raw = std::fs::read_to_string(path).with_context(|| format!("reading task list {path}"))?;
  let list: TaskList = serde_json::from_str(&raw).with_context(|| format!("parsing task list {path}"))?;
  if let Some(cycle) = TaskGraph::from_specs(&list.tasks, Utc::now()).cycles().first() {
    bail!("task list {path} is unusable: {cycle}");
  }
  info!("Loaded {} tasks from {}", list.tasks.len(), path);
  Ok(list.tasks)
}
