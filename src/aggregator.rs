//! Turns a replayed view into the read-only snapshot dashboards consume.
//!
//! Nothing here is stored between cycles: metrics and per-instance stats are
//! recomputed from the task and instance projections every pass.

use std::fmt::Write as _;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::ProtocolConfig;
use crate::models::{Alert, Instance, InstanceStats, InstanceStatus, Liveness, Snapshot, SystemMetrics, Task, TaskStatus};
use crate::view::ProtocolView;

pub fn build_snapshot(view: &ProtocolView, alerts: Vec<Alert>, decode_errors: usize, config: &ProtocolConfig) -> Snapshot {
  let messages = view.messages();
  let skip = messages.len().saturating_sub(config.message_limit);
  Snapshot {
    instances: instances(view, config),
    tasks: view.graph().tasks().cloned().collect(),
    messages: messages[skip..].to_vec(),
    alerts,
    metrics: system_metrics(view, decode_errors, config),
    timestamp: view.now(),
  }
}

pub fn system_metrics(view: &ProtocolView, decode_errors: usize, config: &ProtocolConfig) -> SystemMetrics {
  let now = view.now();
  let threshold = config.blocked_threshold_delta();
  let mut metrics = SystemMetrics {
    total_tasks: view.graph().len(),
    total_instances: view.cluster().len(),
    active_instances: view.live_instances().len(),
    leader_id: view.leader().map(str::to_string),
    velocity: velocity(view.graph().tasks(), now, config.velocity_window_delta()),
    claim_conflicts: view.ledger().evidence().values().map(Vec::len).sum(),
    decode_errors,
    ..SystemMetrics::default()
  };

  for task in view.graph().tasks() {
    match task.status {
      TaskStatus::Pending => metrics.pending_tasks += 1,
      TaskStatus::InProgress => metrics.in_progress_tasks += 1,
      TaskStatus::Completed => metrics.completed_tasks += 1,
      TaskStatus::Failed => metrics.failed_tasks += 1,
      TaskStatus::Blocked => {
        metrics.blocked_tasks += 1;
        if task.blocked_since.is_some_and(|since| now - since > threshold) {
          metrics.bottlenecks += 1;
        }
      }
    }
  }
  if metrics.total_tasks > 0 {
    metrics.completion_percentage = metrics.completed_tasks as f64 / metrics.total_tasks as f64 * 100.0;
  }
  metrics
}

pub fn instance_stats(view: &ProtocolView, instance_id: &str, config: &ProtocolConfig) -> InstanceStats {
  let owned: Vec<&Task> = view
    .graph()
    .tasks()
    .filter(|t| t.assigned_to.as_deref() == Some(instance_id))
    .collect();
  let completed: Vec<&Task> = owned.iter().copied().filter(|t| t.status == TaskStatus::Completed).collect();
  let hours: Vec<f64> = completed.iter().filter_map(|t| t.actual_hours).collect();

  InstanceStats {
    tasks_completed: count(completed.len()),
    tasks_failed: count(owned.iter().filter(|t| t.status == TaskStatus::Failed).count()),
    avg_completion_hours: (!hours.is_empty()).then(|| hours.iter().sum::<f64>() / hours.len() as f64),
    recent_velocity: velocity(completed.into_iter(), view.now(), config.velocity_window_delta()),
    quality_score: None,
  }
}

/// One projection per announced instance, ordered by id. An instance that
/// never said goodbye but stopped heartbeating is shown as failed.
pub fn instances(view: &ProtocolView, config: &ProtocolConfig) -> Vec<Instance> {
  let now = view.now();
  let dead_after = config.dead_after_delta();
  view
    .cluster()
    .nodes()
    .map(|node| {
      let liveness = node.liveness_at(now, dead_after);
      let mut status = node.status_at(now);
      if !status.is_terminal() && liveness == Liveness::SuspectedDead {
        status = InstanceStatus::Failed;
      }
      Instance {
        id: node.id.clone(),
        status,
        liveness,
        is_leader: view.leader() == Some(node.id.as_str()),
        workload: view.workload(&node.id),
        max_concurrent_tasks: node.max_concurrent_tasks,
        current_tasks: view.owned_tasks(&node.id).map(|t| t.id.clone()).collect(),
        skills: node.skills.clone(),
        stats: instance_stats(view, &node.id, config),
        started_at: node.started_at,
        last_heartbeat: node.heartbeat_at_or_before(now),
      }
    })
    .collect()
}

/// Completed tasks per hour over the trailing window.
fn velocity<'a>(tasks: impl Iterator<Item = &'a Task>, now: DateTime<Utc>, window: TimeDelta) -> f64 {
  let hours = window.num_milliseconds() as f64 / 3_600_000.0;
  if hours <= 0.0 {
    return 0.0;
  }
  let done = tasks
    .filter(|t| t.status == TaskStatus::Completed)
    .filter(|t| t.completed_at.is_some_and(|at| at <= now && now - at < window))
    .count();
  done as f64 / hours
}

fn count(n: usize) -> u32 {
  u32::try_from(n).unwrap_or(u32::MAX)
}

/// Prometheus text exposition of the cluster metrics.
pub fn render_prometheus(metrics: &SystemMetrics) -> String {
  let mut out = String::new();
  gauge(&mut out, "logmesh_tasks_total", "Tasks known to the cluster", metrics.total_tasks as f64);

  let _ = writeln!(out, "# HELP logmesh_tasks Tasks by status");
  let _ = writeln!(out, "# TYPE logmesh_tasks gauge");
  for (status, value) in [
    ("pending", metrics.pending_tasks),
    ("in_progress", metrics.in_progress_tasks),
    ("completed", metrics.completed_tasks),
    ("failed", metrics.failed_tasks),
    ("blocked", metrics.blocked_tasks),
  ] {
    let _ = writeln!(out, "logmesh_tasks{{status=\"{status}\"}} {value}");
  }

  gauge(&mut out, "logmesh_instances_total", "Announced instances", metrics.total_instances as f64);
  gauge(&mut out, "logmesh_instances_active", "Instances with a recent heartbeat", metrics.active_instances as f64);
  gauge(&mut out, "logmesh_leader_present", "1 when a leader can be computed", f64::from(u8::from(metrics.leader_id.is_some())));
  gauge(&mut out, "logmesh_velocity_tasks_per_hour", "Completed tasks per hour", metrics.velocity);
  gauge(&mut out, "logmesh_bottlenecks", "Tasks blocked beyond the threshold", metrics.bottlenecks as f64);
  gauge(&mut out, "logmesh_completion_percentage", "Share of tasks completed", metrics.completion_percentage);
  gauge(&mut out, "logmesh_claim_conflicts", "Conflicting claim and progress messages", metrics.claim_conflicts as f64);
  gauge(&mut out, "logmesh_decode_errors", "Channel entries that failed to decode", metrics.decode_errors as f64);
  out
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
  let _ = writeln!(out, "# HELP {name} {help}");
  let _ = writeln!(out, "# TYPE {name} gauge");
  let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{Announcement, ClaimTarget, Message, Payload, ProgressReport, ProgressStatus, Pulse, TaskList, TaskSpec};
  use chrono::TimeZone;
  use std::time::Duration;

  fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
  }

  fn config() -> ProtocolConfig {
    ProtocolConfig {
      heartbeat_interval: Duration::from_secs(5),
      dead_after: Duration::from_secs(30),
      reclaim_after: Duration::from_secs(600),
      blocked_threshold: Duration::from_secs(60),
      velocity_window: Duration::from_secs(3600),
      message_limit: 3,
      ..ProtocolConfig::default()
    }
  }

  fn history() -> Vec<Message> {
    let mut history = Vec::new();
    for (id, last_hb) in [("a", 95), ("b", 95), ("z", 10)] {
      history.push(Message::new(
        id,
        at(0),
        Payload::NodeAnnounce(Announcement {
          status: InstanceStatus::Active,
          skills: vec!["rust".into()],
          max_concurrent_tasks: 2,
          started_at: at(0),
        }),
      ));
      history.push(Message::new(id, at(last_hb), Payload::Heartbeat(Pulse::default())));
    }
    history.push(Message::new(
      "a",
      at(1),
      Payload::TasksData(TaskList {
        tasks: vec![
          TaskSpec::new("T1", "schema"),
          TaskSpec::new("T2", "api").depends_on(&["T3"]),
          TaskSpec::new("T3", "auth"),
          TaskSpec::new("T4", "docs"),
        ],
      }),
    ));
    history.push(Message::new("a", at(2), Payload::Claim(ClaimTarget { task_id: "T1".into() })));
    history.push(Message::new(
      "a",
      at(20),
      Payload::Progress(ProgressReport {
        task_id: "T1".into(),
        status: ProgressStatus::Completed,
        progress: 100,
        message: None,
        actual_hours: Some(0.5),
      }),
    ));
    history.push(Message::new("b", at(3), Payload::Claim(ClaimTarget { task_id: "T3".into() })));
    history.push(Message::new("a", at(4), Payload::Claim(ClaimTarget { task_id: "T3".into() })));
    history
  }

  #[test]
  fn metrics_count_tasks_by_status() {
    let view = ProtocolView::replay(history(), at(100), &config());
    let metrics = system_metrics(&view, 2, &config());
    assert_eq!(metrics.total_tasks, 4);
    assert_eq!(metrics.completed_tasks, 1);
    assert_eq!(metrics.in_progress_tasks, 1);
    assert_eq!(metrics.pending_tasks, 1);
    assert_eq!(metrics.blocked_tasks, 1);
    assert_eq!(metrics.bottlenecks, 1);
    assert_eq!(metrics.completion_percentage, 25.0);
    assert_eq!(metrics.velocity, 1.0);
    assert_eq!(metrics.total_instances, 3);
    assert_eq!(metrics.active_instances, 2);
    assert_eq!(metrics.leader_id.as_deref(), Some("a"));
    assert_eq!(metrics.claim_conflicts, 1);
    assert_eq!(metrics.decode_errors, 2);
  }

  #[test]
  fn blocked_tasks_become_bottlenecks_only_after_the_threshold() {
    let view = ProtocolView::replay(history(), at(40), &config());
    assert_eq!(system_metrics(&view, 0, &config()).bottlenecks, 0);
  }

  #[test]
  fn instances_carry_stats_and_inferred_failure() {
    let view = ProtocolView::replay(history(), at(100), &config());
    let instances = instances(&view, &config());
    let ids: Vec<_> = instances.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "z"]);

    let a = &instances[0];
    assert!(a.is_leader);
    assert_eq!(a.stats.tasks_completed, 1);
    assert_eq!(a.stats.avg_completion_hours, Some(0.5));
    assert_eq!(a.stats.quality_score, None);
    assert!(a.current_tasks.is_empty());

    let b = &instances[1];
    assert_eq!(b.current_tasks, vec!["T3".to_string()]);
    assert_eq!(b.workload, 1);
    assert_eq!(b.status, InstanceStatus::Active);

    let z = &instances[2];
    assert_eq!(z.liveness, Liveness::SuspectedDead);
    assert_eq!(z.status, InstanceStatus::Failed);
    assert_eq!(z.last_heartbeat, Some(at(10)));
  }

  #[test]
  fn snapshot_keeps_the_latest_messages() {
    let view = ProtocolView::replay(history(), at(100), &config());
    let snapshot = build_snapshot(&view, Vec::new(), 0, &config());
    assert_eq!(snapshot.messages.len(), 3);
    assert_eq!(snapshot.messages.last().map(|m| m.timestamp), Some(at(95)));
    assert_eq!(snapshot.timestamp, at(100));
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["metrics"]["total_tasks"], 4);
    assert_eq!(json["messages"][0]["kind"], "progress");
  }

  #[test]
  fn prometheus_text_lists_every_gauge() {
    let view = ProtocolView::replay(history(), at(100), &config());
    let text = render_prometheus(&system_metrics(&view, 0, &config()));
    assert!(text.contains("# TYPE logmesh_tasks gauge"));
    assert!(text.contains("logmesh_tasks{status=\"blocked\"} 1\n"));
    assert!(text.contains("logmesh_instances_active 2\n"));
    assert!(text.contains("logmesh_leader_present 1\n"));
  }
}
