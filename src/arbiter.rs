//! Task claiming without locks.
//!
//! Claims are broadcasts, so two instances can claim the same task inside
//! one visibility window. Every reader settles the race the same way from
//! the same history: the earliest claim wins, ties go to the smallest sender
//! id, and ownership only changes hands again once the owner is reclaimable.
//! A reclaimed owner's late reports are stale (last claim wins, not last
//! write).

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::cluster::ClusterView;
use crate::config::ProtocolConfig;
use crate::graph::TaskGraph;
use crate::models::{Liveness, Message, Payload, ProgressReport, ProgressStatus, TaskStatus};
use crate::view::ProtocolView;

/// How one `claim` message fared in the replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ClaimOutcome {
  Won,
  /// The sender already owned the task.
  Duplicate,
  Lost { winner: String },
  /// Made before every dependency had completed.
  Premature,
  /// The task had already completed or failed.
  Closed,
  UnknownTask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EvidenceKind {
  LostClaim { winner: String },
  StaleProgress { owner: Option<String> },
}

/// A message showing two instances acting on the same task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictEvidence {
  pub message_id: String,
  pub sender_id: String,
  pub timestamp: DateTime<Utc>,
  pub kind: EvidenceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reclaim {
  pub task_id: String,
  pub from: String,
  pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimLedger {
  outcomes: HashMap<String, ClaimOutcome>,
  evidence: BTreeMap<String, Vec<ConflictEvidence>>,
  reclaims: Vec<Reclaim>,
}

struct Owner {
  id: String,
  claimed_at: DateTime<Utc>,
}

impl ClaimLedger {
  /// Replays every claim and progress report against the graph, writing
  /// ownership and progress into its tasks. Tasks are settled dependencies
  /// first so a claim can be checked against the completion time of the
  /// tasks it waits on.
  pub fn resolve(
    messages: &[Message],
    cluster: &ClusterView,
    graph: &mut TaskGraph,
    now: DateTime<Utc>,
    config: &ProtocolConfig,
  ) -> Self {
    let mut per_task: HashMap<&str, Vec<&Message>> = HashMap::new();
    for message in messages {
      if let Some(task_id) = message.payload.task_id() {
        per_task.entry(task_id).or_default().push(message);
      }
    }
    for events in per_task.values_mut() {
      events.sort_by(|a, b| event_key(a).cmp(&event_key(b)));
    }

    let mut ledger = Self::default();
    let order = graph.topological_order().to_vec();
    let settled: HashSet<&str> = order.iter().map(String::as_str).collect();
    for task_id in &order {
      if let Some(events) = per_task.get(task_id.as_str()) {
        ledger.replay_task(task_id, events, cluster, graph, now, config);
      }
    }

    // tasks on a dependency cycle, or never published
    for (task_id, events) in &per_task {
      if settled.contains(task_id) {
        continue;
      }
      let outcome = if graph.get(task_id).is_some() { ClaimOutcome::Premature } else { ClaimOutcome::UnknownTask };
      for message in events.iter().filter(|m| matches!(m.payload, Payload::Claim(_))) {
        ledger.outcomes.insert(message.id.clone(), outcome.clone());
      }
    }
    ledger
  }

  fn replay_task(
    &mut self,
    task_id: &str,
    events: &[&Message],
    cluster: &ClusterView,
    graph: &mut TaskGraph,
    now: DateTime<Utc>,
    config: &ProtocolConfig,
  ) {
    let mut owner: Option<Owner> = None;

    for message in events.iter().filter(|m| m.timestamp <= now) {
      let Some(task) = graph.get(task_id) else { return };
      let closed = task.status.is_closed();
      match &message.payload {
        Payload::Claim(_) => {
          let deps_met = graph.dependencies_met(task, Some(message.timestamp));
          let outcome = match &owner {
            _ if closed => ClaimOutcome::Closed,
            Some(current) if current.id == message.sender_id => ClaimOutcome::Duplicate,
            Some(current) if reclaimable(cluster, current, message.timestamp, config) => {
              info!("Task {} reclaimed from {} by {}", task_id, current.id, message.sender_id);
              self.reclaims.push(Reclaim {
                task_id: task_id.to_string(),
                from: current.id.clone(),
                at: message.timestamp,
              });
              ClaimOutcome::Won
            }
            Some(current) => {
              self.record(task_id, message, EvidenceKind::LostClaim { winner: current.id.clone() });
              ClaimOutcome::Lost { winner: current.id.clone() }
            }
            None if !deps_met => ClaimOutcome::Premature,
            None => ClaimOutcome::Won,
          };
          if outcome == ClaimOutcome::Won {
            owner = Some(Owner { id: message.sender_id.clone(), claimed_at: message.timestamp });
            if let Some(task) = graph.get_mut(task_id) {
              task.status = TaskStatus::InProgress;
              task.assigned_to = Some(message.sender_id.clone());
              task.started_at = Some(message.timestamp);
              task.progress_percentage = 0;
              task.blocked_since = None;
              task.updated_at = task.updated_at.max(message.timestamp);
            }
          }
          debug!("claim {} on {} by {}: {:?}", message.id, task_id, message.sender_id, outcome);
          self.outcomes.insert(message.id.clone(), outcome);
        }
        Payload::Progress(report) => {
          let from_owner = owner.as_ref().is_some_and(|o| o.id == message.sender_id);
          if from_owner && !closed {
            apply_progress(graph, task_id, report, message.timestamp);
          } else {
            let current = owner.as_ref().map(|o| o.id.clone());
            self.record(task_id, message, EvidenceKind::StaleProgress { owner: current });
          }
        }
        _ => {}
      }
    }

    if let (Some(current), Some(task)) = (&owner, graph.get_mut(task_id)) {
      if task.status == TaskStatus::InProgress && reclaimable(cluster, current, now, config) {
        info!("Task {} released: owner {} is gone", task_id, current.id);
        self.reclaims.push(Reclaim { task_id: task_id.to_string(), from: current.id.clone(), at: now });
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.started_at = None;
        task.progress_percentage = 0;
      }
    }
  }

  fn record(&mut self, task_id: &str, message: &Message, kind: EvidenceKind) {
    self.evidence.entry(task_id.to_string()).or_default().push(ConflictEvidence {
      message_id: message.id.clone(),
      sender_id: message.sender_id.clone(),
      timestamp: message.timestamp,
      kind,
    });
  }

  pub fn outcome(&self, claim_id: &str) -> Option<&ClaimOutcome> {
    self.outcomes.get(claim_id)
  }

  /// Conflict evidence grouped by task id.
  pub fn evidence(&self) -> &BTreeMap<String, Vec<ConflictEvidence>> {
    &self.evidence
  }

  pub fn lost_claims(&self) -> usize {
    self.outcomes.values().filter(|o| matches!(o, ClaimOutcome::Lost { .. })).count()
  }

  pub fn reclaims(&self) -> &[Reclaim] {
    &self.reclaims
  }
}

/// Claims sort before progress from the same sender at the same instant.
fn event_key(message: &Message) -> (DateTime<Utc>, &str, u8, &str) {
  let rank = match message.payload {
    Payload::Claim(_) => 0,
    _ => 1,
  };
  (message.timestamp, message.sender_id.as_str(), rank, message.id.as_str())
}

/// An owner can lose its task once it has reported itself done, or once it
/// has been suspected dead for longer than the reclaim timeout.
fn reclaimable(cluster: &ClusterView, owner: &Owner, at: DateTime<Utc>, config: &ProtocolConfig) -> bool {
  let reclaim_after = config.reclaim_after_delta();
  let Some(node) = cluster.get(&owner.id) else {
    return at - owner.claimed_at > reclaim_after;
  };
  if node.status_at(at).is_terminal() {
    return true;
  }
  if node.liveness_at(at, config.dead_after_delta()) == Liveness::Active {
    return false;
  }
  let reference = node
    .heartbeat_at_or_before(at)
    .map_or(owner.claimed_at, |hb| hb.max(owner.claimed_at));
  at - reference > reclaim_after
}

fn apply_progress(graph: &mut TaskGraph, task_id: &str, report: &ProgressReport, at: DateTime<Utc>) {
  let Some(task) = graph.get_mut(task_id) else { return };
  task.updated_at = task.updated_at.max(at);
  match report.status {
    ProgressStatus::InProgress => {
      task.progress_percentage = report.progress.min(100);
    }
    ProgressStatus::Completed => {
      task.status = TaskStatus::Completed;
      task.progress_percentage = 100;
      task.completed_at = Some(at);
      task.actual_hours = report.actual_hours.or_else(|| {
        task
          .started_at
          .map(|started| (at - started).num_milliseconds() as f64 / 3_600_000.0)
      });
    }
    ProgressStatus::Failed => {
      task.status = TaskStatus::Failed;
      task.progress_percentage = report.progress.min(100);
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectReason {
  UnknownInstance,
  UnknownTask,
  NotPending { status: TaskStatus },
  DependenciesIncomplete { missing: Vec<String> },
  AtCapacity { current: u32, max: u32 },
  MissingSkills { missing: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimDecision {
  Granted,
  Rejected(RejectReason),
}

/// Local precondition check before an instance broadcasts a claim. A grant
/// only means the claim is worth sending; the replay decides who owns it.
pub fn attempt_claim(instance_id: &str, task_id: &str, view: &ProtocolView) -> ClaimDecision {
  use ClaimDecision::Rejected;

  let Some(task) = view.graph().get(task_id) else {
    return Rejected(RejectReason::UnknownTask);
  };
  let Some(node) = view.cluster().get(instance_id) else {
    return Rejected(RejectReason::UnknownInstance);
  };
  match task.status {
    TaskStatus::Pending => {}
    TaskStatus::Blocked => {
      return Rejected(RejectReason::DependenciesIncomplete { missing: view.graph().incomplete_dependencies(task) });
    }
    status => return Rejected(RejectReason::NotPending { status }),
  }
  if !view.graph().dependencies_met(task, None) {
    return Rejected(RejectReason::DependenciesIncomplete { missing: view.graph().incomplete_dependencies(task) });
  }
  let current = view.workload(instance_id);
  if current >= node.max_concurrent_tasks {
    return Rejected(RejectReason::AtCapacity { current, max: node.max_concurrent_tasks });
  }
  if !node.has_skills(&task.required_skills) {
    let missing = task
      .required_skills
      .iter()
      .filter(|skill| !node.has_skills(std::slice::from_ref(*skill)))
      .cloned()
      .collect();
    return Rejected(RejectReason::MissingSkills { missing });
  }
  ClaimDecision::Granted
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{Announcement, ClaimTarget, InstanceStatus, Pulse, TaskList, TaskSpec};
  use chrono::{TimeDelta, TimeZone};
  use std::time::Duration;

  fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
  }

  fn config() -> ProtocolConfig {
    ProtocolConfig {
      heartbeat_interval: Duration::from_secs(5),
      dead_after: Duration::from_secs(30),
      reclaim_after: Duration::from_secs(30),
      claim_window: Duration::from_secs(10),
      ..ProtocolConfig::default()
    }
  }

  fn announce(id: &str, skills: &[&str], max: u32) -> Message {
    Message::new(
      id,
      at(0),
      Payload::NodeAnnounce(Announcement {
        status: InstanceStatus::Active,
        skills: skills.iter().map(|s| s.to_string()).collect(),
        max_concurrent_tasks: max,
        started_at: at(0),
      }),
    )
  }

  fn heartbeats(id: &str, until: i64) -> Vec<Message> {
    (0..=until / 5).map(|i| Message::new(id, at(i * 5), Payload::Heartbeat(Pulse::default()))).collect()
  }

  fn tasks(specs: Vec<TaskSpec>) -> Message {
    Message::new("a", at(0), Payload::TasksData(TaskList { tasks: specs }))
  }

  fn claim_at(id: &str, task: &str, ts: DateTime<Utc>) -> Message {
    Message::new(id, ts, Payload::Claim(ClaimTarget { task_id: task.into() }))
  }

  fn progress(id: &str, task: &str, secs: i64, status: ProgressStatus, pct: u8) -> Message {
    Message::new(
      id,
      at(secs),
      Payload::Progress(ProgressReport { task_id: task.into(), status, progress: pct, message: None, actual_hours: None }),
    )
  }

  fn cluster_of(ids: &[&str], until: i64) -> Vec<Message> {
    let mut history = Vec::new();
    for id in ids {
      history.push(announce(id, &["rust"], 2));
      history.extend(heartbeats(id, until));
    }
    history
  }

  #[test]
  fn earliest_claim_wins_and_loser_is_rejected() {
    let mut history = cluster_of(&["a", "b", "c"], 60);
    history.push(tasks(vec![TaskSpec::new("T1", "x")]));
    let first = claim_at("a", "T1", at(20));
    let second = claim_at("b", "T1", at(20) + TimeDelta::milliseconds(1));
    history.push(second.clone());
    history.push(first.clone());

    let view = ProtocolView::replay(history, at(25), &config());
    let task = view.graph().get("T1").unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.assigned_to.as_deref(), Some("a"));
    assert_eq!(view.ledger().outcome(&first.id), Some(&ClaimOutcome::Won));
    assert_eq!(view.ledger().outcome(&second.id), Some(&ClaimOutcome::Lost { winner: "a".into() }));
    assert_eq!(view.ledger().lost_claims(), 1);
  }

  #[test]
  fn simultaneous_claims_go_to_the_smallest_sender() {
    let mut history = cluster_of(&["a", "b"], 60);
    history.push(tasks(vec![TaskSpec::new("T1", "x")]));
    history.push(claim_at("b", "T1", at(20)));
    history.push(claim_at("a", "T1", at(20)));
    let view = ProtocolView::replay(history, at(25), &config());
    assert_eq!(view.graph().get("T1").unwrap().assigned_to.as_deref(), Some("a"));
  }

  #[test]
  fn exactly_one_owner_at_every_simulated_instant() {
    let mut history = cluster_of(&["a", "b", "c"], 120);
    history.push(tasks(vec![TaskSpec::new("T1", "x")]));
    for (i, id) in ["c", "b", "a", "b", "c"].iter().enumerate() {
      history.push(claim_at(id, "T1", at(20 + i as i64 * 3)));
    }
    for secs in 20..80 {
      let view = ProtocolView::replay(history.clone(), at(secs), &config());
      let owners: Vec<_> = view.graph().tasks().filter_map(|t| t.assigned_to.clone()).collect();
      assert_eq!(owners, vec!["c".to_string()], "at +{secs}s");
    }
  }

  #[test]
  fn silent_owner_loses_task_after_reclaim_timeout() {
    let mut history = cluster_of(&["a", "b"], 120);
    history.push(announce("d", &["rust"], 1));
    history.extend(heartbeats("d", 20));
    history.push(tasks(vec![TaskSpec::new("T1", "x")]));
    history.push(claim_at("d", "T1", at(10)));

    let view = ProtocolView::replay(history.clone(), at(50), &config());
    assert_eq!(view.graph().get("T1").unwrap().assigned_to.as_deref(), Some("d"));

    let view = ProtocolView::replay(history.clone(), at(51), &config());
    let task = view.graph().get("T1").unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assigned_to, None);
    assert_eq!(view.ledger().reclaims().len(), 1);
    assert_eq!(attempt_claim("b", "T1", &view), ClaimDecision::Granted);

    // b takes it over, d's late completion is stale
    let takeover = claim_at("b", "T1", at(52));
    history.push(takeover.clone());
    history.push(progress("d", "T1", 60, ProgressStatus::Completed, 100));
    let view = ProtocolView::replay(history, at(61), &config());
    let task = view.graph().get("T1").unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.assigned_to.as_deref(), Some("b"));
    assert_eq!(view.ledger().outcome(&takeover.id), Some(&ClaimOutcome::Won));
    let evidence = &view.ledger().evidence()["T1"];
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].kind, EvidenceKind::StaleProgress { owner: Some("b".into()) });
  }

  #[test]
  fn completion_closes_the_task() {
    let mut history = cluster_of(&["a", "b"], 60);
    history.push(tasks(vec![TaskSpec::new("T1", "x")]));
    history.push(claim_at("a", "T1", at(10)));
    history.push(progress("a", "T1", 15, ProgressStatus::InProgress, 40));
    let view = ProtocolView::replay(history.clone(), at(16), &config());
    assert_eq!(view.graph().get("T1").unwrap().progress_percentage, 40);

    history.push(progress("a", "T1", 20, ProgressStatus::Completed, 100));
    let late = claim_at("b", "T1", at(30));
    history.push(late.clone());
    let view = ProtocolView::replay(history, at(31), &config());
    let task = view.graph().get("T1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_at, Some(at(20)));
    assert!((task.actual_hours.unwrap() - 10.0 / 3600.0).abs() < 1e-9);
    assert_eq!(view.ledger().outcome(&late.id), Some(&ClaimOutcome::Closed));
  }

  #[test]
  fn claims_before_dependencies_complete_are_premature() {
    let mut history = cluster_of(&["a", "b"], 60);
    history.push(tasks(vec![TaskSpec::new("T1", "x"), TaskSpec::new("T2", "y").depends_on(&["T1"])]));
    history.push(claim_at("a", "T1", at(5)));
    let early = claim_at("b", "T2", at(6));
    history.push(early.clone());
    history.push(progress("a", "T1", 10, ProgressStatus::Completed, 100));
    let timely = claim_at("b", "T2", at(11));
    history.push(timely.clone());

    let view = ProtocolView::replay(history, at(12), &config());
    assert_eq!(view.ledger().outcome(&early.id), Some(&ClaimOutcome::Premature));
    assert_eq!(view.ledger().outcome(&timely.id), Some(&ClaimOutcome::Won));
  }

  #[test]
  fn shutdown_owner_releases_immediately() {
    let mut history = cluster_of(&["a", "b"], 60);
    history.push(tasks(vec![TaskSpec::new("T1", "x")]));
    history.push(claim_at("a", "T1", at(10)));
    let mut bye = announce("a", &["rust"], 2);
    bye.timestamp = at(12);
    if let Payload::NodeAnnounce(a) = &mut bye.payload {
      a.status = InstanceStatus::Completed;
    }
    history.push(bye);
    let view = ProtocolView::replay(history, at(13), &config());
    assert_eq!(view.graph().get("T1").unwrap().status, TaskStatus::Pending);
  }

  #[test]
  fn preconditions_are_checked_before_claiming() {
    let mut history = cluster_of(&["a"], 60);
    history.push(announce("py", &["python"], 1));
    history.extend(heartbeats("py", 60));
    history.push(tasks(vec![
      TaskSpec::new("T1", "x").requires(&["rust"]),
      TaskSpec::new("T2", "y").depends_on(&["T1"]),
      TaskSpec::new("T3", "z"),
      TaskSpec::new("T4", "w"),
    ]));
    history.push(claim_at("a", "T3", at(10)));
    history.push(claim_at("a", "T4", at(10)));
    let view = ProtocolView::replay(history, at(20), &config());

    assert_eq!(attempt_claim("a", "nope", &view), ClaimDecision::Rejected(RejectReason::UnknownTask));
    assert_eq!(attempt_claim("zz", "T1", &view), ClaimDecision::Rejected(RejectReason::UnknownInstance));
    assert_eq!(
      attempt_claim("py", "T1", &view),
      ClaimDecision::Rejected(RejectReason::MissingSkills { missing: vec!["rust".into()] })
    );
    assert_eq!(
      attempt_claim("py", "T2", &view),
      ClaimDecision::Rejected(RejectReason::DependenciesIncomplete { missing: vec!["T1".into()] })
    );
    assert_eq!(
      attempt_claim("py", "T3", &view),
      ClaimDecision::Rejected(RejectReason::NotPending { status: TaskStatus::InProgress })
    );
    assert_eq!(
      attempt_claim("a", "T1", &view),
      ClaimDecision::Rejected(RejectReason::AtCapacity { current: 2, max: 2 })
    );
  }
}
