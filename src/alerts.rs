//! Fixed rule set evaluated against every fresh view.
//!
//! Alerts are keyed by `(rule, subject)`: a condition that persists
//! refreshes its alert instead of raising a new one each cycle.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::models::{Alert, AlertRule, Severity, TaskStatus};
use crate::view::ProtocolView;

const CLUSTER_SUBJECT: &str = "cluster";

struct Condition {
  rule: AlertRule,
  subject: String,
  title: String,
  message: String,
  severity: Severity,
}

struct Entry {
  alert: Alert,
  active: bool,
}

pub struct AlertEngine {
  entries: BTreeMap<(AlertRule, String), Entry>,
  seen_evidence: HashSet<String>,
  conflict_streaks: HashMap<String, u32>,
  conflict_cycles: u32,
  dead_after: TimeDelta,
  blocked_threshold: TimeDelta,
  leader_timeout: TimeDelta,
}

impl AlertEngine {
  pub fn new(config: &ProtocolConfig) -> Self {
    Self {
      entries: BTreeMap::new(),
      seen_evidence: HashSet::new(),
      conflict_streaks: HashMap::new(),
      conflict_cycles: config.conflict_cycles,
      dead_after: config.dead_after_delta(),
      blocked_threshold: config.blocked_threshold_delta(),
      leader_timeout: config.leader_timeout_delta(),
    }
  }

  /// Runs every rule once and returns the resulting alert list.
  pub fn evaluate(&mut self, view: &ProtocolView) -> Vec<Alert> {
    self.track_conflicts(view);
    let now = view.now();
    let conditions = self.conditions(view);

    let mut active: HashSet<(AlertRule, String)> = HashSet::new();
    for condition in conditions {
      let key = (condition.rule, condition.subject.clone());
      active.insert(key.clone());
      match self.entries.get_mut(&key) {
        Some(entry) => {
          entry.active = true;
          entry.alert.timestamp = now;
          entry.alert.message = condition.message;
        }
        None => {
          warn!("Alert raised [{:?}] {}: {}", condition.severity, condition.title, condition.message);
          let alert = Alert {
            id: Uuid::new_v4(),
            rule: condition.rule,
            subject: condition.subject,
            title: condition.title,
            message: condition.message,
            severity: condition.severity,
            timestamp: now,
            dismissed: false,
          };
          self.entries.insert(key, Entry { alert, active: true });
        }
      }
    }

    self.entries.retain(|key, entry| {
      if active.contains(key) {
        return true;
      }
      entry.active = false;
      !entry.alert.dismissed
    });
    self.alerts()
  }

  /// Marks an alert dismissed. Returns false for unknown ids.
  pub fn dismiss(&mut self, id: Uuid) -> bool {
    match self.entries.values_mut().find(|e| e.alert.id == id) {
      Some(entry) => {
        info!("Alert {} ({}) dismissed", id, entry.alert.title);
        entry.alert.dismissed = true;
        if !entry.active {
          let key = (entry.alert.rule, entry.alert.subject.clone());
          self.entries.remove(&key);
        }
        true
      }
      None => false,
    }
  }

  /// Most severe first.
  pub fn alerts(&self) -> Vec<Alert> {
    let mut alerts: Vec<Alert> = self.entries.values().map(|e| e.alert.clone()).collect();
    alerts.sort_by(|a, b| {
      b.severity
        .cmp(&a.severity)
        .then_with(|| a.rule.cmp(&b.rule))
        .then_with(|| a.subject.cmp(&b.subject))
    });
    alerts
  }

  /// A task's streak grows for each cycle that brings new conflict evidence
  /// and resets on a quiet cycle.
  fn track_conflicts(&mut self, view: &ProtocolView) {
    let mut touched = HashSet::new();
    let mut current = HashSet::new();
    for (task_id, evidence) in view.ledger().evidence() {
      let mut fresh = false;
      for item in evidence {
        fresh |= !self.seen_evidence.contains(&item.message_id);
        current.insert(item.message_id.clone());
      }
      if fresh {
        *self.conflict_streaks.entry(task_id.clone()).or_default() += 1;
        touched.insert(task_id.clone());
      }
    }
    self.conflict_streaks.retain(|task_id, _| touched.contains(task_id));
    self.seen_evidence = current;
  }

  fn conditions(&self, view: &ProtocolView) -> Vec<Condition> {
    let now = view.now();
    let mut conditions = Vec::new();

    for node in view.cluster().overdue_instances(now, self.dead_after) {
      conditions.push(Condition {
        rule: AlertRule::HeartbeatOverdue,
        subject: node.id.clone(),
        title: format!("Instance {} heartbeat overdue", node.id),
        message: match node.heartbeat_at_or_before(now) {
          Some(last) => format!("no heartbeat for {}s", (now - last).num_seconds()),
          None => "no heartbeat ever observed".to_string(),
        },
        severity: Severity::Warning,
      });
    }

    for task in view.graph().tasks().filter(|t| t.status == TaskStatus::Blocked) {
      let Some(since) = task.blocked_since else { continue };
      if now - since > self.blocked_threshold {
        conditions.push(Condition {
          rule: AlertRule::TaskBlocked,
          subject: task.id.clone(),
          title: format!("Task {} blocked", task.id),
          message: format!(
            "blocked for {} on [{}]",
            human(now - since),
            view.graph().incomplete_dependencies(task).join(", ")
          ),
          severity: Severity::Warning,
        });
      }
    }

    for (task_id, streak) in &self.conflict_streaks {
      if *streak >= self.conflict_cycles {
        conditions.push(Condition {
          rule: AlertRule::ClaimConflict,
          subject: task_id.clone(),
          title: format!("Repeated claim conflict on {task_id}"),
          message: format!("non-owners acted on the task for {streak} consecutive cycles"),
          severity: Severity::Error,
        });
      }
    }

    let expected = view.cluster().nodes().filter(|n| !n.status_at(now).is_terminal()).count();
    if expected > 0 && view.live_instances().is_empty() {
      conditions.push(Condition {
        rule: AlertRule::AllInstancesDead,
        subject: CLUSTER_SUBJECT.to_string(),
        title: "All instances dead".to_string(),
        message: format!("none of {expected} running instances has a recent heartbeat"),
        severity: Severity::Critical,
      });
    }

    for cycle in view.graph().cycles() {
      conditions.push(Condition {
        rule: AlertRule::DependencyCycle,
        subject: cycle.tasks.join(","),
        title: "Dependency cycle".to_string(),
        message: cycle.to_string(),
        severity: Severity::Error,
      });
    }

    if let Some(leader) = view.leader() {
      if let Some(silence) = self.leader_silence(view, leader, now) {
        conditions.push(Condition {
          rule: AlertRule::LeaderSilent,
          subject: leader.to_string(),
          title: format!("Leader {leader} silent"),
          message: silence,
          severity: Severity::Info,
        });
      }
    }

    conditions
  }

  fn leader_silence(&self, view: &ProtocolView, leader: &str, now: DateTime<Utc>) -> Option<String> {
    let node = view.cluster().get(leader)?;
    if now - node.announced_at <= self.leader_timeout {
      return None;
    }
    match view.last_announcement_for(leader) {
      Some(last) if now - last <= self.leader_timeout => None,
      Some(last) => Some(format!("last leader announcement {} ago", human(now - last))),
      None => Some("never announced its leadership".to_string()),
    }
  }
}

fn human(span: TimeDelta) -> String {
  let secs = span.num_seconds();
  if secs >= 3600 {
    format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
  } else if secs >= 60 {
    format!("{}m{}s", secs / 60, secs % 60)
  } else {
    format!("{secs}s")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{Announcement, ClaimTarget, InstanceStatus, Message, Payload, ProgressReport, ProgressStatus, Pulse, TaskList, TaskSpec};
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
      leader_timeout: Duration::from_secs(1000),
      conflict_cycles: 3,
      ..ProtocolConfig::default()
    }
  }

  fn instance(id: &str, last_hb: i64) -> Vec<Message> {
    vec![
      Message::new(
        id,
        at(0),
        Payload::NodeAnnounce(Announcement {
          status: InstanceStatus::Active,
          skills: vec![],
          max_concurrent_tasks: 2,
          started_at: at(0),
        }),
      ),
      Message::new(id, at(last_hb), Payload::Heartbeat(Pulse::default())),
    ]
  }

  fn rules(alerts: &[Alert]) -> Vec<(AlertRule, String)> {
    alerts.iter().map(|a| (a.rule, a.subject.clone())).collect()
  }

  #[test]
  fn overdue_heartbeat_raises_one_alert_and_refreshes_it() {
    let mut history = instance("a", 100);
    history.extend(instance("b", 10));
    let mut engine = AlertEngine::new(&config());

    let first = engine.evaluate(&ProtocolView::replay(history.clone(), at(110), &config()));
    assert_eq!(rules(&first), vec![(AlertRule::HeartbeatOverdue, "b".to_string())]);
    assert_eq!(first[0].severity, Severity::Warning);

    let second = engine.evaluate(&ProtocolView::replay(history, at(120), &config()));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, first[0].id);
    assert_eq!(second[0].timestamp, at(120));
  }

  #[test]
  fn everyone_silent_is_critical() {
    let mut history = instance("a", 0);
    history.extend(instance("b", 0));
    let mut engine = AlertEngine::new(&config());
    let alerts = engine.evaluate(&ProtocolView::replay(history, at(100), &config()));
    assert_eq!(alerts[0].rule, AlertRule::AllInstancesDead);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts.len(), 3);
  }

  #[test]
  fn long_blocked_tasks_and_cycles_are_reported() {
    let mut history = instance("a", 25);
    history.push(Message::new("a", at(95), Payload::Heartbeat(Pulse::default())));
    history.push(Message::new(
      "a",
      at(1),
      Payload::TasksData(TaskList {
        tasks: vec![
          TaskSpec::new("T1", "x"),
          TaskSpec::new("T2", "y").depends_on(&["T1"]),
          TaskSpec::new("C1", "c").depends_on(&["C2"]),
          TaskSpec::new("C2", "c").depends_on(&["C1"]),
        ],
      }),
    ));
    let mut engine = AlertEngine::new(&config());
    let early = engine.evaluate(&ProtocolView::replay(history.clone(), at(30), &config()));
    assert_eq!(rules(&early), vec![(AlertRule::DependencyCycle, "C1,C2".to_string())]);

    let late = engine.evaluate(&ProtocolView::replay(history, at(100), &config()));
    let mut found = rules(&late);
    found.sort();
    assert_eq!(
      found,
      vec![
        (AlertRule::TaskBlocked, "C1".to_string()),
        (AlertRule::TaskBlocked, "C2".to_string()),
        (AlertRule::TaskBlocked, "T2".to_string()),
        (AlertRule::DependencyCycle, "C1,C2".to_string()),
      ]
    );
  }

  #[test]
  fn conflict_alert_needs_consecutive_cycles() {
    let mut history = instance("a", 5);
    history.extend(instance("b", 5));
    history.push(Message::new("a", at(1), Payload::TasksData(TaskList { tasks: vec![TaskSpec::new("T1", "x")] })));
    history.push(Message::new("a", at(2), Payload::Claim(ClaimTarget { task_id: "T1".into() })));
    let mut engine = AlertEngine::new(&config());

    // b keeps reporting on a task it lost, one fresh report per cycle
    for cycle in 0..3 {
      history.push(Message::new(
        "b",
        at(10 + cycle),
        Payload::Progress(ProgressReport {
          task_id: "T1".into(),
          status: ProgressStatus::InProgress,
          progress: 10,
          message: None,
          actual_hours: None,
        }),
      ));
      let alerts = engine.evaluate(&ProtocolView::replay(history.clone(), at(20 + cycle), &config()));
      let raised = alerts.iter().any(|a| a.rule == AlertRule::ClaimConflict);
      assert_eq!(raised, cycle == 2, "cycle {cycle}");
    }

    // a quiet cycle resets the streak; the alert stays until dismissed
    let alerts = engine.evaluate(&ProtocolView::replay(history.clone(), at(30), &config()));
    let conflict = alerts.iter().find(|a| a.rule == AlertRule::ClaimConflict).unwrap().clone();
    assert_eq!(conflict.severity, Severity::Error);
    assert!(engine.dismiss(conflict.id));
    assert!(engine.alerts().iter().all(|a| a.rule != AlertRule::ClaimConflict));
    assert!(!engine.dismiss(conflict.id));
  }

  #[test]
  fn conflict_ids_are_kept_only_while_in_evidence() {
    let mut history = instance("a", 5);
    history.extend(instance("b", 5));
    history.push(Message::new("a", at(1), Payload::TasksData(TaskList { tasks: vec![TaskSpec::new("T1", "x")] })));
    history.push(Message::new("a", at(2), Payload::Claim(ClaimTarget { task_id: "T1".into() })));
    let clean = history.clone();
    history.push(Message::new("b", at(3), Payload::Claim(ClaimTarget { task_id: "T1".into() })));
    let mut engine = AlertEngine::new(&config());

    engine.evaluate(&ProtocolView::replay(history, at(10), &config()));
    assert_eq!(engine.seen_evidence.len(), 1);
    engine.evaluate(&ProtocolView::replay(clean, at(11), &config()));
    assert!(engine.seen_evidence.is_empty());
  }

  #[test]
  fn dismissed_alert_stays_dismissed_while_condition_holds() {
    let mut history = instance("a", 100);
    history.extend(instance("b", 10));
    let mut engine = AlertEngine::new(&config());
    let alerts = engine.evaluate(&ProtocolView::replay(history.clone(), at(110), &config()));
    assert!(engine.dismiss(alerts[0].id));

    let alerts = engine.evaluate(&ProtocolView::replay(history.clone(), at(115), &config()));
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].dismissed);

    // b comes back, then goes silent again: a fresh alert
    history.push(Message::new("b", at(116), Payload::Heartbeat(Pulse::default())));
    assert!(engine.evaluate(&ProtocolView::replay(history.clone(), at(117), &config())).is_empty());
    let again = engine.evaluate(&ProtocolView::replay(history, at(200), &config()));
    let b_alert = again.iter().find(|a| a.subject == "b").unwrap();
    assert!(!b_alert.dismissed);
    assert_ne!(b_alert.id, alerts[0].id);
  }
}
