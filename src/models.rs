use chrono::{DateTime, Utc};
use serde::ser::{Error as _, SerializeStruct};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
  Active,
  Paused,
  Completed,
  Failed,
}

impl InstanceStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
  Active,
  SuspectedDead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  InProgress,
  Completed,
  Failed,
  Blocked,
}

impl TaskStatus {
  pub fn is_closed(self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }
}

/// Declaration order is the scheduling order: `Critical` sorts highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
  Critical,
}

/// Status an owner may report for its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
  InProgress,
  Completed,
  Failed,
}

// ---------------------------------------------------------------------------
// Message contents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionBallot {
  pub leader_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
  pub status: InstanceStatus,
  #[serde(default)]
  pub skills: Vec<String>,
  #[serde(default = "default_max_concurrent")]
  pub max_concurrent_tasks: u32,
  pub started_at: DateTime<Utc>,
}

fn default_max_concurrent() -> u32 {
  1
}

/// A task as published in a `tasks_data` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub priority: Priority,
  #[serde(default)]
  pub estimated_hours: f64,
  #[serde(default)]
  pub dependencies: Vec<String>,
  #[serde(default)]
  pub required_skills: Vec<String>,
}

impl TaskSpec {
  pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      title: title.into(),
      description: String::new(),
      priority: Priority::default(),
      estimated_hours: 0.0,
      dependencies: Vec::new(),
      required_skills: Vec::new(),
    }
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn depends_on(mut self, deps: &[&str]) -> Self {
    self.dependencies = deps.iter().map(|d| d.to_string()).collect();
    self
  }

  pub fn requires(mut self, skills: &[&str]) -> Self {
    self.required_skills = skills.iter().map(|s| s.to_string()).collect();
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
  pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimTarget {
  pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
  pub task_id: String,
  pub status: ProgressStatus,
  pub progress: u8,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub actual_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pulse {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<InstanceStatus>,
  #[serde(default)]
  pub workload: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
  LeaderElection,
  NodeAnnounce,
  TasksData,
  Claim,
  Progress,
  Heartbeat,
  Unknown,
}

impl MessageKind {
  pub fn from_tag(tag: &str) -> Self {
    match tag {
      "leader_election" => Self::LeaderElection,
      "node_announce" => Self::NodeAnnounce,
      "tasks_data" => Self::TasksData,
      "claim" => Self::Claim,
      "progress" => Self::Progress,
      "heartbeat" => Self::Heartbeat,
      _ => Self::Unknown,
    }
  }
}

/// Kind-specific message body. Kinds this build does not know are kept as
/// `Unknown` so newer senders never break older readers.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  LeaderElection(ElectionBallot),
  NodeAnnounce(Announcement),
  TasksData(TaskList),
  Claim(ClaimTarget),
  Progress(ProgressReport),
  Heartbeat(Pulse),
  Unknown { kind: String, content: serde_json::Value },
}

impl Payload {
  pub fn kind(&self) -> MessageKind {
    match self {
      Self::LeaderElection(_) => MessageKind::LeaderElection,
      Self::NodeAnnounce(_) => MessageKind::NodeAnnounce,
      Self::TasksData(_) => MessageKind::TasksData,
      Self::Claim(_) => MessageKind::Claim,
      Self::Progress(_) => MessageKind::Progress,
      Self::Heartbeat(_) => MessageKind::Heartbeat,
      Self::Unknown { .. } => MessageKind::Unknown,
    }
  }

  pub fn tag(&self) -> &str {
    match self {
      Self::LeaderElection(_) => "leader_election",
      Self::NodeAnnounce(_) => "node_announce",
      Self::TasksData(_) => "tasks_data",
      Self::Claim(_) => "claim",
      Self::Progress(_) => "progress",
      Self::Heartbeat(_) => "heartbeat",
      Self::Unknown { kind, .. } => kind,
    }
  }

  pub fn content(&self) -> Result<serde_json::Value, serde_json::Error> {
    match self {
      Self::LeaderElection(c) => serde_json::to_value(c),
      Self::NodeAnnounce(c) => serde_json::to_value(c),
      Self::TasksData(c) => serde_json::to_value(c),
      Self::Claim(c) => serde_json::to_value(c),
      Self::Progress(c) => serde_json::to_value(c),
      Self::Heartbeat(c) => serde_json::to_value(c),
      Self::Unknown { content, .. } => Ok(content.clone()),
    }
  }

  /// Task the message is about, for claims and progress reports.
  pub fn task_id(&self) -> Option<&str> {
    match self {
      Self::Claim(c) => Some(&c.task_id),
      Self::Progress(p) => Some(&p.task_id),
      _ => None,
    }
  }
}

/// One immutable entry of the shared channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
  pub id: String,
  pub sender_id: String,
  pub timestamp: DateTime<Utc>,
  pub payload: Payload,
}

impl Message {
  pub fn new(sender_id: impl Into<String>, timestamp: DateTime<Utc>, payload: Payload) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      sender_id: sender_id.into(),
      timestamp,
      payload,
    }
  }

  pub fn kind(&self) -> MessageKind {
    self.payload.kind()
  }
}

impl Serialize for Message {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let content = self.payload.content().map_err(S::Error::custom)?;
    let mut state = serializer.serialize_struct("Message", 5)?;
    state.serialize_field("id", &self.id)?;
    state.serialize_field("kind", self.payload.tag())?;
    state.serialize_field("sender_id", &self.sender_id)?;
    state.serialize_field("content", &content)?;
    state.serialize_field("timestamp", &self.timestamp)?;
    state.end()
  }
}

// ---------------------------------------------------------------------------
// Derived projections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
  pub id: String,
  pub title: String,
  pub description: String,
  pub status: TaskStatus,
  pub assigned_to: Option<String>,
  pub priority: Priority,
  pub progress_percentage: u8,
  pub estimated_hours: f64,
  pub actual_hours: Option<f64>,
  pub dependencies: Vec<String>,
  pub required_skills: Vec<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub blocked_since: Option<DateTime<Utc>>,
}

impl Task {
  pub fn from_spec(spec: &TaskSpec, at: DateTime<Utc>) -> Self {
    Self {
      id: spec.id.clone(),
      title: spec.title.clone(),
      description: spec.description.clone(),
      status: TaskStatus::Pending,
      assigned_to: None,
      priority: spec.priority,
      progress_percentage: 0,
      estimated_hours: spec.estimated_hours,
      actual_hours: None,
      dependencies: spec.dependencies.clone(),
      required_skills: spec.required_skills.clone(),
      created_at: at,
      updated_at: at,
      started_at: None,
      completed_at: None,
      blocked_since: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct InstanceStats {
  pub tasks_completed: u32,
  pub tasks_failed: u32,
  pub avg_completion_hours: Option<f64>,
  /// Completed tasks per hour over the velocity window.
  pub recent_velocity: f64,
  /// Filled in by an external scorer, never by the aggregator.
  pub quality_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instance {
  pub id: String,
  pub status: InstanceStatus,
  pub liveness: Liveness,
  pub is_leader: bool,
  pub workload: u32,
  pub max_concurrent_tasks: u32,
  pub current_tasks: Vec<String>,
  pub skills: Vec<String>,
  pub stats: InstanceStats,
  pub started_at: DateTime<Utc>,
  pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SystemMetrics {
  pub total_tasks: usize,
  pub pending_tasks: usize,
  pub in_progress_tasks: usize,
  pub completed_tasks: usize,
  pub failed_tasks: usize,
  pub blocked_tasks: usize,
  pub total_instances: usize,
  pub active_instances: usize,
  pub leader_id: Option<String>,
  /// Completed tasks per hour over the velocity window.
  pub velocity: f64,
  pub bottlenecks: usize,
  pub completion_percentage: f64,
  pub claim_conflicts: usize,
  pub decode_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
  Info,
  Warning,
  Error,
  Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertRule {
  HeartbeatOverdue,
  TaskBlocked,
  ClaimConflict,
  AllInstancesDead,
  DependencyCycle,
  LeaderSilent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
  pub id: Uuid,
  pub rule: AlertRule,
  pub subject: String,
  pub title: String,
  pub message: String,
  pub severity: Severity,
  pub timestamp: DateTime<Utc>,
  pub dismissed: bool,
}

/// Read-only system state produced by one aggregation cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
  pub instances: Vec<Instance>,
  pub tasks: Vec<Task>,
  pub messages: Vec<Message>,
  pub alerts: Vec<Alert>,
  pub metrics: SystemMetrics,
  pub timestamp: DateTime<Utc>,
}
