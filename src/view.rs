//! Full replay of the channel history into one consistent projection.
//!
//! There is no authoritative cluster state anywhere: every instance runs the
//! same replay over the same immutable message set and gets the same answer,
//! whatever order the transport delivered the entries in.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};

use crate::arbiter::ClaimLedger;
use crate::cluster::ClusterView;
use crate::config::ProtocolConfig;
use crate::graph::TaskGraph;
use crate::leader::elected_leader;
use crate::models::{Message, Payload, Task, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolView {
  now: DateTime<Utc>,
  messages: Vec<Message>,
  cluster: ClusterView,
  graph: TaskGraph,
  ledger: ClaimLedger,
  live: Vec<String>,
  leader: Option<String>,
  announcements: BTreeMap<String, DateTime<Utc>>,
}

impl ProtocolView {
  pub fn replay(messages: impl IntoIterator<Item = Message>, now: DateTime<Utc>, config: &ProtocolConfig) -> Self {
    let messages = dedupe(messages);
    let dead_after = config.dead_after_delta();

    let cluster = ClusterView::rebuild(&messages);
    let mut graph = TaskGraph::ingest(&messages);
    let ledger = ClaimLedger::resolve(&messages, &cluster, &mut graph, now, config);
    graph.refresh_blocked();

    let live = cluster.live_instances(now, dead_after);
    let leader = elected_leader(&live);

    let mut announcements: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
    for message in messages.iter().filter(|m| m.timestamp <= now) {
      if let Payload::LeaderElection(ballot) = &message.payload {
        let latest = announcements.entry(ballot.leader_id.clone()).or_insert(message.timestamp);
        *latest = (*latest).max(message.timestamp);
      }
    }

    Self { now, messages, cluster, graph, ledger, live, leader, announcements }
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.now
  }

  /// Deduplicated history in `(timestamp, id)` order.
  pub fn messages(&self) -> &[Message] {
    &self.messages
  }

  pub fn cluster(&self) -> &ClusterView {
    &self.cluster
  }

  pub fn graph(&self) -> &TaskGraph {
    &self.graph
  }

  pub fn ledger(&self) -> &ClaimLedger {
    &self.ledger
  }

  pub fn live_instances(&self) -> &[String] {
    &self.live
  }

  pub fn is_live(&self, id: &str) -> bool {
    self.live.binary_search_by(|probe| probe.as_str().cmp(id)).is_ok()
  }

  /// The authoritative leader, recomputed from the live set.
  pub fn leader(&self) -> Option<&str> {
    self.leader.as_deref()
  }

  /// Latest advisory announcement naming `leader_id`.
  pub fn last_announcement_for(&self, leader_id: &str) -> Option<DateTime<Utc>> {
    self.announcements.get(leader_id).copied()
  }

  /// Whether the computed leader was announced within `timeout`. Ballots
  /// naming anyone else, even a live instance, do not count.
  pub fn has_fresh_leader_announcement(&self, timeout: TimeDelta) -> bool {
    self
      .leader
      .as_deref()
      .and_then(|leader_id| self.announcements.get(leader_id))
      .is_some_and(|at| self.now - *at < timeout)
  }

  pub fn owned_tasks<'a>(&'a self, instance_id: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
    self
      .graph
      .tasks()
      .filter(move |t| t.status == TaskStatus::InProgress && t.assigned_to.as_deref() == Some(instance_id))
  }

  pub fn workload(&self, instance_id: &str) -> u32 {
    u32::try_from(self.owned_tasks(instance_id).count()).unwrap_or(u32::MAX)
  }
}

/// Drops duplicate deliveries and orders by `(timestamp, id)`. When two
/// entries share an id the earliest one is kept, so the outcome does not
/// depend on which copy arrived first.
fn dedupe(messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
  let mut by_id: HashMap<String, Message> = HashMap::new();
  for message in messages {
    match by_id.get(&message.id) {
      Some(kept) if (kept.timestamp, &kept.sender_id) <= (message.timestamp, &message.sender_id) => {}
      _ => {
        by_id.insert(message.id.clone(), message);
      }
    }
  }
  let mut ordered: Vec<Message> = by_id.into_values().collect();
  ordered.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
  ordered
}
