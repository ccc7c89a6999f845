//! Who is out there and are they still alive.
//!
//! Rebuilt from scratch on every cycle by folding the message history in
//! `(timestamp, id)` order. All time-dependent questions take an explicit
//! `at` so the same history can be asked about any simulated moment.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};

use crate::models::{InstanceStatus, Liveness, Message, Payload};

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
  pub id: String,
  pub skills: Vec<String>,
  pub max_concurrent_tasks: u32,
  pub started_at: DateTime<Utc>,
  pub announced_at: DateTime<Utc>,
  heartbeats: Vec<DateTime<Utc>>,
  reports: Vec<(DateTime<Utc>, InstanceStatus)>,
}

impl NodeRecord {
  pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
    self.heartbeats.last().copied()
  }

  /// Latest heartbeat no later than `at`.
  pub fn heartbeat_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let idx = self.heartbeats.partition_point(|hb| *hb <= at);
    idx.checked_sub(1).map(|i| self.heartbeats[i])
  }

  /// Status most recently reported by the instance itself as of `at`.
  pub fn status_at(&self, at: DateTime<Utc>) -> InstanceStatus {
    let idx = self.reports.partition_point(|(ts, _)| *ts <= at);
    idx
      .checked_sub(1)
      .map(|i| self.reports[i].1)
      .unwrap_or(InstanceStatus::Active)
  }

  pub fn liveness_at(&self, at: DateTime<Utc>, dead_after: TimeDelta) -> Liveness {
    match self.heartbeat_at_or_before(at) {
      Some(hb) if at - hb < dead_after => Liveness::Active,
      _ => Liveness::SuspectedDead,
    }
  }

  pub fn has_skills(&self, required: &[String]) -> bool {
    required
      .iter()
      .all(|skill| self.skills.iter().any(|s| s.eq_ignore_ascii_case(skill)))
  }
}

#[derive(Default)]
struct Track {
  announcement: Option<(DateTime<Utc>, Vec<String>, u32, DateTime<Utc>)>,
  heartbeats: Vec<DateTime<Utc>>,
  reports: Vec<(DateTime<Utc>, InstanceStatus)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterView {
  nodes: BTreeMap<String, NodeRecord>,
}

impl ClusterView {
  pub fn rebuild(messages: &[Message]) -> Self {
    let mut ordered: Vec<&Message> = messages.iter().collect();
    ordered.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

    let mut tracks: HashMap<&str, Track> = HashMap::new();
    for message in ordered {
      let track = tracks.entry(message.sender_id.as_str()).or_default();
      match &message.payload {
        Payload::NodeAnnounce(announce) => {
          let first_seen = track.announcement.as_ref().map_or(message.timestamp, |a| a.0.min(message.timestamp));
          track.announcement = Some((
            first_seen,
            announce.skills.clone(),
            announce.max_concurrent_tasks,
            announce.started_at,
          ));
          track.reports.push((message.timestamp, announce.status));
        }
        Payload::Heartbeat(pulse) => {
          if track.heartbeats.last() != Some(&message.timestamp) {
            track.heartbeats.push(message.timestamp);
          }
          if let Some(status) = pulse.status {
            track.reports.push((message.timestamp, status));
          }
        }
        _ => {}
      }
    }

    let nodes = tracks
      .into_iter()
      .filter_map(|(id, track)| {
        let (announced_at, skills, max_concurrent_tasks, started_at) = track.announcement?;
        Some((
          id.to_string(),
          NodeRecord {
            id: id.to_string(),
            skills,
            max_concurrent_tasks,
            started_at,
            announced_at,
            heartbeats: track.heartbeats,
            reports: track.reports,
          },
        ))
      })
      .collect();
    Self { nodes }
  }

  pub fn get(&self, id: &str) -> Option<&NodeRecord> {
    self.nodes.get(id)
  }

  /// Announced instances, ordered by id.
  pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
    self.nodes.values()
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn liveness(&self, id: &str, at: DateTime<Utc>, dead_after: TimeDelta) -> Liveness {
    self
      .nodes
      .get(id)
      .map_or(Liveness::SuspectedDead, |node| node.liveness_at(at, dead_after))
  }

  pub fn is_live(&self, id: &str, at: DateTime<Utc>, dead_after: TimeDelta) -> bool {
    self.nodes.get(id).is_some_and(|node| {
      !node.status_at(at).is_terminal() && node.liveness_at(at, dead_after) == Liveness::Active
    })
  }

  /// Live instance ids in ascending order. This order is the tie-break
  /// source for leader election.
  pub fn live_instances(&self, at: DateTime<Utc>, dead_after: TimeDelta) -> Vec<String> {
    self
      .nodes
      .keys()
      .filter(|id| self.is_live(id, at, dead_after))
      .cloned()
      .collect()
  }

  /// Instances that have not shut down but whose heartbeats stopped.
  pub fn overdue_instances(&self, at: DateTime<Utc>, dead_after: TimeDelta) -> Vec<&NodeRecord> {
    self
      .nodes
      .values()
      .filter(|node| !node.status_at(at).is_terminal() && node.liveness_at(at, dead_after) == Liveness::SuspectedDead)
      .collect()
  }
}
