//! Leader election.
//!
//! Authority is never held, only computed: the leader is the smallest live
//! instance id, so every reader that sees the same live set agrees without
//! exchanging a single message. `leader_election` messages are advisory and
//! only serve dashboards and faster convergence.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::view::ProtocolView;

/// The leader for a live set, or `None` when nobody is live. "No leader" is a
/// normal state (e.g. during a channel outage), not an error.
pub fn elected_leader<S: AsRef<str>>(live: &[S]) -> Option<String> {
  live.iter().map(AsRef::as_ref).min().map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  Follower,
  Candidate,
  Leader,
  SteppingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectorAction {
  /// Post a `leader_election` message naming this leader.
  Announce { leader_id: String },
}

#[derive(Debug, Clone)]
pub struct LeaderElector {
  self_id: String,
  role: Role,
  timeout: TimeDelta,
  last_announced: Option<DateTime<Utc>>,
}

impl LeaderElector {
  pub fn new(self_id: impl Into<String>, timeout: TimeDelta) -> Self {
    Self {
      self_id: self_id.into(),
      role: Role::Follower,
      timeout,
      last_announced: None,
    }
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn is_leader(&self) -> bool {
    self.role == Role::Leader
  }

  /// Advances the state machine against a freshly replayed view.
  pub fn step(&mut self, view: &ProtocolView) -> Option<ElectorAction> {
    let now = view.now();
    let computed = view.leader();
    let is_me = computed == Some(self.self_id.as_str());

    if self.role == Role::Follower && !view.has_fresh_leader_announcement(self.timeout) {
      debug!("{}: no live leader announced within {}s, standing as candidate", self.self_id, self.timeout.num_seconds());
      self.role = Role::Candidate;
    }

    match self.role {
      Role::Candidate if is_me => {
        info!("{}: elected leader of {} live instances", self.self_id, view.live_instances().len());
        self.role = Role::Leader;
        Some(self.announce(now))
      }
      Role::Candidate => {
        self.role = Role::Follower;
        None
      }
      Role::Leader if !is_me => {
        info!("{}: stepping down, computed leader is now {:?}", self.self_id, computed);
        self.role = Role::SteppingDown;
        self.last_announced = None;
        None
      }
      Role::Leader => {
        let due = self.last_announced.is_none_or(|last| now - last >= self.timeout / 2);
        due.then(|| self.announce(now))
      }
      Role::SteppingDown => {
        self.role = Role::Follower;
        None
      }
      Role::Follower => None,
    }
  }

  fn announce(&mut self, now: DateTime<Utc>) -> ElectorAction {
    self.last_announced = Some(now);
    ElectorAction::Announce { leader_id: self.self_id.clone() }
  }
}
