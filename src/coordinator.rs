//! Instance runtime on top of the replay.
//!
//! The `Observer` is the read side: it polls the channel, replays it and
//! keeps the latest projection and snapshot behind an `Arc`. A `Coordinator`
//! is one worker instance: it owns the local identity, leader state and claim
//! reservations, and emits protocol messages. Only `reconcile` ever replaces
//! the projection; the append side reads whatever projection is current.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::build_snapshot;
use crate::alerts::AlertEngine;
use crate::arbiter::{ClaimDecision, ClaimOutcome, attempt_claim};
use crate::codec;
use crate::config::{Identity, ProtocolConfig, is_valid_id};
use crate::error::{ClaimConflict, CoordError, TransportError};
use crate::graph::TaskGraph;
use crate::leader::{ElectorAction, LeaderElector, Role};
use crate::messaging::{LogChannel, append_entry, read_entries};
use crate::models::{
  Announcement, ClaimTarget, ElectionBallot, InstanceStatus, Message, Payload, ProgressReport, ProgressStatus, Pulse,
  Snapshot, TaskList, TaskSpec, TaskStatus,
};
use crate::view::ProtocolView;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Cycle {
  view: Arc<ProtocolView>,
  snapshot: Arc<Snapshot>,
}

pub struct Observer<C: LogChannel> {
  channel: C,
  config: ProtocolConfig,
  cycle: tokio::sync::Mutex<()>,
  latest: RwLock<Option<Cycle>>,
  alerts: Mutex<AlertEngine>,
  bad_entries: Mutex<HashSet<String>>,
}

impl<C: LogChannel> Observer<C> {
  pub fn new(channel: C, config: ProtocolConfig) -> Self {
    let alerts = AlertEngine::new(&config);
    Self {
      channel,
      config,
      cycle: tokio::sync::Mutex::new(()),
      latest: RwLock::new(None),
      alerts: Mutex::new(alerts),
      bad_entries: Mutex::new(HashSet::new()),
    }
  }

  pub fn channel(&self) -> &C {
    &self.channel
  }

  pub fn config(&self) -> &ProtocolConfig {
    &self.config
  }

  /// Reads the whole channel and rebuilds the projection as of `now`.
  /// Overlapping calls run one after the other.
  pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<Arc<ProtocolView>, TransportError> {
    let _cycle = self.cycle.lock().await;
    let entries = read_entries(&self.channel, &self.config).await?;

    let mut messages = Vec::with_capacity(entries.len());
    let mut decode_errors = 0;
    {
      let mut bad = lock(&self.bad_entries);
      let mut current = HashSet::new();
      for entry in entries {
        match codec::decode(&entry) {
          Ok(message) => messages.push(message),
          Err(e) => {
            decode_errors += 1;
            if !bad.contains(&entry) {
              warn!("Skipping undecodable channel entry: {}", e);
            }
            current.insert(entry);
          }
        }
      }
      *bad = current;
    }

    let view = Arc::new(ProtocolView::replay(messages, now, &self.config));
    let alerts = lock(&self.alerts).evaluate(&view);
    let snapshot = Arc::new(build_snapshot(&view, alerts, decode_errors, &self.config));
    debug!(
      "Reconciled {} messages: {} tasks, {} live instances, leader {:?}",
      view.messages().len(),
      view.graph().len(),
      view.live_instances().len(),
      view.leader()
    );

    let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
    *latest = Some(Cycle { view: Arc::clone(&view), snapshot });
    Ok(view)
  }

  /// Projection from the last completed cycle.
  pub fn view(&self) -> Option<Arc<ProtocolView>> {
    let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
    latest.as_ref().map(|c| Arc::clone(&c.view))
  }

  /// Snapshot from the last completed cycle, `None` before the first one.
  pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
    let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
    latest.as_ref().map(|c| Arc::clone(&c.snapshot))
  }

  pub fn dismiss_alert(&self, id: Uuid) -> bool {
    let mut engine = lock(&self.alerts);
    if !engine.dismiss(id) {
      return false;
    }
    let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(cycle) = latest.as_mut() {
      let mut snapshot = (*cycle.snapshot).clone();
      snapshot.alerts = engine.alerts();
      cycle.snapshot = Arc::new(snapshot);
    }
    true
  }
}

/// What one reconcile changed for the local instance.
#[derive(Debug, Default)]
pub struct ReconcileReport {
  /// Tasks this instance now executes: reservations that survived the
  /// claim window, and owned tasks resumed after a restart.
  pub confirmed: Vec<String>,
  pub released: Vec<ClaimConflict>,
  /// Executing tasks the replay no longer shows as ours.
  pub revoked: Vec<String>,
  pub leader: Option<String>,
  pub role: Option<Role>,
}

#[derive(Debug, Clone)]
struct Reservation {
  message_id: String,
  claimed_at: DateTime<Utc>,
}

struct LocalState {
  elector: LeaderElector,
  reservations: BTreeMap<String, Reservation>,
  active: BTreeSet<String>,
  /// Closed locally, possibly not yet visible on the channel.
  finished: BTreeSet<String>,
  outbox: Vec<Payload>,
  paused: bool,
}

pub struct Coordinator<C: LogChannel> {
  observer: Arc<Observer<C>>,
  identity: Identity,
  started_at: DateTime<Utc>,
  state: Mutex<LocalState>,
}

impl<C: LogChannel> Coordinator<C> {
  /// Validates the identity and announces the instance on the channel.
  pub async fn register_self(
    observer: Arc<Observer<C>>,
    id: &str,
    skills: Vec<String>,
    max_concurrency: u32,
    now: DateTime<Utc>,
  ) -> Result<Self, CoordError> {
    let identity = Identity::new(id, skills, max_concurrency)?;
    Self::register(observer, identity, now).await
  }

  pub async fn register(observer: Arc<Observer<C>>, identity: Identity, now: DateTime<Utc>) -> Result<Self, CoordError> {
    let elector = LeaderElector::new(identity.id.clone(), observer.config().leader_timeout_delta());
    let coordinator = Self {
      observer,
      identity,
      started_at: now,
      state: Mutex::new(LocalState {
        elector,
        reservations: BTreeMap::new(),
        active: BTreeSet::new(),
        finished: BTreeSet::new(),
        outbox: Vec::new(),
        paused: false,
      }),
    };
    coordinator.emit(coordinator.announcement(InstanceStatus::Active), now).await?;
    coordinator.emit(Payload::Heartbeat(Pulse::default()), now).await?;
    info!(
      "Instance {} registered with skills {:?}, max {} concurrent tasks",
      coordinator.identity.id, coordinator.identity.skills, coordinator.identity.max_concurrent_tasks
    );
    Ok(coordinator)
  }

  pub fn id(&self) -> &str {
    &self.identity.id
  }

  pub fn observer(&self) -> &Arc<Observer<C>> {
    &self.observer
  }

  pub fn role(&self) -> Role {
    lock(&self.state).elector.role()
  }

  pub fn active_tasks(&self) -> Vec<String> {
    lock(&self.state).active.iter().cloned().collect()
  }

  pub fn reserved_tasks(&self) -> Vec<String> {
    lock(&self.state).reservations.keys().cloned().collect()
  }

  /// Announces a clean exit. Tasks still owned become claimable at once.
  pub async fn shutdown(&self, now: DateTime<Utc>) -> Result<(), CoordError> {
    self.emit(self.announcement(InstanceStatus::Completed), now).await?;
    let mut state = lock(&self.state);
    state.reservations.clear();
    state.active.clear();
    state.finished.clear();
    info!("Instance {} shut down", self.identity.id);
    Ok(())
  }

  pub async fn pause(&self, now: DateTime<Utc>) -> Result<(), CoordError> {
    lock(&self.state).paused = true;
    self.emit(self.pulse(Some(InstanceStatus::Paused)), now).await?;
    info!("Instance {} paused", self.identity.id);
    Ok(())
  }

  pub async fn resume(&self, now: DateTime<Utc>) -> Result<(), CoordError> {
    lock(&self.state).paused = false;
    self.emit(self.pulse(Some(InstanceStatus::Active)), now).await?;
    info!("Instance {} resumed", self.identity.id);
    Ok(())
  }

  pub async fn heartbeat(&self, now: DateTime<Utc>) -> Result<(), CoordError> {
    self.emit(self.pulse(None), now).await.map(|_| ())
  }

  /// Runs one read cycle and settles local state against it.
  pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, CoordError> {
    let view = self.observer.reconcile(now).await?;
    let claim_window = self.observer.config().claim_window_delta();
    let me = self.identity.id.as_str();
    let mut report = ReconcileReport { leader: view.leader().map(str::to_string), ..Default::default() };

    let mut state = lock(&self.state);
    if let Some(ElectorAction::Announce { leader_id }) = state.elector.step(&view) {
      state.outbox.push(Payload::LeaderElection(ElectionBallot { leader_id }));
    }
    report.role = Some(state.elector.role());

    let reservations: Vec<(String, Reservation)> =
      state.reservations.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    for (task_id, reservation) in reservations {
      let owner = view.graph().get(&task_id).and_then(|t| t.assigned_to.as_deref());
      match view.ledger().outcome(&reservation.message_id) {
        None if now - reservation.claimed_at <= claim_window => {}
        Some(ClaimOutcome::Won | ClaimOutcome::Duplicate) if owner == Some(me) => {
          if now - reservation.claimed_at >= claim_window {
            info!("Claim on {} confirmed for {}", task_id, me);
            state.reservations.remove(&task_id);
            state.active.insert(task_id.clone());
            report.confirmed.push(task_id);
          }
        }
        outcome => {
          state.reservations.remove(&task_id);
          let winner = match outcome {
            Some(ClaimOutcome::Lost { winner }) => Some(winner.clone()),
            _ => owner.filter(|o| *o != me).map(str::to_string),
          };
          match winner {
            Some(winner) => {
              let conflict = ClaimConflict { task_id, loser: me.to_string(), winner };
              warn!("{}", conflict);
              report.released.push(conflict);
            }
            None => info!("Reservation on {} dropped: {:?}", task_id, outcome),
          }
        }
      }
    }

    let still_mine: Vec<String> = state
      .active
      .iter()
      .filter(|task_id| {
        view
          .graph()
          .get(task_id)
          .is_some_and(|t| t.status == TaskStatus::InProgress && t.assigned_to.as_deref() == Some(me))
      })
      .cloned()
      .collect();
    for task_id in std::mem::take(&mut state.active) {
      if !still_mine.contains(&task_id) {
        report.revoked.push(task_id);
      }
    }
    state.active = still_mine.into_iter().collect();

    let lagging: BTreeSet<String> = view
      .owned_tasks(me)
      .filter(|t| state.finished.contains(&t.id))
      .map(|t| t.id.clone())
      .collect();
    state.finished = lagging;

    for task in view.owned_tasks(me) {
      let handled = state.active.contains(&task.id) || state.finished.contains(&task.id);
      if !handled && !state.reservations.contains_key(&task.id) {
        info!("Resuming owned task {} on {}", task.id, me);
        state.active.insert(task.id.clone());
        report.confirmed.push(task.id.clone());
      }
    }
    Ok(report)
  }

  /// Sends everything the elector queued since the last flush.
  pub async fn flush_outbox(&self, now: DateTime<Utc>) -> Result<usize, CoordError> {
    let pending = std::mem::take(&mut lock(&self.state).outbox);
    let count = pending.len();
    for payload in pending {
      self.emit(payload, now).await?;
    }
    Ok(count)
  }

  /// Claims the most urgent ready task this instance can take, if any.
  pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<String>, CoordError> {
    let Some(view) = self.observer.view() else { return Ok(None) };
    let me = self.identity.id.as_str();
    let candidate = {
      let state = lock(&self.state);
      if state.paused {
        return Ok(None);
      }
      let local = state.active.len() + state.reservations.len();
      if local >= self.identity.max_concurrent_tasks as usize {
        return Ok(None);
      }
      view
        .graph()
        .ready_tasks()
        .into_iter()
        .filter(|t| !state.reservations.contains_key(&t.id) && !state.active.contains(&t.id))
        .find(|t| attempt_claim(me, &t.id, &view) == ClaimDecision::Granted)
        .map(|t| t.id.clone())
    };
    let Some(task_id) = candidate else { return Ok(None) };

    let message = self.emit(Payload::Claim(ClaimTarget { task_id: task_id.clone() }), now).await?;
    lock(&self.state)
      .reservations
      .insert(task_id.clone(), Reservation { message_id: message.id, claimed_at: now });
    info!("{} claimed {}", me, task_id);
    Ok(Some(task_id))
  }

  /// Reports progress on a task this instance executes.
  pub async fn report_progress(&self, report: ProgressReport, now: DateTime<Utc>) -> Result<(), CoordError> {
    let task_id = report.task_id.clone();
    let terminal = report.status != ProgressStatus::InProgress;
    {
      let mut state = lock(&self.state);
      let replaced = self
        .observer
        .view()
        .and_then(|v| v.graph().get(&task_id).and_then(|t| t.assigned_to.clone()))
        .is_some_and(|owner| owner != self.identity.id);
      if replaced {
        state.active.remove(&task_id);
      }
      if !state.active.contains(&task_id) {
        return Err(CoordError::NotOwner { instance: self.identity.id.clone(), task_id });
      }
    }
    self.emit(Payload::Progress(report), now).await?;
    if terminal {
      let mut state = lock(&self.state);
      state.active.remove(&task_id);
      state.finished.insert(task_id);
    }
    Ok(())
  }

  /// Publishes a task list. Lists with malformed ids or dependency cycles are
  /// refused before anything reaches the channel.
  pub async fn publish_tasks(&self, tasks: Vec<TaskSpec>, now: DateTime<Utc>) -> Result<Message, CoordError> {
    if let Some(bad) = tasks.iter().map(|t| t.id.as_str()).find(|id| !is_valid_id(id)) {
      return Err(CoordError::InvalidId(bad.to_string()));
    }
    if let Some(cycle) = TaskGraph::from_specs(&tasks, now).cycles().first() {
      return Err(cycle.clone().into());
    }
    let count = tasks.len();
    let message = self.emit(Payload::TasksData(TaskList { tasks }), now).await?;
    info!("{} published {} tasks", self.identity.id, count);
    Ok(message)
  }

  fn announcement(&self, status: InstanceStatus) -> Payload {
    Payload::NodeAnnounce(Announcement {
      status,
      skills: self.identity.skills.clone(),
      max_concurrent_tasks: self.identity.max_concurrent_tasks,
      started_at: self.started_at,
    })
  }

  fn pulse(&self, status: Option<InstanceStatus>) -> Payload {
    let state = lock(&self.state);
    let workload = state.active.len() + state.reservations.len();
    Payload::Heartbeat(Pulse { status, workload: u32::try_from(workload).unwrap_or(u32::MAX) })
  }

  async fn emit(&self, payload: Payload, now: DateTime<Utc>) -> Result<Message, CoordError> {
    let message = Message::new(self.identity.id.clone(), now, payload);
    let entry = codec::encode(&message)?;
    append_entry(self.observer.channel(), &entry, self.observer.config()).await?;
    debug!("{} appended {} {}", message.sender_id, message.payload.tag(), message.id);
    Ok(message)
  }
}
