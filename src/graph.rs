//! Task records and dependency readiness.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::is_valid_id;
use crate::error::DependencyCycle;
use crate::models::{Message, Payload, Task, TaskSpec, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskGraph {
  tasks: BTreeMap<String, Task>,
  cycles: Vec<DependencyCycle>,
  topo_order: Vec<String>,
}

impl TaskGraph {
  /// Builds the graph from every `tasks_data` message in the history. A task
  /// published twice keeps its first creation time and takes the definition
  /// of the later publication.
  pub fn ingest(messages: &[Message]) -> Self {
    let mut ordered: Vec<&Message> = messages
      .iter()
      .filter(|m| matches!(m.payload, Payload::TasksData(_)))
      .collect();
    ordered.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

    let mut tasks: BTreeMap<String, Task> = BTreeMap::new();
    for message in ordered {
      let Payload::TasksData(list) = &message.payload else { continue };
      for spec in &list.tasks {
        if !is_valid_id(&spec.id) {
          warn!("Skipping task with invalid id {:?} from {}", spec.id, message.sender_id);
          continue;
        }
        match tasks.get_mut(&spec.id) {
          Some(task) => redefine(task, spec, message.timestamp),
          None => {
            tasks.insert(spec.id.clone(), Task::from_spec(spec, message.timestamp));
          }
        }
      }
    }
    Self::from_tasks(tasks)
  }

  /// Graph over a task list that has not been published yet.
  pub fn from_specs(specs: &[TaskSpec], at: DateTime<Utc>) -> Self {
    let tasks = specs.iter().map(|s| (s.id.clone(), Task::from_spec(s, at))).collect();
    Self::from_tasks(tasks)
  }

  fn from_tasks(tasks: BTreeMap<String, Task>) -> Self {
    let cycles = find_cycles(&tasks);
    let topo_order = topological_order(&tasks);
    let mut graph = Self { tasks, cycles, topo_order };
    graph.refresh_blocked();
    graph
  }

  pub fn get(&self, id: &str) -> Option<&Task> {
    self.tasks.get(id)
  }

  pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
    self.tasks.get_mut(id)
  }

  /// All tasks, ordered by id.
  pub fn tasks(&self) -> impl Iterator<Item = &Task> {
    self.tasks.values()
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  pub fn cycles(&self) -> &[DependencyCycle] {
    &self.cycles
  }

  /// Tasks whose dependency chains are acyclic, dependencies first. Tasks
  /// sitting on or behind a cycle are absent.
  pub fn topological_order(&self) -> &[String] {
    &self.topo_order
  }

  /// True when every dependency exists and completed no later than `at`.
  pub fn dependencies_met(&self, task: &Task, at: Option<DateTime<Utc>>) -> bool {
    task.dependencies.iter().all(|dep| {
      self.tasks.get(dep).is_some_and(|d| {
        d.status == TaskStatus::Completed
          && match (at, d.completed_at) {
            (None, _) => true,
            (Some(at), Some(done)) => done <= at,
            (Some(_), None) => false,
          }
      })
    })
  }

  pub fn incomplete_dependencies(&self, task: &Task) -> Vec<String> {
    task
      .dependencies
      .iter()
      .filter(|dep| self.tasks.get(*dep).is_none_or(|d| d.status != TaskStatus::Completed))
      .cloned()
      .collect()
  }

  /// Moves open tasks between `pending` and `blocked` to match their
  /// dependencies. Owned and closed tasks are left alone.
  pub fn refresh_blocked(&mut self) {
    let verdicts: Vec<(String, bool)> = self
      .tasks
      .values()
      .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked))
      .map(|t| (t.id.clone(), !self.dependencies_met(t, None)))
      .collect();
    for (id, blocked) in verdicts {
      let Some(task) = self.tasks.get_mut(&id) else { continue };
      if blocked {
        task.status = TaskStatus::Blocked;
        task.blocked_since = Some(task.created_at);
      } else {
        task.status = TaskStatus::Pending;
        task.blocked_since = None;
      }
    }
  }

  /// Claimable tasks, most urgent first. Advisory only: claim races are
  /// settled by the arbiter whatever order instances try them in.
  pub fn ready_tasks(&self) -> Vec<&Task> {
    let mut ready: Vec<&Task> = self
      .tasks
      .values()
      .filter(|t| t.status == TaskStatus::Pending && self.dependencies_met(t, None))
      .collect();
    ready.sort_by(|a, b| scheduling_order(a, b));
    ready
  }
}

fn scheduling_order(a: &Task, b: &Task) -> Ordering {
  b.priority
    .cmp(&a.priority)
    .then_with(|| a.created_at.cmp(&b.created_at))
    .then_with(|| a.id.cmp(&b.id))
}

fn redefine(task: &mut Task, spec: &TaskSpec, at: DateTime<Utc>) {
  task.title = spec.title.clone();
  task.description = spec.description.clone();
  task.priority = spec.priority;
  task.estimated_hours = spec.estimated_hours;
  task.dependencies = spec.dependencies.clone();
  task.required_skills = spec.required_skills.clone();
  task.updated_at = task.updated_at.max(at);
}

fn topological_order(tasks: &BTreeMap<String, Task>) -> Vec<String> {
  let mut indegree: BTreeMap<&str, usize> = tasks.keys().map(|k| (k.as_str(), 0)).collect();
  let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
  for task in tasks.values() {
    for dep in &task.dependencies {
      if tasks.contains_key(dep) {
        *indegree.entry(task.id.as_str()).or_default() += 1;
        dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
      }
    }
  }

  let mut queue: VecDeque<&str> = indegree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
  let mut order = Vec::with_capacity(tasks.len());
  while let Some(id) = queue.pop_front() {
    order.push(id.to_string());
    for next in dependents.get(id).into_iter().flatten() {
      if let Some(d) = indegree.get_mut(next) {
        *d -= 1;
        if *d == 0 {
          queue.push_back(*next);
        }
      }
    }
  }
  order
}

/// Tarjan's strongly connected components; every component with more than
/// one member, or a task depending on itself, is a cycle.
fn find_cycles(tasks: &BTreeMap<String, Task>) -> Vec<DependencyCycle> {
  struct Tarjan<'a> {
    tasks: &'a BTreeMap<String, Task>,
    index: usize,
    indices: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: BTreeSet<&'a str>,
    cycles: Vec<DependencyCycle>,
  }

  impl<'a> Tarjan<'a> {
    fn visit(&mut self, id: &'a str) {
      self.indices.insert(id, self.index);
      self.lowlink.insert(id, self.index);
      self.index += 1;
      self.stack.push(id);
      self.on_stack.insert(id);

      let tasks = self.tasks;
      let deps = tasks.get(id).map(|t| t.dependencies.as_slice()).unwrap_or_default();
      for dep in deps {
        let Some((dep, _)) = tasks.get_key_value(dep) else { continue };
        let dep = dep.as_str();
        if !self.indices.contains_key(dep) {
          self.visit(dep);
          let low = self.lowlink[id].min(self.lowlink[dep]);
          self.lowlink.insert(id, low);
        } else if self.on_stack.contains(dep) {
          let low = self.lowlink[id].min(self.indices[dep]);
          self.lowlink.insert(id, low);
        }
      }

      if self.lowlink[id] == self.indices[id] {
        let mut members = Vec::new();
        while let Some(member) = self.stack.pop() {
          self.on_stack.remove(member);
          members.push(member.to_string());
          if member == id {
            break;
          }
        }
        let self_loop = tasks.get(id).is_some_and(|t| t.dependencies.iter().any(|d| d == id));
        if members.len() > 1 || self_loop {
          members.sort();
          self.cycles.push(DependencyCycle { tasks: members });
        }
      }
    }
  }

  let mut tarjan = Tarjan {
    tasks,
    index: 0,
    indices: HashMap::new(),
    lowlink: HashMap::new(),
    stack: Vec::new(),
    on_stack: BTreeSet::new(),
    cycles: Vec::new(),
  };
  for id in tasks.keys() {
    if !tarjan.indices.contains_key(id.as_str()) {
      tarjan.visit(id.as_str());
    }
  }
  let mut cycles = tarjan.cycles;
  cycles.sort_by(|a, b| a.tasks.cmp(&b.tasks));
  cycles
}
