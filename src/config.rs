use std::env;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::TimeDelta;
use regex::Regex;

use crate::error::ConfigError;

static ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:\-]*$").expect("valid id regex")
});

/// Instance and task ids end up inside log entries and URLs, keep them plain.
pub fn is_valid_id(id: &str) -> bool {
  ID_REGEX.is_match(id)
}

/// The timing constants that govern the protocol.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
  pub heartbeat_interval: Duration,
  /// Silence after which an instance is suspected dead.
  pub dead_after: Duration,
  /// Upper bound on channel propagation delay.
  pub claim_window: Duration,
  pub reclaim_after: Duration,
  pub leader_timeout: Duration,
  pub blocked_threshold: Duration,
  pub velocity_window: Duration,
  pub conflict_cycles: u32,
  pub poll_interval: Duration,
  pub message_limit: usize,
  pub retry_attempts: usize,
  pub retry_base: Duration,
}

impl Default for ProtocolConfig {
  fn default() -> Self {
    Self {
      heartbeat_interval: Duration::from_secs(60),
      dead_after: Duration::from_secs(300),
      claim_window: Duration::from_secs(60),
      reclaim_after: Duration::from_secs(300),
      leader_timeout: Duration::from_secs(180),
      blocked_threshold: Duration::from_secs(3600),
      velocity_window: Duration::from_secs(3600),
      conflict_cycles: 3,
      poll_interval: Duration::from_secs(15),
      message_limit: 100,
      retry_attempts: 5,
      retry_base: Duration::from_millis(100),
    }
  }
}

impl ProtocolConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.dead_after <= self.heartbeat_interval {
      return Err(ConfigError::Inconsistent(format!(
        "dead threshold {:?} must exceed heartbeat interval {:?}",
        self.dead_after, self.heartbeat_interval
      )));
    }
    if self.reclaim_after < self.dead_after {
      return Err(ConfigError::Inconsistent(format!(
        "reclaim timeout {:?} is shorter than dead threshold {:?}",
        self.reclaim_after, self.dead_after
      )));
    }
    if self.conflict_cycles == 0 {
      return Err(ConfigError::Inconsistent("conflict cycles must be at least 1".into()));
    }
    Ok(())
  }

  pub fn dead_after_delta(&self) -> TimeDelta {
    delta(self.dead_after)
  }

  pub fn claim_window_delta(&self) -> TimeDelta {
    delta(self.claim_window)
  }

  pub fn reclaim_after_delta(&self) -> TimeDelta {
    delta(self.reclaim_after)
  }

  pub fn leader_timeout_delta(&self) -> TimeDelta {
    delta(self.leader_timeout)
  }

  pub fn blocked_threshold_delta(&self) -> TimeDelta {
    delta(self.blocked_threshold)
  }

  pub fn velocity_window_delta(&self) -> TimeDelta {
    delta(self.velocity_window)
  }
}

fn delta(d: Duration) -> TimeDelta {
  TimeDelta::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Who this process is when it runs as a worker.
#[derive(Debug, Clone)]
pub struct Identity {
  pub id: String,
  pub skills: Vec<String>,
  pub max_concurrent_tasks: u32,
}

impl Identity {
  pub fn new(id: impl Into<String>, skills: Vec<String>, max_concurrent_tasks: u32) -> Result<Self, ConfigError> {
    let id = id.into();
    if !is_valid_id(&id) {
      return Err(ConfigError::Invalid {
        key: "INSTANCE_ID",
        value: id,
        reason: "must be alphanumeric with . _ : - separators".into(),
      });
    }
    if max_concurrent_tasks == 0 {
      return Err(ConfigError::Invalid {
        key: "MAX_CONCURRENT_TASKS",
        value: "0".into(),
        reason: "must be at least 1".into(),
      });
    }
    let mut skills: Vec<String> = skills
      .into_iter()
      .map(|s| s.trim().to_lowercase())
      .filter(|s| !s.is_empty())
      .collect();
    skills.sort();
    skills.dedup();
    Ok(Self { id, skills, max_concurrent_tasks })
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub channel_name: String,
  pub server_port: u16,
  pub identity: Option<Identity>,
  pub tasks_path: Option<String>,
  pub protocol: ProtocolConfig,
}

impl Config {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
    let identity = match lookup("INSTANCE_ID") {
      Some(id) => {
        let skills = lookup("INSTANCE_SKILLS")
          .map(|raw| raw.split(',').map(str::to_string).collect())
          .unwrap_or_default();
        let max = parse_or(&lookup, "MAX_CONCURRENT_TASKS", 2)?;
        Some(Identity::new(id, skills, max)?)
      }
      None => None,
    };

    let defaults = ProtocolConfig::default();
    let protocol = ProtocolConfig {
      heartbeat_interval: secs_or(&lookup, "HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
      dead_after: secs_or(&lookup, "DEAD_AFTER_SECS", defaults.dead_after)?,
      claim_window: secs_or(&lookup, "CLAIM_WINDOW_SECS", defaults.claim_window)?,
      reclaim_after: secs_or(&lookup, "RECLAIM_AFTER_SECS", defaults.reclaim_after)?,
      leader_timeout: secs_or(&lookup, "LEADER_TIMEOUT_SECS", defaults.leader_timeout)?,
      blocked_threshold: secs_or(&lookup, "BLOCKED_THRESHOLD_SECS", defaults.blocked_threshold)?,
      velocity_window: secs_or(&lookup, "VELOCITY_WINDOW_SECS", defaults.velocity_window)?,
      conflict_cycles: parse_or(&lookup, "CONFLICT_CYCLES", defaults.conflict_cycles)?,
      poll_interval: secs_or(&lookup, "POLL_INTERVAL_SECS", defaults.poll_interval)?,
      message_limit: parse_or(&lookup, "SNAPSHOT_MESSAGE_LIMIT", defaults.message_limit)?,
      retry_attempts: parse_or(&lookup, "RETRY_ATTEMPTS", defaults.retry_attempts)?,
      retry_base: Duration::from_millis(parse_or(&lookup, "RETRY_BASE_MS", 100u64)?),
    };
    protocol.validate()?;

    Ok(Self {
      database_url,
      channel_name: lookup("CHANNEL_NAME").unwrap_or_else(|| "default".into()),
      server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
      identity,
      tasks_path: lookup("TASKS_PATH"),
      protocol,
    })
  }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match lookup(key) {
    Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
      key,
      value: raw.clone(),
      reason: e.to_string(),
    }),
    None => Ok(default),
  }
}

fn secs_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
  F: Fn(&str) -> Option<String>,
{
  parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}
