use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, warn};

use crate::config::ProtocolConfig;
use crate::error::TransportError;

static MAX_DELAY: Duration = Duration::from_secs(10);

/// The shared append-only log. Entries are opaque text; delivery order from
/// `read_all` is whatever the backend returns and is never trusted.
pub trait LogChannel: Send + Sync + 'static {
  /// Appends one entry and returns the backend's id for it.
  fn append(&self, entry: String) -> impl Future<Output = Result<String, TransportError>> + Send;

  fn read_all(&self) -> impl Future<Output = Result<Vec<String>, TransportError>> + Send;
}

fn backoff(config: &ProtocolConfig) -> impl Iterator<Item = Duration> {
  let base = u64::try_from(config.retry_base.as_millis()).unwrap_or(u64::MAX).max(1);
  ExponentialBackoff::from_millis(base)
    .max_delay(MAX_DELAY)
    .take(config.retry_attempts)
}

pub async fn append_entry<C: LogChannel>(channel: &C, entry: &str, config: &ProtocolConfig) -> Result<String, TransportError> {
  Retry::spawn(backoff(config), || async {
    channel
      .append(entry.to_string())
      .await
      .inspect_err(|e| warn!("Append attempt failed: {}", e))
  })
  .await
}

pub async fn read_entries<C: LogChannel>(channel: &C, config: &ProtocolConfig) -> Result<Vec<String>, TransportError> {
  let entries = Retry::spawn(backoff(config), || async {
    channel.read_all().await.inspect_err(|e| warn!("Read attempt failed: {}", e))
  })
  .await?;
  debug!("Read {} entries from channel", entries.len());
  Ok(entries)
}

/// In-process log shared by every clone of the handle. Used by tests and
/// single-process simulations.
#[derive(Clone, Default)]
pub struct MemoryChannel {
  entries: Arc<Mutex<Vec<String>>>,
  failures: Arc<AtomicUsize>,
}

impl MemoryChannel {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends an entry verbatim, bypassing encoding.
  pub fn push_raw(&self, entry: impl Into<String>) {
    self.lock().push(entry.into());
  }

  /// Makes the next `n` operations fail with a transport error.
  pub fn fail_next(&self, n: usize) {
    self.failures.store(n, Ordering::SeqCst);
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn injected_failure(&self) -> bool {
    self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
  }
}

impl LogChannel for MemoryChannel {
  async fn append(&self, entry: String) -> Result<String, TransportError> {
    if self.injected_failure() {
      return Err(TransportError::Append("injected failure".into()));
    }
    let mut entries = self.lock();
    entries.push(entry);
    Ok(entries.len().to_string())
  }

  async fn read_all(&self) -> Result<Vec<String>, TransportError> {
    if self.injected_failure() {
      return Err(TransportError::Read("injected failure".into()));
    }
    Ok(self.lock().clone())
  }
}
