//! A keyed rendezvous between concurrently running build tasks.
//!
//! Producers publish a value once per key with [`WaitMap::set`]; consumers
//! block in [`WaitMap::get`] until every requested key has a value or the
//! operation is cancelled.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WaitError {
  #[error("wait canceled")]
  Canceled,

  #[error("wait map closed before the value was published")]
  Closed,
}

/// Write-once map whose readers can wait for keys to appear.
#[derive(Debug)]
pub struct WaitMap<K, V> {
  slots: Mutex<HashMap<K, watch::Sender<Option<V>>>>,
}

impl<K, V> Default for WaitMap<K, V> {
  fn default() -> Self {
    Self {
      slots: Mutex::new(HashMap::new()),
    }
  }
}

impl<K, V> WaitMap<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new() -> Self {
    Self::default()
  }

  fn subscribe(&self, key: &K) -> watch::Receiver<Option<V>> {
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots
      .entry(key.clone())
      .or_insert_with(|| watch::channel(None).0)
      .subscribe()
  }

  /// Publish `value` under `key` and wake all waiters.
  ///
  /// Values are write-once. A second `set` for the same key leaves the first
  /// value in place and returns `false`.
  pub fn set(&self, key: K, value: V) -> bool {
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    let sender = slots.entry(key).or_insert_with(|| watch::channel(None).0);
    sender.send_if_modified(|slot| {
      if slot.is_some() {
        return false;
      }
      *slot = Some(value);
      true
    })
  }

  /// Current value for `key`, without waiting.
  pub fn try_get(&self, key: &K) -> Option<V> {
    let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots.get(key).and_then(|sender| sender.borrow().clone())
  }

  /// Wait until every key in `keys` has a value.
  ///
  /// An empty key list resolves immediately. Cancellation wins over values
  /// that are not yet available.
  pub async fn get(&self, keys: &[K], cancel: &CancellationToken) -> Result<HashMap<K, V>, WaitError> {
    let mut values = HashMap::with_capacity(keys.len());
    for key in keys {
      let mut rx = self.subscribe(key);
      let value = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(WaitError::Canceled),
        value = rx.wait_for(Option::is_some) => value.map(|v| v.clone()).map_err(|_| WaitError::Closed)?,
      };
      let Some(value) = value else {
        return Err(WaitError::Closed);
      };
      values.insert(key.clone(), value);
    }
    Ok(values)
  }
}
