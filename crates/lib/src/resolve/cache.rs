//! Per-build cache of booted node connections and their capabilities.
//!
//! Every entry is a `OnceCell`, so concurrent first users of the same node
//! share a single boot or capability call. Nothing is evicted: a connection
//! lives until the cache is dropped at the end of the build.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::backend::{BuildClient, Capabilities};

type Cell<T> = Arc<OnceCell<T>>;

#[derive(Default)]
pub struct NodeCache {
  clients: Mutex<HashMap<usize, Cell<Arc<dyn BuildClient>>>>,
  capabilities: Mutex<HashMap<usize, Cell<Capabilities>>>,
}

impl NodeCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Return the cached client for `index`, running `boot` if nobody has yet.
  pub async fn client<F, Fut, E>(&self, index: usize, boot: F) -> Result<Arc<dyn BuildClient>, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<dyn BuildClient>, E>>,
  {
    let cell = cell_for(&self.clients, index);
    cell.get_or_try_init(boot).await.cloned()
  }

  /// Return the cached capabilities for `index`, fetching them once.
  pub async fn capabilities<F, Fut, E>(&self, index: usize, fetch: F) -> Result<Capabilities, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Capabilities, E>>,
  {
    let cell = cell_for(&self.capabilities, index);
    cell.get_or_try_init(fetch).await.cloned()
  }
}

fn cell_for<T>(map: &Mutex<HashMap<usize, Cell<T>>>, index: usize) -> Cell<T> {
  let mut map = map.lock().unwrap_or_else(PoisonError::into_inner);
  map.entry(index).or_insert_with(|| Arc::new(OnceCell::new())).clone()
}
