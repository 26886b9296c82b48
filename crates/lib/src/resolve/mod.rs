//! Platform-to-node resolution.
//!
//! The resolver decides which node builds which platform of each target:
//!
//! 1. A cheap strict pass over the platforms nodes declare statically.
//! 2. If anything is left unmatched, every node is booted, its workers are
//!    listed, and matching is retried in compatible mode over the static and
//!    live platforms together. This pass never fails; a platform nobody can
//!    serve lands on the first node.
//!
//! Booted clients and capability sets are cached per build in a [`NodeCache`].

mod cache;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BuildClient, Capabilities};
use crate::node::Node;
use crate::platform::{MatchMode, Matcher, Platform};

pub use cache::NodeCache;

/// One node assigned to a target together with the platforms it will build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
  pub node_index: usize,
  /// Platforms this node builds. Empty means the backend's default platform.
  pub platforms: Vec<Platform>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("node index {0} is out of range")]
  UnknownNode(usize),

  #[error("node {node} has no driver")]
  NoDriver { node: String },

  #[error("failed to boot node {node}: {source}")]
  Boot {
    node: String,
    #[source]
    source: BackendError,
  },

  #[error("failed to list workers of node {node}: {source}")]
  ListWorkers {
    node: String,
    #[source]
    source: BackendError,
  },

  #[error("failed to load capabilities of node {node}: {source}")]
  Capabilities {
    node: String,
    #[source]
    source: BackendError,
  },
}

pub struct NodeResolver<'a> {
  nodes: &'a [Node],
  cache: NodeCache,
}

impl<'a> NodeResolver<'a> {
  pub fn new(nodes: &'a [Node]) -> Self {
    Self {
      nodes,
      cache: NodeCache::new(),
    }
  }

  /// Assign nodes to every target's requested platforms.
  ///
  /// # Errors
  ///
  /// Only the fallback pass can fail, when booting a node or listing its
  /// workers fails.
  pub async fn resolve(
    &self,
    requested: &BTreeMap<String, Vec<Platform>>,
  ) -> Result<BTreeMap<String, Vec<ResolvedNode>>, ResolveError> {
    let mut assigned = BTreeMap::new();
    if self.nodes.is_empty() {
      return Ok(assigned);
    }

    let mut missing = false;
    for (target, platforms) in requested {
      let (nodes, perfect) = self.assign(platforms, MatchMode::Strict, &HashMap::new());
      missing |= !perfect;
      assigned.insert(target.clone(), nodes);
    }

    if !missing {
      debug!(targets = assigned.len(), "all platforms matched declared node platforms");
      return Ok(assigned);
    }

    info!(nodes = self.nodes.len(), "booting all nodes to discover worker platforms");
    let all: Vec<usize> = (0..self.nodes.len()).collect();
    self.boot(&all).await?;
    let live = self.live_platforms(&all).await?;

    for (target, platforms) in requested {
      let (nodes, perfect) = self.assign(platforms, MatchMode::Compatible, &live);
      if !perfect {
        warn!(
          target = %target,
          node = %self.nodes[0].name,
          "no node supports all requested platforms, using the first node"
        );
      }
      assigned.insert(target.clone(), nodes);
    }

    Ok(assigned)
  }

  /// Assign nodes to one platform list.
  ///
  /// Returns the recombined assignment and whether every platform found a
  /// genuine match. `extra` adds platforms per node index on top of the
  /// statically declared ones.
  pub fn assign(
    &self,
    platforms: &[Platform],
    mode: MatchMode,
    extra: &HashMap<usize, Vec<Platform>>,
  ) -> (Vec<ResolvedNode>, bool) {
    if platforms.is_empty() {
      // The backend picks its own default platform, so any node will do.
      let node_index = self.select(&Platform::host(), mode, extra).unwrap_or(0);
      return (
        vec![ResolvedNode {
          node_index,
          platforms: Vec::new(),
        }],
        true,
      );
    }

    let mut perfect = true;
    let mut nodes = Vec::with_capacity(platforms.len());
    for platform in platforms {
      let node_index = self.select(platform, mode, extra).unwrap_or_else(|| {
        perfect = false;
        0
      });
      nodes.push(ResolvedNode {
        node_index,
        platforms: vec![platform.clone()],
      });
    }

    (recombine(nodes), perfect)
  }

  /// Pick the node best suited to build `want`, if any.
  ///
  /// Candidates are ranked by the matcher; on equal rank the lowest node
  /// index wins.
  pub fn select(&self, want: &Platform, mode: MatchMode, extra: &HashMap<usize, Vec<Platform>>) -> Option<usize> {
    let matcher = Matcher::new(mode, want);
    let mut best: Option<(usize, &Platform)> = None;

    for (index, node) in self.nodes.iter().enumerate() {
      let additional = extra.get(&index).map(Vec::as_slice).unwrap_or_default();
      for candidate in node.platforms.iter().chain(additional) {
        if !matcher.matches(candidate) {
          continue;
        }
        match best {
          Some((_, current)) if !matcher.less(candidate, current) => {}
          _ => best = Some((index, candidate)),
        }
      }
    }

    best.map(|(index, _)| index)
  }

  /// Boot the given nodes concurrently.
  pub async fn boot(&self, indexes: &[usize]) -> Result<Vec<Arc<dyn BuildClient>>, ResolveError> {
    try_join_all(indexes.iter().map(|&index| self.client(index))).await
  }

  /// Booted client for a node, booting it on first use.
  pub async fn client(&self, index: usize) -> Result<Arc<dyn BuildClient>, ResolveError> {
    let node = self.nodes.get(index).ok_or(ResolveError::UnknownNode(index))?;
    let driver = node
      .driver
      .clone()
      .ok_or_else(|| ResolveError::NoDriver { node: node.name.clone() })?;

    self
      .cache
      .client(index, || async move {
        debug!(node = %node.name, "booting node");
        driver.boot().await.map_err(|source| ResolveError::Boot {
          node: node.name.clone(),
          source,
        })
      })
      .await
  }

  /// Capabilities of a node, fetched once per build.
  pub async fn capabilities(&self, index: usize) -> Result<Capabilities, ResolveError> {
    let client = self.client(index).await?;
    let node = &self.nodes[index];

    self
      .cache
      .capabilities(index, || async move {
        client.capabilities().await.map_err(|source| ResolveError::Capabilities {
          node: node.name.clone(),
          source,
        })
      })
      .await
  }

  /// Load capabilities for several nodes concurrently.
  pub async fn preload_capabilities(&self, indexes: &[usize]) -> Result<Vec<Capabilities>, ResolveError> {
    try_join_all(indexes.iter().map(|&index| self.capabilities(index))).await
  }

  async fn live_platforms(&self, indexes: &[usize]) -> Result<HashMap<usize, Vec<Platform>>, ResolveError> {
    let lists = try_join_all(indexes.iter().map(|&index| async move {
      let client = self.client(index).await?;
      let workers = client.list_workers().await.map_err(|source| ResolveError::ListWorkers {
        node: self.nodes[index].name.clone(),
        source,
      })?;
      let platforms: Vec<Platform> = workers.into_iter().flat_map(|w| w.platforms).collect();
      debug!(node = %self.nodes[index].name, platforms = platforms.len(), "listed worker platforms");
      Ok::<_, ResolveError>((index, platforms))
    }))
    .await?;

    Ok(lists.into_iter().collect())
  }
}

/// Merge entries that landed on the same node, keeping first-seen order.
pub fn recombine(nodes: Vec<ResolvedNode>) -> Vec<ResolvedNode> {
  let mut out: Vec<ResolvedNode> = Vec::with_capacity(nodes.len());
  for node in nodes {
    match out.iter_mut().find(|n| n.node_index == node.node_index) {
      Some(existing) => {
        for platform in node.platforms {
          if !existing.platforms.contains(&platform) {
            existing.platforms.push(platform);
          }
        }
      }
      None => out.push(node),
    }
  }
  out
}
