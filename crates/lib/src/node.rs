//! Configured build nodes.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::Driver;
use crate::platform::Platform;

/// A configured build backend endpoint.
///
/// Nodes are loaded by the caller and borrowed for the duration of one build.
/// A node whose driver failed to load keeps the error in `load_error` and is
/// skipped by the coordinator.
#[derive(Debug, Clone, Default)]
pub struct Node {
  pub name: String,
  /// Name of the builder group owning this node.
  pub builder: String,
  pub driver: Option<Arc<dyn Driver>>,
  /// Statically declared platforms.
  pub platforms: Vec<Platform>,
  /// Proxy and environment settings forwarded as build arguments.
  pub proxy_config: BTreeMap<String, String>,
  pub load_error: Option<String>,
}

impl Node {
  pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
    Self {
      name: name.into(),
      driver: Some(driver),
      ..Default::default()
    }
  }

  pub fn with_builder(mut self, builder: impl Into<String>) -> Self {
    self.builder = builder.into();
    self
  }

  pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
    self.platforms = platforms;
    self
  }

  pub fn with_proxy_config(mut self, config: BTreeMap<String, String>) -> Self {
    self.proxy_config = config;
    self
  }

  /// Whether the node loaded cleanly and can be booted.
  pub fn is_available(&self) -> bool {
    self.driver.is_some() && self.load_error.is_none()
  }

  pub fn is_local_daemon(&self) -> bool {
    self.driver.as_ref().is_some_and(|d| d.is_local_daemon())
  }
}
