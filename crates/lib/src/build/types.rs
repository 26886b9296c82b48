//! Types for coordinating a multi-node build.
//!
//! This module defines the per-target options accepted by the coordinator,
//! the error taxonomy, and the result handles exposed to callers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::{BackendError, BuildClient, GatewayResult};
use crate::manifest::{ManifestError, RegistryError};
use crate::platform::Platform;
use crate::request::{CacheEntry, ExportEntry, RequestError, SessionAttachment, SolveRequest};
use crate::resolve::ResolveError;
use crate::stream::StreamReplicator;
use crate::waitmap::WaitError;

/// Source inputs of a target.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
  /// Build context: a directory, a git URL, or `-` for stdin.
  pub context_path: String,
  /// Dockerfile location; `-` reads it from stdin. Defaults to
  /// `<context>/Dockerfile`.
  pub dockerfile_path: Option<String>,
  /// Named contexts, `name -> value` (`target:<name>`, `docker-image://..`,
  /// a git URL, or a directory).
  pub named_contexts: BTreeMap<String, String>,
  /// Piped stdin shared by every request that reads `-`.
  pub stdin: Option<StreamReplicator>,
}

impl Inputs {
  pub fn new(context_path: impl Into<String>) -> Self {
    Self {
      context_path: context_path.into(),
      ..Default::default()
    }
  }

  pub fn with_dockerfile(mut self, path: impl Into<String>) -> Self {
    self.dockerfile_path = Some(path.into());
    self
  }

  pub fn with_context(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.named_contexts.insert(name.into(), value.into());
    self
  }

  pub fn with_stdin(mut self, stdin: StreamReplicator) -> Self {
    self.stdin = Some(stdin);
    self
  }
}

/// Everything the caller configures for one target.
#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
  pub inputs: Inputs,
  pub platforms: Vec<Platform>,
  /// Dockerfile stage to build.
  pub stage: Option<String>,
  pub build_args: BTreeMap<String, String>,
  pub labels: BTreeMap<String, String>,
  pub no_cache: bool,
  pub tags: Vec<String>,
  pub exports: Vec<ExportEntry>,
  pub cache_from: Vec<CacheEntry>,
  pub cache_to: Vec<CacheEntry>,
  pub entitlements: Vec<String>,
  pub attachments: Vec<SessionAttachment>,
  /// Frontend subrequest to answer instead of building (`outline`,
  /// `targets`, `lint`).
  pub print: Option<String>,
  /// Extra frontend attributes passed through verbatim.
  pub frontend_attrs: BTreeMap<String, String>,
}

impl TargetOptions {
  pub fn new(inputs: Inputs) -> Self {
    Self {
      inputs,
      ..Default::default()
    }
  }
}

/// Errors returned by [`Coordinator::build`](super::Coordinator::build).
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("driver required for build")]
  DriverRequired,

  /// Every node failed to load.
  #[error("no valid drivers found")]
  NoValidDrivers,

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Request(#[from] RequestError),

  /// A `target:` context names a target that is not part of this build.
  #[error("failed to find target {dependency} for context {context}")]
  UnknownTarget { context: String, dependency: String },

  /// Linked targets ended up on different nodes.
  #[error("context {context} of {target} must be built with the same driver")]
  CrossDriver { target: String, context: String },

  #[error("dependency cycle detected involving target {0}")]
  CycleDetected(String),

  #[error("multi-node push can't currently be performed with a local daemon node, please switch to a different driver")]
  MultiNodePushLocalDaemon,

  #[error("{0} exports are not supported for multi-node builds")]
  MultiNodeExport(String),

  #[error("tag is needed when pushing to registry")]
  MissingPushTag,

  #[error("pushing a multi-node image requires an image registry")]
  RegistryRequired,

  #[error(transparent)]
  Backend(#[from] BackendError),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Wait(#[from] WaitError),

  #[error("build canceled")]
  Canceled,

  #[error("build task failed: {0}")]
  Task(String),

  /// Any of the above, attributed to a target when several are built.
  #[error("target {target}: {source}")]
  Target {
    target: String,
    #[source]
    source: Box<BuildError>,
  },
}

impl BuildError {
  pub fn for_target(self, target: &str) -> Self {
    match self {
      BuildError::Target { .. } => self,
      other => BuildError::Target {
        target: target.to_string(),
        source: Box::new(other),
      },
    }
  }

  /// The innermost error, unwrapping target attribution.
  pub fn root(&self) -> &BuildError {
    match self {
      BuildError::Target { source, .. } => source.root(),
      other => other,
    }
  }
}

/// A solved per-(target, node) result, exposed for later introspection.
#[derive(Clone)]
pub struct ResultHandle {
  pub target: String,
  pub node_index: usize,
  pub result: Arc<GatewayResult>,
  pub request: Arc<SolveRequest>,
  pub client: Arc<dyn BuildClient>,
}

impl fmt::Debug for ResultHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResultHandle")
      .field("target", &self.target)
      .field("node_index", &self.node_index)
      .field("result", &self.result)
      .finish_non_exhaustive()
  }
}

/// Callback receiving every result handle as soon as it is solved.
pub type ResultHandler = Arc<dyn Fn(&ResultHandle) + Send + Sync>;
