//! The RPC boundary with the remote build engine.
//!
//! Nodes hand out a [`Driver`]; booting it yields a [`BuildClient`] that
//! speaks to the backend. Everything past these traits (transport, frontend
//! execution, exporters) belongs to the backend.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::platform::Platform;
use crate::request::SolveRequest;
use crate::session::SharedSession;

/// Errors reported by a build backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
  /// The node could not be reached or booted.
  #[error("failed to connect: {0}")]
  Connect(String),

  /// The frontend does not understand the requested subrequest.
  #[error("unsupported subrequest {name}")]
  UnsupportedSubrequest { name: String },

  /// The frontend or solver rejected the request.
  #[error("solve failed: {0}")]
  Solve(String),

  /// An exporter failed after a successful solve.
  #[error("export failed: {0}")]
  Export(String),

  /// A side-channel session could not be attached or closed.
  #[error("session {id}: {message}")]
  Session { id: String, message: String },

  /// The call was abandoned because the build was canceled.
  #[error("canceled")]
  Canceled,
}

/// Opaque reference to a sub-build-graph living on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildRef(pub String);

impl fmt::Display for BuildRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// What the frontend produced for one request, before export.
///
/// Single-platform builds carry `reference`; multi-platform builds carry one
/// entry per platform key in `platform_refs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayResult {
  pub reference: Option<BuildRef>,
  pub platform_refs: BTreeMap<String, BuildRef>,
  pub metadata: BTreeMap<String, Vec<u8>>,
}

impl GatewayResult {
  pub fn single(reference: BuildRef) -> Self {
    Self {
      reference: Some(reference),
      ..Default::default()
    }
  }

  /// Every reference held by this result.
  pub fn refs(&self) -> impl Iterator<Item = &BuildRef> {
    self.reference.iter().chain(self.platform_refs.values())
  }
}

/// The backend's final answer for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveResponse {
  pub exporter_response: BTreeMap<String, String>,
}

/// A worker advertised by a booted node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerInfo {
  pub id: String,
  pub platforms: Vec<Platform>,
  pub labels: BTreeMap<String, String>,
}

/// Protocol features a backend declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
  caps: BTreeSet<String>,
}

impl Capabilities {
  pub fn new<I, S>(caps: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      caps: caps.into_iter().map(Into::into).collect(),
    }
  }

  pub fn supports(&self, cap: &str) -> bool {
    self.caps.contains(cap)
  }
}

/// Handle used to establish a connection with a node.
#[async_trait]
pub trait Driver: Send + Sync + fmt::Debug {
  /// Backends that only load results into their own local image store.
  fn is_local_daemon(&self) -> bool {
    false
  }

  /// Connect to the node, starting it if needed.
  async fn boot(&self) -> Result<Arc<dyn BuildClient>, BackendError>;
}

/// A live connection to a build backend.
#[async_trait]
pub trait BuildClient: Send + Sync {
  /// Workers and the platforms they can actually run (including emulation).
  async fn list_workers(&self) -> Result<Vec<WorkerInfo>, BackendError>;

  /// Capabilities reported by a no-op internal build.
  async fn capabilities(&self) -> Result<Capabilities, BackendError>;

  /// Run the frontend for a request and return its result references.
  async fn solve(&self, request: &SolveRequest) -> Result<GatewayResult, BackendError>;

  /// Force evaluation of every reference in `result`.
  async fn evaluate(&self, result: &GatewayResult) -> Result<(), BackendError>;

  /// Run the request's exporters over a solved result.
  async fn export(&self, request: &SolveRequest, result: &GatewayResult) -> Result<SolveResponse, BackendError>;

  /// Attach a shared upload session to the transport.
  async fn attach_session(&self, session: &SharedSession) -> Result<(), BackendError>;

  async fn close_session(&self, _session_id: &str) -> Result<(), BackendError> {
    Ok(())
  }
}
