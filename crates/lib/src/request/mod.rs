//! Per-(target, node) solve requests.

pub mod builder;
pub mod context;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BuildRef;
use crate::session::SharedSession;
use crate::stream::UploadStream;

pub use builder::{DefaultRequestBuilder, PreparedRequest, ReleaseFn, RequestBuilder, RequestContext};
pub use context::NamedContext;

pub const EXPORT_IMAGE: &str = "image";
pub const EXPORT_REGISTRY: &str = "registry";
pub const EXPORT_DOCKER: &str = "docker";
pub const EXPORT_MOBY: &str = "moby";
pub const EXPORT_OCI: &str = "oci";
pub const EXPORT_TAR: &str = "tar";
pub const EXPORT_LOCAL: &str = "local";

#[derive(Debug, Error)]
pub enum RequestError {
  #[error("node {node} does not support {feature}")]
  UnsupportedFeature { node: String, feature: String },

  #[error("invalid context {name}: {value}")]
  InvalidContext { name: String, value: String },

  #[error("failed to read build input from stdin: {0}")]
  Stdin(#[source] io::Error),

  #[error("failed to stage build input: {0}")]
  Stage(#[source] io::Error),
}

/// A cache import or export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub attrs: BTreeMap<String, String>,
}

/// An exporter invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub attrs: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output_dir: Option<PathBuf>,
}

impl ExportEntry {
  pub fn new(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      ..Default::default()
    }
  }

  pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.attrs.insert(key.into(), value.into());
    self
  }

  fn flag(&self, key: &str) -> bool {
    self.attrs.get(key).is_some_and(|v| v == "true")
  }

  /// Exporters producing an image that can carry a name.
  pub fn is_image(&self) -> bool {
    matches!(self.kind.as_str(), EXPORT_IMAGE | EXPORT_DOCKER | EXPORT_MOBY)
  }

  pub fn push_requested(&self) -> bool {
    self.is_image() && self.flag("push")
  }

  pub fn name(&self) -> Option<&str> {
    self.attrs.get("name").map(String::as_str).filter(|n| !n.is_empty())
  }
}

/// A side-channel attachment (secret, ssh agent) forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAttachment {
  pub kind: String,
  pub id: String,
  pub source: Option<PathBuf>,
}

/// The fully prepared payload for one (target, node) pair.
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
  pub ref_id: String,
  pub frontend: String,
  pub frontend_attrs: BTreeMap<String, String>,
  pub frontend_inputs: BTreeMap<String, BuildRef>,
  pub local_mounts: BTreeMap<String, PathBuf>,
  pub cache_imports: Vec<CacheEntry>,
  pub cache_exports: Vec<CacheEntry>,
  pub exports: Vec<ExportEntry>,
  pub entitlements: Vec<String>,
  pub attachments: Vec<SessionAttachment>,
  /// Shared upload sessions serving some of `local_mounts`.
  pub shared_sessions: Vec<Arc<SharedSession>>,
  pub source_policy: Option<Arc<str>>,
  /// Build context archive read from stdin, streamed to the backend.
  pub upload: Option<UploadStream>,
}

impl SolveRequest {
  pub fn push_requested(&self) -> bool {
    self.exports.iter().any(ExportEntry::push_requested)
  }

  /// Session id routing `mount` through a shared upload, if any.
  pub fn shared_session_for(&self, mount: &str) -> Option<&str> {
    self
      .frontend_attrs
      .get(&format!("{}{mount}", crate::consts::ATTR_LOCAL_SESSION_PREFIX))
      .map(String::as_str)
  }
}
