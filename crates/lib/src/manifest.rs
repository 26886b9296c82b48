//! Multi-node image merging.
//!
//! When one target is built on several nodes, each node pushes its image by
//! digest only. The per-node descriptors are then combined into a single OCI
//! image index, which is pushed under every requested tag.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::SolveResponse;
use crate::consts::EXPORTER_IMAGE_DESCRIPTOR;
use crate::platform::Platform;
use crate::util::hash::sha256_digest;

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("node {node} did not return an image descriptor")]
  MissingDescriptor { node: String },

  #[error("invalid image descriptor: {0}")]
  InvalidDescriptor(String),

  #[error("failed to encode image index: {0}")]
  Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
  #[error("failed to push {name}: {message}")]
  Push { name: String, message: String },
}

/// An OCI content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
  pub media_type: String,
  pub digest: String,
  pub size: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub platform: Option<Platform>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub annotations: BTreeMap<String, String>,
}

/// An OCI image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
  pub schema_version: u32,
  pub media_type: String,
  pub manifests: Vec<Descriptor>,
}

/// Combine per-node descriptors into one index.
///
/// Descriptors with the same digest are listed once, in first-seen order.
/// Returns the encoded index and its descriptor.
pub fn combine(descriptors: &[Descriptor]) -> Result<(Vec<u8>, Descriptor), ManifestError> {
  let mut seen = BTreeSet::new();
  let manifests: Vec<Descriptor> = descriptors
    .iter()
    .filter(|d| seen.insert(d.digest.clone()))
    .cloned()
    .collect();

  let index = ImageIndex {
    schema_version: 2,
    media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
    manifests,
  };
  let bytes = serde_json::to_vec(&index)?;
  let descriptor = Descriptor {
    media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
    digest: sha256_digest(&bytes),
    size: bytes.len() as u64,
    platform: None,
    annotations: BTreeMap::new(),
  };
  Ok((bytes, descriptor))
}

/// Decode the image descriptor an exporter reported.
pub fn descriptor_from_response(node: &str, response: &SolveResponse) -> Result<Descriptor, ManifestError> {
  let encoded = response
    .exporter_response
    .get(EXPORTER_IMAGE_DESCRIPTOR)
    .ok_or_else(|| ManifestError::MissingDescriptor { node: node.to_string() })?;
  let raw = BASE64
    .decode(encoded)
    .map_err(|e| ManifestError::InvalidDescriptor(e.to_string()))?;
  serde_json::from_slice(&raw).map_err(|e| ManifestError::InvalidDescriptor(e.to_string()))
}

pub fn encode_descriptor(descriptor: &Descriptor) -> Result<String, ManifestError> {
  Ok(BASE64.encode(serde_json::to_vec(descriptor)?))
}

/// Strip the tag and digest from an image reference.
pub fn repository(name: &str) -> &str {
  let name = name.split('@').next().unwrap_or(name);
  match name.rfind(':') {
    // A colon before the last slash belongs to a registry port.
    Some(colon) if !name[colon..].contains('/') => &name[..colon],
    _ => name,
  }
}

/// Repository names for a comma separated name list, deduplicated.
pub fn repository_names(names: &str) -> Vec<String> {
  let mut seen = BTreeSet::new();
  names
    .split(',')
    .map(str::trim)
    .filter(|n| !n.is_empty())
    .map(repository)
    .filter(|r| seen.insert(r.to_string()))
    .map(str::to_string)
    .collect()
}

/// Where merged indexes are pushed.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
  async fn push(&self, name: &str, descriptor: &Descriptor, manifest: &[u8], insecure: bool) -> Result<(), RegistryError>;
}
