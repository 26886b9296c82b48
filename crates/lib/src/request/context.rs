//! Typed named build contexts.
//!
//! Frontend attributes encode contexts as strings (`context:<name>` =
//! `target:<other>`, `docker-image://<ref>`, a git URL, or `local:<mount>`).
//! The coordinator works with [`NamedContext`] and only serializes to the
//! string form when writing a request.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::consts::{ATTR_CONTEXT_PREFIX, VALUE_IMAGE_PREFIX, VALUE_LOCAL_PREFIX, VALUE_TARGET_PREFIX};

/// Where a named build context comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamedContext {
  /// A host directory uploaded through a local mount.
  Local(PathBuf),
  /// The result of another target in the same build.
  Target(String),
  /// A registry image reference.
  Image(String),
  /// A remote git repository.
  Git(String),
}

fn is_git_url(value: &str) -> bool {
  value.starts_with("git://")
    || value.starts_with("git@")
    || ((value.starts_with("https://") || value.starts_with("http://") || value.starts_with("ssh://"))
      && (value.ends_with(".git") || value.contains(".git#")))
}

impl NamedContext {
  /// Interpret a user-supplied context value.
  pub fn parse(value: &str) -> Self {
    if let Some(target) = value.strip_prefix(VALUE_TARGET_PREFIX) {
      NamedContext::Target(target.to_string())
    } else if let Some(image) = value.strip_prefix(VALUE_IMAGE_PREFIX) {
      NamedContext::Image(image.to_string())
    } else if is_git_url(value) {
      NamedContext::Git(value.to_string())
    } else {
      NamedContext::Local(PathBuf::from(value))
    }
  }

  /// Attribute value for a context called `name`. Local contexts are served
  /// by a mount of the same name.
  pub fn to_wire(&self, name: &str) -> String {
    match self {
      NamedContext::Local(_) => format!("{VALUE_LOCAL_PREFIX}{name}"),
      NamedContext::Target(target) => format!("{VALUE_TARGET_PREFIX}{target}"),
      NamedContext::Image(image) => format!("{VALUE_IMAGE_PREFIX}{image}"),
      NamedContext::Git(url) => url.clone(),
    }
  }
}

/// Context name to target name for every `context:<name>=target:<other>`
/// attribute.
pub fn target_links(attrs: &BTreeMap<String, String>) -> Vec<(String, String)> {
  attrs
    .iter()
    .filter_map(|(key, value)| {
      let name = key.strip_prefix(ATTR_CONTEXT_PREFIX)?;
      let target = value.strip_prefix(VALUE_TARGET_PREFIX)?;
      Some((name.to_string(), target.to_string()))
    })
    .collect()
}
