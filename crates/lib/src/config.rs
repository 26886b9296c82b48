//! Build configuration read from the environment.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::consts::SOURCE_POLICY_ENV;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read source policy {path}: {source}")]
  ReadPolicy {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid source policy {path}: {source}")]
  InvalidPolicy {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// Settings shared by every request of a build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Source policy document, passed through unchanged to every request.
  pub source_policy: Option<Arc<str>>,

  /// Retry unsupported frontend subrequests with a pinned frontend image.
  pub allow_fallback_frontend: bool,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      source_policy: None,
      allow_fallback_frontend: true,
    }
  }
}

impl BuildConfig {
  /// Load configuration from the process environment.
  ///
  /// An unset or empty policy variable means no policy.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();
    let Some(path) = std::env::var_os(SOURCE_POLICY_ENV).filter(|p| !p.is_empty()) else {
      return Ok(config);
    };

    let path = PathBuf::from(path);
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadPolicy {
      path: path.clone(),
      source,
    })?;
    serde_json::from_str::<serde_json::Value>(&raw).map_err(|source| ConfigError::InvalidPolicy {
      path: path.clone(),
      source,
    })?;

    debug!(path = %path.display(), "loaded source policy");
    config.source_policy = Some(Arc::from(raw));
    Ok(config)
  }
}
