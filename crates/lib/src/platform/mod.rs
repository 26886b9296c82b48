//! Target platforms (OS/architecture/variant triples) and how nodes match them.

pub mod arch;
pub mod matcher;
pub mod os;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use matcher::{MatchMode, Matcher};

/// Platform identifier as used by OCI images (e.g. `linux/arm/v7`).
///
/// Values built through [`Platform::new`] or parsed from strings are always
/// normalized, so `linux/aarch64` and `linux/arm64/v8` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
  pub os: String,
  pub architecture: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub variant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
  #[error("invalid platform specifier {0:?}: empty")]
  Empty(String),

  #[error("invalid platform specifier {0:?}: too many components")]
  TooManyComponents(String),
}

impl Platform {
  /// Create a normalized platform.
  pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
    let (architecture, variant) = arch::normalize_arch(architecture, variant);
    Self {
      os: os::normalize_os(os),
      architecture,
      variant,
    }
  }

  /// The platform of the machine we are running on.
  pub fn host() -> Self {
    Self::new(os::host_os(), arch::host_arch(), None)
  }

  /// Returns this platform in canonical form.
  pub fn normalize(&self) -> Self {
    Self::new(&self.os, &self.architecture, self.variant.as_deref())
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.variant {
      Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
      None => write!(f, "{}/{}", self.os, self.architecture),
    }
  }
}

impl FromStr for Platform {
  type Err = PlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
      return Err(PlatformError::Empty(s.to_string()));
    }

    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
      return Err(PlatformError::Empty(s.to_string()));
    }

    match parts.as_slice() {
      // A lone component is an OS if we know it, otherwise an architecture on the host OS.
      [single] if os::is_known_os(single) => Ok(Self::new(single, arch::host_arch(), None)),
      [single] => Ok(Self::new(os::host_os(), single, None)),
      [os, arch] => Ok(Self::new(os, arch, None)),
      [os, arch, variant] => Ok(Self::new(os, arch, Some(variant))),
      _ => Err(PlatformError::TooManyComponents(s.to_string())),
    }
  }
}

/// Parse a comma separated platform list (`linux/amd64,linux/arm64`).
pub fn parse_list(value: &str) -> Result<Vec<Platform>, PlatformError> {
  value
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(Platform::from_str)
    .collect()
}

/// Format platforms as the comma separated list the frontend expects.
pub fn format_list(platforms: &[Platform]) -> String {
  platforms.iter().map(Platform::to_string).collect::<Vec<_>>().join(",")
}
