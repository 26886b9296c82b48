//! Platform matchers used when assigning requested platforms to nodes.
//!
//! A [`Matcher`] is built for one *requested* platform and answers two
//! questions about a candidate node platform: can it serve the request
//! (`matches`), and is it a better fit than another candidate (`less`).

use super::Platform;

/// How strictly a node platform has to agree with the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
  /// Exact OS, architecture and variant.
  Strict,
  /// Anything the node can run natively or through a compatible variant
  /// (`arm64` serves `arm/v7`, `amd64/v3` serves `amd64/v2` and `386`).
  Compatible,
}

#[derive(Debug, Clone)]
pub struct Matcher {
  mode: MatchMode,
  want: Platform,
}

impl Matcher {
  pub fn new(mode: MatchMode, want: &Platform) -> Self {
    Self {
      mode,
      want: want.normalize(),
    }
  }

  /// Whether a node declaring `candidate` can build the requested platform.
  pub fn matches(&self, candidate: &Platform) -> bool {
    self.distance(candidate).is_some()
  }

  /// Whether `a` is a strictly better fit than `b`.
  pub fn less(&self, a: &Platform, b: &Platform) -> bool {
    match (self.distance(a), self.distance(b)) {
      (Some(da), Some(db)) => da < db,
      (Some(_), None) => true,
      _ => false,
    }
  }

  /// Position of the requested platform in the candidate's compatibility
  /// list. Zero is an exact match.
  fn distance(&self, candidate: &Platform) -> Option<usize> {
    let candidate = candidate.normalize();
    match self.mode {
      MatchMode::Strict => (candidate == self.want).then_some(0),
      MatchMode::Compatible => compatible_platforms(&candidate).iter().position(|p| *p == self.want),
    }
  }
}

/// Platforms a machine of the given (normalized) platform can run, most
/// native first.
pub fn compatible_platforms(platform: &Platform) -> Vec<Platform> {
  let os = platform.os.as_str();
  let variant = platform.variant.as_deref();

  match platform.architecture.as_str() {
    "amd64" => {
      let level = variant.and_then(|v| v.strip_prefix('v')).and_then(|v| v.parse::<u32>().ok());
      let mut out = Vec::new();
      if let Some(level) = level.filter(|l| *l > 1) {
        for l in (2..=level).rev() {
          out.push(Platform::new(os, "amd64", Some(&format!("v{l}"))));
        }
      }
      out.push(Platform::new(os, "amd64", None));
      out.push(Platform::new(os, "386", None));
      out
    }
    "arm64" if variant.is_none() => {
      let mut out = vec![Platform::new(os, "arm64", None)];
      out.extend(arm_variants(os, 8));
      out
    }
    "arm" => {
      let level = variant
        .and_then(|v| v.strip_prefix('v'))
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(7);
      arm_variants(os, level)
    }
    _ => vec![platform.clone()],
  }
}

fn arm_variants(os: &str, from: u32) -> Vec<Platform> {
  (5..=from)
    .rev()
    .map(|v| Platform::new(os, "arm", Some(&format!("v{v}"))))
    .collect()
}
