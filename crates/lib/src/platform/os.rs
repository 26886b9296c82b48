/// Normalize an operating system name to its OCI spelling.
pub fn normalize_os(os: &str) -> String {
  let os = os.to_ascii_lowercase();
  match os.as_str() {
    "macos" => "darwin".to_string(),
    _ => os,
  }
}

/// Returns the OCI name of the operating system we are running on.
pub fn host_os() -> &'static str {
  match std::env::consts::OS {
    "macos" => "darwin",
    other => other,
  }
}

/// Whether a lone platform component names an operating system rather than an architecture.
pub fn is_known_os(value: &str) -> bool {
  matches!(
    normalize_os(value).as_str(),
    "linux" | "darwin" | "windows" | "freebsd" | "netbsd" | "openbsd" | "solaris" | "illumos" | "aix"
  )
}
