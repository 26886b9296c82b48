/// Normalize an architecture/variant pair to the canonical OCI form.
///
/// Default variants are dropped (`amd64/v1`, `arm64/v8`) and 32-bit ARM
/// without a variant becomes `arm/v7`, so equal platforms compare equal.
pub fn normalize_arch(arch: &str, variant: Option<&str>) -> (String, Option<String>) {
  let arch = arch.to_ascii_lowercase();
  let variant = variant.map(str::to_ascii_lowercase).filter(|v| !v.is_empty());

  match arch.as_str() {
    "i386" | "i486" | "i586" | "i686" | "x86" | "386" => ("386".to_string(), None),
    "x86_64" | "x86-64" | "amd64" => {
      let variant = variant.filter(|v| v != "v1");
      ("amd64".to_string(), variant)
    }
    "aarch64" | "arm64" => {
      let variant = variant.filter(|v| v != "v8" && v != "8");
      ("arm64".to_string(), variant)
    }
    "armhf" => ("arm".to_string(), Some("v7".to_string())),
    "armel" => ("arm".to_string(), Some("v6".to_string())),
    "arm" => {
      let variant = match variant {
        None => "v7".to_string(),
        Some(v) if v.starts_with('v') => v,
        Some(v) => format!("v{v}"),
      };
      ("arm".to_string(), Some(variant))
    }
    _ => (arch, variant),
  }
}

/// Returns the OCI name of the CPU architecture we are running on.
pub fn host_arch() -> &'static str {
  match std::env::consts::ARCH {
    "x86_64" => "amd64",
    "aarch64" => "arm64",
    "x86" => "386",
    "powerpc64" => "ppc64le",
    "riscv64" => "riscv64",
    "s390x" => "s390x",
    other => other,
  }
}
