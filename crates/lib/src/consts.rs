//! Wire conventions and well-known names shared with the build backend.

pub const APP_NAME: &str = "fleetbuild";

/// Environment variable naming a source policy file passed through to every request.
pub const SOURCE_POLICY_ENV: &str = "EXPERIMENTAL_BUILDKIT_SOURCE_POLICY";

pub const FRONTEND_DOCKERFILE: &str = "dockerfile.v0";
pub const FRONTEND_GATEWAY: &str = "gateway.v0";

/// Pinned frontend images able to answer subrequests older backends reject.
pub const FALLBACK_FRONTEND_OUTLINE: &str = "docker/dockerfile:1.7";
pub const FALLBACK_FRONTEND_LINT: &str = "docker/dockerfile:1.8";

pub const SUBREQUEST_OUTLINE: &str = "frontend.outline";
pub const SUBREQUEST_TARGETS: &str = "frontend.targets";
pub const SUBREQUEST_LINT: &str = "frontend.lint";

// Frontend attribute keys and value prefixes
pub const ATTR_CONTEXT_PREFIX: &str = "context:";
pub const ATTR_LOCAL_SESSION_PREFIX: &str = "local-sessionid:";
pub const ATTR_INPUT_METADATA_PREFIX: &str = "input-metadata:";
pub const ATTR_REQUEST_ID: &str = "requestid";
pub const ATTR_SOURCE: &str = "source";
pub const VALUE_TARGET_PREFIX: &str = "target:";
pub const VALUE_INPUT_PREFIX: &str = "input:";
pub const VALUE_LOCAL_PREFIX: &str = "local:";
pub const VALUE_IMAGE_PREFIX: &str = "docker-image://";

/// Separator between an input name and a platform in per-platform context keys.
pub const PLATFORM_KEY_SEPARATOR: &str = "::";

// Local mount names
pub const MOUNT_CONTEXT: &str = "context";
pub const MOUNT_DOCKERFILE: &str = "dockerfile";

// Exporter response keys
pub const EXPORTER_IMAGE_DIGEST: &str = "containerimage.digest";
pub const EXPORTER_IMAGE_DESCRIPTOR: &str = "containerimage.descriptor";
pub const EXPORTER_IMAGE_CONFIG: &str = "containerimage.config";
pub const EXPORTER_BUILDINFO: &str = "containerimage.buildinfo";
pub const BUILD_REF_KEY: &str = "buildx.build.ref";

// Backend capabilities
pub const CAP_MULTIPLE_EXPORTERS: &str = "exporter.multiple";
pub const CAP_SOURCE_POLICY: &str = "source.policy";

/// Size of a single fetch from a replicated input stream.
pub const STREAM_CHUNK_SIZE: usize = 32 * 1024;

/// Number of leading bytes inspected to detect an archive on stdin.
pub const ARCHIVE_SNIFF_LEN: usize = 512;
