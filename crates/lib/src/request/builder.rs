//! Turning target options into solve requests.
//!
//! The coordinator delegates request construction to a [`RequestBuilder`]
//! so that cache, export and entitlement policy stays with the caller.
//! [`DefaultRequestBuilder`] implements the Dockerfile frontend conventions.

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::context::NamedContext;
use super::{EXPORT_IMAGE, EXPORT_REGISTRY, RequestError, SolveRequest};
use crate::backend::Capabilities;
use crate::build::types::TargetOptions;
use crate::config::BuildConfig;
use crate::consts::{
  APP_NAME, ARCHIVE_SNIFF_LEN, ATTR_CONTEXT_PREFIX, ATTR_REQUEST_ID, CAP_MULTIPLE_EXPORTERS, CAP_SOURCE_POLICY,
  FRONTEND_DOCKERFILE, MOUNT_CONTEXT, MOUNT_DOCKERFILE,
};
use crate::node::Node;
use crate::platform::{self, Platform};
use crate::stream::{StreamReplicator, UploadStream};
use crate::util::hash::unique_id;

const DEFAULT_DOCKERFILE: &str = "Dockerfile";
const STDIN: &str = "-";
const UPLOAD_URL_PREFIX: &str = "http://buildkit-session/";

/// Cleanup to run once the request is no longer needed.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Everything a builder may look at when preparing one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
  pub target: &'a str,
  pub options: &'a TargetOptions,
  pub node: &'a Node,
  pub node_index: usize,
  /// Platforms this node serves for the target. Empty means the node default.
  pub platforms: &'a [Platform],
  pub capabilities: &'a Capabilities,
  pub config: &'a BuildConfig,
}

/// A built request and its release callback.
pub struct PreparedRequest {
  pub request: SolveRequest,
  pub release: Option<ReleaseFn>,
}

impl std::fmt::Debug for PreparedRequest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PreparedRequest")
      .field("request", &self.request)
      .field("release", &self.release.is_some())
      .finish()
  }
}

pub trait RequestBuilder: Send + Sync {
  fn build_request(&self, ctx: RequestContext<'_>) -> Result<PreparedRequest, RequestError>;
}

/// Requests for the Dockerfile frontend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRequestBuilder;

/// Whether `prefix` starts a tar or gzip stream.
pub fn is_archive(prefix: &[u8]) -> bool {
  if prefix.starts_with(&[0x1f, 0x8b]) {
    return true;
  }
  prefix.len() >= 262 && &prefix[257..262] == b"ustar"
}

fn read_stdin(stdin: &StreamReplicator) -> Result<Vec<u8>, RequestError> {
  let mut data = Vec::new();
  stdin.new_read_closer().read_to_end(&mut data).map_err(RequestError::Stdin)?;
  if !stdin.is_buffered() {
    stdin.reset(data.clone());
  }
  Ok(data)
}

/// Write a Dockerfile read from stdin into a fresh staging directory.
fn stage_dockerfile(data: &[u8]) -> Result<tempfile::TempDir, RequestError> {
  let dir = tempfile::Builder::new()
    .prefix(&format!("{APP_NAME}-dockerfile"))
    .tempdir()
    .map_err(RequestError::Stage)?;
  std::fs::write(dir.path().join(DEFAULT_DOCKERFILE), data).map_err(RequestError::Stage)?;
  std::fs::create_dir(dir.path().join(MOUNT_CONTEXT)).map_err(RequestError::Stage)?;
  Ok(dir)
}

fn dockerfile_location(context: &Path, dockerfile: Option<&str>) -> (PathBuf, String) {
  let path = match dockerfile {
    Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
    Some(p) => context.join(p),
    None => context.join(DEFAULT_DOCKERFILE),
  };
  let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| context.to_path_buf());
  let file = path
    .file_name()
    .map(|f| f.to_string_lossy().into_owned())
    .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string());
  (dir, file)
}

impl DefaultRequestBuilder {
  fn apply_inputs(&self, ctx: &RequestContext<'_>, req: &mut SolveRequest) -> Result<Option<ReleaseFn>, RequestError> {
    let inputs = &ctx.options.inputs;
    let mut release: Option<ReleaseFn> = None;

    if inputs.context_path == STDIN {
      let stdin = inputs.stdin.as_ref().ok_or_else(|| RequestError::InvalidContext {
        name: MOUNT_CONTEXT.to_string(),
        value: "stdin is not available".to_string(),
      })?;
      let prefix = stdin.peek(ARCHIVE_SNIFF_LEN).map_err(RequestError::Stdin)?;

      if is_archive(&prefix) {
        debug!(target = ctx.target, "build context is an archive on stdin");
        req.frontend_attrs.insert(MOUNT_CONTEXT.to_string(), format!("{UPLOAD_URL_PREFIX}{}", unique_id()));
        req.upload = Some(UploadStream::new(stdin.new_read_closer()));
        let (_, file) = dockerfile_location(Path::new("."), inputs.dockerfile_path.as_deref());
        req.frontend_attrs.insert("filename".to_string(), file);
      } else {
        debug!(target = ctx.target, "reading Dockerfile from stdin");
        let data = read_stdin(stdin)?;
        let dir = stage_dockerfile(&data)?;
        req.local_mounts.insert(MOUNT_CONTEXT.to_string(), dir.path().join(MOUNT_CONTEXT));
        req.local_mounts.insert(MOUNT_DOCKERFILE.to_string(), dir.path().to_path_buf());
        req.frontend_attrs.insert("filename".to_string(), DEFAULT_DOCKERFILE.to_string());
        release = Some(Box::new(move || drop(dir)));
      }
      return Ok(release);
    }

    match NamedContext::parse(&inputs.context_path) {
      NamedContext::Git(url) => {
        req.frontend_attrs.insert(MOUNT_CONTEXT.to_string(), url);
        if let Some(file) = inputs.dockerfile_path.as_deref().filter(|p| *p != STDIN) {
          req.frontend_attrs.insert("filename".to_string(), file.to_string());
        }
      }
      NamedContext::Local(context) => {
        req.local_mounts.insert(MOUNT_CONTEXT.to_string(), context.clone());
        if inputs.dockerfile_path.as_deref() == Some(STDIN) {
          let stdin = inputs.stdin.as_ref().ok_or_else(|| RequestError::InvalidContext {
            name: MOUNT_DOCKERFILE.to_string(),
            value: "stdin is not available".to_string(),
          })?;
          let dir = stage_dockerfile(&read_stdin(stdin)?)?;
          req.local_mounts.insert(MOUNT_DOCKERFILE.to_string(), dir.path().to_path_buf());
          req.frontend_attrs.insert("filename".to_string(), DEFAULT_DOCKERFILE.to_string());
          release = Some(Box::new(move || drop(dir)));
        } else {
          let (dir, file) = dockerfile_location(&context, inputs.dockerfile_path.as_deref());
          req.local_mounts.insert(MOUNT_DOCKERFILE.to_string(), dir);
          req.frontend_attrs.insert("filename".to_string(), file);
        }
      }
      other => {
        return Err(RequestError::InvalidContext {
          name: MOUNT_CONTEXT.to_string(),
          value: other.to_wire(MOUNT_CONTEXT),
        });
      }
    }

    for (name, value) in &inputs.named_contexts {
      let context = NamedContext::parse(value);
      if let NamedContext::Local(path) = &context {
        req.local_mounts.insert(name.clone(), path.clone());
      }
      req
        .frontend_attrs
        .insert(format!("{ATTR_CONTEXT_PREFIX}{name}"), context.to_wire(name));
    }

    Ok(release)
  }

  fn apply_exports(&self, ctx: &RequestContext<'_>, req: &mut SolveRequest) -> Result<(), RequestError> {
    let options = ctx.options;
    if options.print.is_some() {
      return Ok(());
    }

    for export in &options.exports {
      let mut export = export.clone();
      if export.kind == EXPORT_REGISTRY {
        export.kind = EXPORT_IMAGE.to_string();
        export.attrs.insert("push".to_string(), "true".to_string());
      }
      if export.is_image() && export.name().is_none() && !options.tags.is_empty() {
        export.attrs.insert("name".to_string(), options.tags.join(","));
      }
      req.exports.push(export);
    }

    if req.exports.len() > 1 && !ctx.capabilities.supports(CAP_MULTIPLE_EXPORTERS) {
      return Err(RequestError::UnsupportedFeature {
        node: ctx.node.name.clone(),
        feature: "multiple exporters".to_string(),
      });
    }
    Ok(())
  }
}

impl RequestBuilder for DefaultRequestBuilder {
  fn build_request(&self, ctx: RequestContext<'_>) -> Result<PreparedRequest, RequestError> {
    let options = ctx.options;
    let mut req = SolveRequest {
      ref_id: unique_id(),
      frontend: FRONTEND_DOCKERFILE.to_string(),
      frontend_attrs: options.frontend_attrs.clone(),
      cache_imports: options.cache_from.clone(),
      cache_exports: options.cache_to.clone(),
      entitlements: options.entitlements.clone(),
      attachments: options.attachments.clone(),
      ..Default::default()
    };

    if let Some(policy) = &ctx.config.source_policy {
      if !ctx.capabilities.supports(CAP_SOURCE_POLICY) {
        return Err(RequestError::UnsupportedFeature {
          node: ctx.node.name.clone(),
          feature: "source policy".to_string(),
        });
      }
      req.source_policy = Some(policy.clone());
    }

    let attrs = &mut req.frontend_attrs;
    if let Some(stage) = &options.stage {
      attrs.insert("target".to_string(), stage.clone());
    }
    if !ctx.platforms.is_empty() {
      attrs.insert("platform".to_string(), platform::format_list(ctx.platforms));
    }
    if options.no_cache {
      attrs.insert("no-cache".to_string(), String::new());
    }
    for (key, value) in &ctx.node.proxy_config {
      attrs.insert(format!("build-arg:{key}"), value.clone());
    }
    for (key, value) in &options.build_args {
      attrs.insert(format!("build-arg:{key}"), value.clone());
    }
    for (key, value) in &options.labels {
      attrs.insert(format!("label:{key}"), value.clone());
    }
    if let Some(print) = &options.print {
      let subrequest = if print.starts_with("frontend.") {
        print.clone()
      } else {
        format!("frontend.{print}")
      };
      attrs.insert(ATTR_REQUEST_ID.to_string(), subrequest);
    }

    let release = self.apply_inputs(&ctx, &mut req)?;
    self.apply_exports(&ctx, &mut req)?;

    Ok(PreparedRequest { request: req, release })
  }
}
