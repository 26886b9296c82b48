//! Multi-node build coordination.
//!
//! [`Coordinator::build`] is the entry point. For a set of targets it:
//! - filters out nodes that failed to load
//! - assigns platforms to nodes and prepares one request per (target, node)
//! - validates cross-target links and exports before anything is sent
//! - routes identical local uploads through shared sessions
//! - dispatches every request concurrently, ordering dependents after the
//!   targets they use as contexts
//! - merges multi-node image results into one pushed index

pub mod deps;
pub mod dispatch;
pub mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BuildClient, SolveResponse};
use crate::config::BuildConfig;
use crate::consts::{BUILD_REF_KEY, EXPORTER_IMAGE_DESCRIPTOR, EXPORTER_IMAGE_DIGEST};
use crate::manifest::{self, ImageRegistry};
use crate::node::Node;
use crate::platform::Platform;
use crate::request::{
  EXPORT_OCI, EXPORT_TAR, PreparedRequest, ReleaseFn, RequestBuilder, RequestContext, SolveRequest,
};
use crate::resolve::NodeResolver;
use crate::session::{SharedSession, share_local_mounts};
use crate::waitmap::WaitMap;

use deps::{Placement, ResultMap, check_cycles, validate_links};
use dispatch::PairTask;

pub use types::{BuildError, Inputs, ResultHandle, ResultHandler, TargetOptions};

/// Extra response metadata supplied after a target finished (provenance,
/// VCS information).
pub trait MetadataProvider: Send + Sync {
  fn metadata(&self, target: &str, response: &SolveResponse) -> BTreeMap<String, String>;
}

/// Release callbacks run when the build returns, on every path.
#[derive(Default)]
struct ReleaseGuard {
  callbacks: Vec<ReleaseFn>,
}

impl ReleaseGuard {
  fn push(&mut self, release: Option<ReleaseFn>) {
    self.callbacks.extend(release);
  }
}

impl Drop for ReleaseGuard {
  fn drop(&mut self) {
    for release in self.callbacks.drain(..) {
      release();
    }
  }
}

/// One prepared (target, node) request.
struct Pair {
  node_index: usize,
  platforms: Vec<Platform>,
  request: SolveRequest,
  client: Arc<dyn BuildClient>,
}

/// Where a multi-node image is pushed after merging.
#[derive(Debug, Clone)]
struct MergePush {
  names: Vec<String>,
  insecure: bool,
}

struct PreparedTarget {
  pairs: Vec<Pair>,
  merge: Option<MergePush>,
}

/// Shared state handed to every target task.
#[derive(Clone)]
struct DispatchContext {
  nodes: Arc<[Node]>,
  results: Arc<ResultMap>,
  registrations: Arc<WaitMap<String, ()>>,
  children: Arc<HashMap<(usize, String), Vec<String>>>,
  handler: Option<ResultHandler>,
  registry: Option<Arc<dyn ImageRegistry>>,
  allow_fallback: bool,
}

/// Drives builds across a pool of nodes.
pub struct Coordinator {
  request_builder: Arc<dyn RequestBuilder>,
  registry: Option<Arc<dyn ImageRegistry>>,
  metadata: Option<Arc<dyn MetadataProvider>>,
  config: BuildConfig,
}

impl Coordinator {
  pub fn new(request_builder: Arc<dyn RequestBuilder>, config: BuildConfig) -> Self {
    Self {
      request_builder,
      registry: None,
      metadata: None,
      config,
    }
  }

  pub fn with_registry(mut self, registry: Arc<dyn ImageRegistry>) -> Self {
    self.registry = Some(registry);
    self
  }

  pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
    self.metadata = Some(metadata);
    self
  }

  /// Build every target and return one response per target.
  pub async fn build(
    &self,
    nodes: &[Node],
    targets: &BTreeMap<String, TargetOptions>,
  ) -> Result<BTreeMap<String, SolveResponse>, BuildError> {
    self.build_with_result_handler(nodes, targets, None).await
  }

  /// Like [`build`](Self::build), also passing every solved per-(target,
  /// node) result to `handler` as soon as it is available.
  ///
  /// Node indexes in result handles refer to the nodes that loaded
  /// successfully, in their original order.
  pub async fn build_with_result_handler(
    &self,
    nodes: &[Node],
    targets: &BTreeMap<String, TargetOptions>,
    handler: Option<ResultHandler>,
  ) -> Result<BTreeMap<String, SolveResponse>, BuildError> {
    if nodes.is_empty() {
      return Err(BuildError::DriverRequired);
    }

    let available: Vec<Node> = nodes
      .iter()
      .filter(|node| {
        if let Some(err) = &node.load_error {
          warn!(node = %node.name, error = %err, "skipping node that failed to load");
        }
        node.is_available()
      })
      .cloned()
      .collect();
    if available.is_empty() {
      return Err(BuildError::NoValidDrivers);
    }

    let no_exports = targets.values().all(|t| t.exports.is_empty() && t.print.is_none());
    if no_exports && !available.iter().any(Node::is_local_daemon) {
      warn!("no output specified; build results will only remain in the build cache");
    }

    let multi_target = targets.len() > 1;
    let wrap = |target: &str, err: BuildError| if multi_target { err.for_target(target) } else { err };

    let resolver = NodeResolver::new(&available);
    let requested: BTreeMap<String, Vec<Platform>> =
      targets.iter().map(|(name, t)| (name.clone(), t.platforms.clone())).collect();
    let assigned = resolver.resolve(&requested).await?;

    let used: BTreeSet<usize> = assigned.values().flatten().map(|r| r.node_index).collect();
    let used: Vec<usize> = used.into_iter().collect();
    resolver.boot(&used).await?;
    resolver.preload_capabilities(&used).await?;
    debug!(nodes = ?used, "booted assigned nodes");

    let mut releases = ReleaseGuard::default();
    let mut prepared: BTreeMap<String, PreparedTarget> = BTreeMap::new();
    for (name, options) in targets {
      let mut pairs = Vec::new();
      for resolved in assigned.get(name).into_iter().flatten() {
        let node_index = resolved.node_index;
        let client = resolver.client(node_index).await?;
        let capabilities = resolver.capabilities(node_index).await?;
        let PreparedRequest { request, release } = self
          .request_builder
          .build_request(RequestContext {
            target: name,
            options,
            node: &available[node_index],
            node_index,
            platforms: &resolved.platforms,
            capabilities: &capabilities,
            config: &self.config,
          })
          .map_err(|err| wrap(name.as_str(), err.into()))?;
        releases.push(release);
        pairs.push(Pair {
          node_index,
          platforms: resolved.platforms.clone(),
          request,
          client,
        });
      }
      prepared.insert(name.clone(), PreparedTarget { pairs, merge: None });
    }

    let placement: Placement = prepared
      .iter()
      .map(|(name, t)| {
        let reqs = t.pairs.iter().map(|p| (p.node_index, p.request.frontend_attrs.clone())).collect();
        (name.clone(), reqs)
      })
      .collect();
    let children = validate_links(&placement)?;
    check_cycles(&placement)?;

    for (name, target) in prepared.iter_mut() {
      target.merge = self
        .validate_exports(&available, &mut target.pairs)
        .map_err(|err| wrap(name.as_str(), err))?;
    }

    let sessions = share_local_mounts(
      prepared
        .values_mut()
        .flat_map(|t| t.pairs.iter_mut())
        .map(|p| (p.node_index, &mut p.request)),
    );
    let clients: HashMap<usize, Arc<dyn BuildClient>> = prepared
      .values()
      .flat_map(|t| t.pairs.iter())
      .map(|p| (p.node_index, p.client.clone()))
      .collect();

    drop(resolver);
    info!(targets = prepared.len(), nodes = available.len(), sessions = sessions.len(), "dispatching build");
    let ctx = DispatchContext {
      nodes: Arc::from(available),
      results: Arc::new(WaitMap::new()),
      registrations: Arc::new(WaitMap::new()),
      children: Arc::new(children),
      handler,
      registry: self.registry.clone(),
      allow_fallback: self.config.allow_fallback_frontend,
    };
    let outcome = self.dispatch(ctx, prepared, multi_target).await;

    close_sessions(&sessions, &clients).await;
    drop(releases);
    outcome
  }

  /// Check exports of a target and prepare multi-node pushes.
  fn validate_exports(&self, nodes: &[Node], pairs: &mut [Pair]) -> Result<Option<MergePush>, BuildError> {
    if pairs.len() < 2 {
      return Ok(None);
    }

    let mut merge: Option<MergePush> = None;
    for pair in pairs.iter() {
      let local_daemon = nodes[pair.node_index].is_local_daemon();
      for export in &pair.request.exports {
        if export.kind == EXPORT_OCI || export.kind == EXPORT_TAR {
          return Err(BuildError::MultiNodeExport(export.kind.clone()));
        }
        if !export.push_requested() {
          continue;
        }
        if local_daemon {
          return Err(BuildError::MultiNodePushLocalDaemon);
        }
        let Some(names) = export.name() else {
          return Err(BuildError::MissingPushTag);
        };
        // The first pushed export decides names and registry settings.
        if merge.is_none() {
          merge = Some(MergePush {
            names: names.split(',').map(str::trim).filter(|n| !n.is_empty()).map(String::from).collect(),
            insecure: export.attrs.get("registry.insecure").is_some_and(|v| v == "true"),
          });
        }
      }
    }

    if merge.is_some() && self.registry.is_none() {
      return Err(BuildError::RegistryRequired);
    }

    // Nodes push by digest only; the merged index carries the tags.
    for pair in pairs.iter_mut() {
      for export in pair.request.exports.iter_mut().filter(|e| e.push_requested()) {
        if let Some(names) = export.name() {
          let repos = manifest::repository_names(names).join(",");
          export.attrs.insert("name".to_string(), repos);
        }
        export.attrs.insert("push-by-digest".to_string(), "true".to_string());
      }
    }
    Ok(merge)
  }

  async fn dispatch(
    &self,
    ctx: DispatchContext,
    prepared: BTreeMap<String, PreparedTarget>,
    multi_target: bool,
  ) -> Result<BTreeMap<String, SolveResponse>, BuildError> {
    let root = CancellationToken::new();
    let mut set = JoinSet::new();

    for (name, target) in prepared {
      let ctx = ctx.clone();
      let cancel = root.child_token();
      let task_name = name.clone();
      set.spawn(async move {
        let result = run_target(ctx, &task_name, target, cancel).await;
        (task_name, result)
      });
      debug!(target = %name, "spawned target");
    }

    let mut responses = BTreeMap::new();
    let mut first_error: Option<BuildError> = None;
    while let Some(joined) = set.join_next().await {
      let (name, result) = match joined {
        Ok(done) => done,
        Err(err) => {
          if first_error.is_none() {
            first_error = Some(BuildError::Task(err.to_string()));
            root.cancel();
          }
          continue;
        }
      };
      match result {
        Ok(mut response) => {
          if let Some(metadata) = &self.metadata {
            let extra = metadata.metadata(&name, &response);
            response.exporter_response.extend(extra);
          }
          responses.insert(name, response);
        }
        Err(err) => {
          if first_error.is_none() {
            warn!(target = %name, error = %err, "target failed, canceling build");
            first_error = Some(if multi_target { err.for_target(&name) } else { err });
            root.cancel();
          }
        }
      }
    }

    match first_error {
      Some(err) => Err(err),
      None => Ok(responses),
    }
  }
}

/// Dispatch every request of one target and aggregate the responses.
async fn run_target(
  ctx: DispatchContext,
  name: &str,
  target: PreparedTarget,
  cancel: CancellationToken,
) -> Result<SolveResponse, BuildError> {
  let mut set = JoinSet::new();
  let mut platforms = Vec::with_capacity(target.pairs.len());

  for (pos, pair) in target.pairs.into_iter().enumerate() {
    let node = &ctx.nodes[pair.node_index];
    platforms.push(pair.platforms);
    let task = PairTask {
      target: name.to_string(),
      node_index: pair.node_index,
      node_name: node.name.clone(),
      builder: node.builder.clone(),
      request: pair.request,
      client: pair.client,
      children: ctx
        .children
        .get(&(pair.node_index, name.to_string()))
        .cloned()
        .unwrap_or_default(),
      results: ctx.results.clone(),
      registrations: ctx.registrations.clone(),
      handler: ctx.handler.clone(),
      allow_fallback: ctx.allow_fallback,
      cancel: cancel.clone(),
    };
    let node_name = task.node_name.clone();
    set.spawn(async move { (pos, node_name, task.run().await) });
  }

  let mut responses: Vec<Option<(String, SolveResponse)>> = (0..platforms.len()).map(|_| None).collect();
  let mut first_error = None;
  while let Some(joined) = set.join_next().await {
    match joined {
      Ok((pos, node, Ok(response))) => responses[pos] = Some((node, response)),
      Ok((_, _, Err(err))) => {
        if first_error.is_none() {
          first_error = Some(err);
          cancel.cancel();
        }
      }
      Err(err) => {
        if first_error.is_none() {
          first_error = Some(BuildError::Task(err.to_string()));
          cancel.cancel();
        }
      }
    }
  }
  if let Some(err) = first_error {
    return Err(err);
  }

  let responses: Vec<(String, SolveResponse)> = responses.into_iter().flatten().collect();
  match target.merge {
    Some(push) if responses.len() > 1 => merge_and_push(&ctx, name, &push, &responses, &platforms).await,
    _ => responses
      .into_iter()
      .next()
      .map(|(_, response)| response)
      .ok_or_else(|| BuildError::Task(format!("no requests were prepared for target {name}"))),
  }
}

/// Combine per-node image descriptors into one index and push it under
/// every requested name.
async fn merge_and_push(
  ctx: &DispatchContext,
  name: &str,
  push: &MergePush,
  responses: &[(String, SolveResponse)],
  platforms: &[Vec<Platform>],
) -> Result<SolveResponse, BuildError> {
  let registry = ctx.registry.as_ref().ok_or(BuildError::RegistryRequired)?;

  let mut descriptors = Vec::with_capacity(responses.len());
  for ((node, response), platforms) in responses.iter().zip(platforms) {
    let mut descriptor = manifest::descriptor_from_response(node, response)?;
    if descriptor.platform.is_none()
      && let [platform] = platforms.as_slice()
    {
      descriptor.platform = Some(platform.clone());
    }
    descriptors.push(descriptor);
  }

  let (index, descriptor) = manifest::combine(&descriptors)?;
  info!(target = %name, digest = %descriptor.digest, manifests = descriptors.len(), "pushing merged image index");
  for tag in &push.names {
    registry.push(tag, &descriptor, &index, push.insecure).await?;
  }

  let mut response = SolveResponse::default();
  response
    .exporter_response
    .insert(EXPORTER_IMAGE_DIGEST.to_string(), descriptor.digest.clone());
  response
    .exporter_response
    .insert(EXPORTER_IMAGE_DESCRIPTOR.to_string(), manifest::encode_descriptor(&descriptor)?);
  if let Some(build_ref) = responses[0].1.exporter_response.get(BUILD_REF_KEY) {
    response
      .exporter_response
      .insert(BUILD_REF_KEY.to_string(), build_ref.clone());
  }
  Ok(response)
}

async fn close_sessions(sessions: &[Arc<SharedSession>], clients: &HashMap<usize, Arc<dyn BuildClient>>) {
  for session in sessions {
    let Some(client) = clients.get(&session.node_index()) else {
      continue;
    };
    if let Err(err) = session.close(client.as_ref()).await {
      warn!(session = %session.id(), error = %err, "failed to close shared session");
    }
  }
}
