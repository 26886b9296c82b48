//! Running one (target, node) request against its backend.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::deps::{ResultMap, child_key, result_key, wait_context_deps};
use super::types::{BuildError, ResultHandle, ResultHandler};
use crate::backend::{BackendError, BuildClient, GatewayResult, SolveResponse};
use crate::consts::{
  ATTR_REQUEST_ID, ATTR_SOURCE, BUILD_REF_KEY, FALLBACK_FRONTEND_LINT, FALLBACK_FRONTEND_OUTLINE, FRONTEND_GATEWAY,
  SUBREQUEST_LINT, SUBREQUEST_OUTLINE, SUBREQUEST_TARGETS,
};
use crate::request::SolveRequest;
use crate::waitmap::{WaitError, WaitMap};

/// Pinned frontend able to answer `subrequest`, if it is one we know.
fn fallback_frontend(subrequest: &str) -> Option<&'static str> {
  match subrequest {
    SUBREQUEST_OUTLINE | SUBREQUEST_TARGETS => Some(FALLBACK_FRONTEND_OUTLINE),
    SUBREQUEST_LINT => Some(FALLBACK_FRONTEND_LINT),
    _ => None,
  }
}

/// Solve `request`, retrying once through a pinned frontend image when the
/// backend's frontend does not know the requested subrequest.
///
/// Returns the result together with the request that produced it.
pub async fn solve_with_fallback(
  client: &dyn BuildClient,
  request: SolveRequest,
  allow_fallback: bool,
) -> Result<(GatewayResult, SolveRequest), BackendError> {
  let err = match client.solve(&request).await {
    Ok(result) => return Ok((result, request)),
    Err(err) => err,
  };

  let BackendError::UnsupportedSubrequest { name } = &err else {
    return Err(err);
  };
  let Some(image) = fallback_frontend(name) else {
    return Err(err);
  };
  if !allow_fallback || !request.frontend_attrs.contains_key(ATTR_REQUEST_ID) {
    return Err(err);
  }

  warn!(subrequest = %name, frontend = image, "frontend does not support subrequest, retrying with pinned frontend");
  let mut retry = request;
  retry.frontend = FRONTEND_GATEWAY.to_string();
  retry.frontend_attrs.insert(ATTR_SOURCE.to_string(), image.to_string());
  let result = client.solve(&retry).await?;
  Ok((result, retry))
}

/// Everything one dispatch task needs.
pub struct PairTask {
  pub target: String,
  pub node_index: usize,
  pub node_name: String,
  pub builder: String,
  pub request: SolveRequest,
  pub client: Arc<dyn BuildClient>,
  /// Dependents that must finish with this result first.
  pub children: Vec<String>,
  pub results: Arc<ResultMap>,
  pub registrations: Arc<WaitMap<String, ()>>,
  pub handler: Option<ResultHandler>,
  pub allow_fallback: bool,
  pub cancel: CancellationToken,
}

impl PairTask {
  /// Dispatch the request and release its shared sessions, whatever the
  /// outcome.
  pub async fn run(self) -> Result<SolveResponse, BuildError> {
    let client = self.client.clone();
    let sessions = self.request.shared_sessions.clone();
    let cancel = self.cancel.clone();

    let outcome = tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(BuildError::Canceled),
      outcome = self.dispatch() => outcome,
    };

    for session in sessions {
      if let Err(err) = session.release(client.as_ref()).await {
        warn!(session = %session.id(), error = %err, "failed to close shared session");
      }
    }
    outcome
  }

  async fn dispatch(self) -> Result<SolveResponse, BuildError> {
    let PairTask {
      target,
      node_index,
      node_name,
      builder,
      mut request,
      client,
      children,
      results,
      registrations,
      handler,
      allow_fallback,
      cancel,
    } = self;

    wait_context_deps(&mut request, node_index, &results, &cancel).await?;

    for session in &request.shared_sessions {
      session.ensure_attached(client.as_ref()).await?;
    }

    info!(target = %target, node = %node_name, ref_id = %request.ref_id, "solving");
    let (result, request) = solve_with_fallback(client.as_ref(), request, allow_fallback).await?;
    let result = Arc::new(result);
    let request = Arc::new(request);
    results.set(result_key(node_index, &target), result.clone());

    if let Some(handler) = &handler {
      handler(&ResultHandle {
        target: target.clone(),
        node_index,
        result: result.clone(),
        request: request.clone(),
        client: client.clone(),
      });
    }

    if !children.is_empty() {
      // Keep the result alive until every dependent has picked it up.
      let keys: Vec<String> = children.iter().map(|c| child_key(node_index, c)).collect();
      debug!(target = %target, children = ?children, "waiting for dependent targets");
      let evaluate = async { client.evaluate(&result).await.map_err(BuildError::from) };
      let wait = async {
        registrations.get(&keys, &cancel).await.map_err(|err| match err {
          WaitError::Canceled => BuildError::Canceled,
          other => BuildError::Wait(other),
        })
      };
      tokio::try_join!(evaluate, wait)?;
    }

    let mut response = client.export(&request, &result).await?;
    response
      .exporter_response
      .insert(BUILD_REF_KEY.to_string(), format!("{builder}/{node_name}/{}", request.ref_id));

    registrations.set(child_key(node_index, &target), ());
    debug!(target = %target, node = %node_name, "request finished");
    Ok(response)
  }
}
