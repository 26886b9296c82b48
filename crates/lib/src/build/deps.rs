//! Cross-target context dependencies.
//!
//! A target names another as a build context with
//! `context:<name>=target:<other>`. Before dispatch the links are validated
//! and checked for cycles; at dispatch time the dependent request waits for
//! the producer's result and receives it as a frontend input.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::BuildError;
use crate::backend::GatewayResult;
use crate::consts::{
  ATTR_CONTEXT_PREFIX, ATTR_INPUT_METADATA_PREFIX, EXPORTER_BUILDINFO, EXPORTER_IMAGE_CONFIG, PLATFORM_KEY_SEPARATOR,
  VALUE_INPUT_PREFIX,
};
use crate::request::SolveRequest;
use crate::request::context::target_links;
use crate::waitmap::{WaitError, WaitMap};

/// Results shared between dispatch tasks.
pub type ResultMap = WaitMap<String, Arc<GatewayResult>>;

/// Key of a solved result.
pub fn result_key(node_index: usize, target: &str) -> String {
  format!("{node_index}-{target}")
}

/// Key a dependent target sets once it is done with its producers.
pub fn child_key(node_index: usize, target: &str) -> String {
  format!("{node_index}-child-{target}")
}

/// Frontend attributes of every request, per target, with the node index
/// the request runs on.
pub type Placement = BTreeMap<String, Vec<(usize, BTreeMap<String, String>)>>;

/// Check every `target:` link and compute, per `(node, producer)`, the
/// dependents that must finish before the producer may tear down.
pub fn validate_links(placement: &Placement) -> Result<HashMap<(usize, String), Vec<String>>, BuildError> {
  let mut children: HashMap<(usize, String), BTreeSet<String>> = HashMap::new();

  for (target, requests) in placement {
    for (node_index, attrs) in requests {
      for (context, dependency) in target_links(attrs) {
        let producer = placement.get(&dependency).ok_or_else(|| BuildError::UnknownTarget {
          context: context.clone(),
          dependency: dependency.clone(),
        })?;
        if !producer.iter().any(|(idx, _)| idx == node_index) {
          return Err(BuildError::CrossDriver {
            target: target.clone(),
            context,
          });
        }
        children
          .entry((*node_index, dependency))
          .or_default()
          .insert(target.clone());
      }
    }
  }

  Ok(
    children
      .into_iter()
      .map(|(key, names)| (key, names.into_iter().collect()))
      .collect(),
  )
}

/// Reject target dependency cycles.
pub fn check_cycles(placement: &Placement) -> Result<(), BuildError> {
  let mut graph: DiGraph<&str, ()> = DiGraph::new();
  let indexes: BTreeMap<&str, NodeIndex> = placement
    .keys()
    .map(|name| (name.as_str(), graph.add_node(name.as_str())))
    .collect();

  let mut edges = BTreeSet::new();
  for (target, requests) in placement {
    for (_, attrs) in requests {
      for (_, dependency) in target_links(attrs) {
        if let Some(&from) = indexes.get(dependency.as_str())
          && edges.insert((from, indexes[target.as_str()]))
        {
          graph.add_edge(from, indexes[target.as_str()], ());
        }
      }
    }
  }

  toposort(&graph, None)
    .map(|_| ())
    .map_err(|cycle| BuildError::CycleDetected(graph[cycle.node_id()].to_string()))
}

fn encode_metadata(entries: &[(&str, &[u8])]) -> Option<String> {
  if entries.is_empty() {
    return None;
  }
  let map: BTreeMap<&str, String> = entries.iter().map(|(k, v)| (*k, BASE64.encode(v))).collect();
  serde_json::to_string(&map).ok()
}

fn metadata_for<'a>(result: &'a GatewayResult, suffix: Option<&str>) -> Vec<(&'static str, &'a [u8])> {
  [EXPORTER_IMAGE_CONFIG, EXPORTER_BUILDINFO]
    .into_iter()
    .filter_map(|key| {
      let lookup = match suffix {
        Some(platform) => format!("{key}/{platform}"),
        None => key.to_string(),
      };
      result.metadata.get(&lookup).map(|v| (key, v.as_slice()))
    })
    .collect()
}

/// Substitute a producer's result for the `context:<name>` link.
pub fn link_input(request: &mut SolveRequest, name: &str, result: &GatewayResult) {
  let attrs = &mut request.frontend_attrs;

  if let Some(reference) = &result.reference {
    attrs.insert(format!("{ATTR_CONTEXT_PREFIX}{name}"), format!("{VALUE_INPUT_PREFIX}{name}"));
    if let Some(meta) = encode_metadata(&metadata_for(result, None)) {
      attrs.insert(format!("{ATTR_INPUT_METADATA_PREFIX}{name}"), meta);
    }
    request.frontend_inputs.insert(name.to_string(), reference.clone());
    return;
  }

  attrs.remove(&format!("{ATTR_CONTEXT_PREFIX}{name}"));
  for (platform, reference) in &result.platform_refs {
    let input = format!("{name}{PLATFORM_KEY_SEPARATOR}{platform}");
    attrs.insert(format!("{ATTR_CONTEXT_PREFIX}{input}"), format!("{VALUE_INPUT_PREFIX}{input}"));
    if let Some(meta) = encode_metadata(&metadata_for(result, Some(platform))) {
      attrs.insert(format!("{ATTR_INPUT_METADATA_PREFIX}{input}"), meta);
    }
    request.frontend_inputs.insert(input, reference.clone());
  }
}

/// Block until every producer this request links to has a result on the same
/// node, then wire those results in as frontend inputs.
pub async fn wait_context_deps(
  request: &mut SolveRequest,
  node_index: usize,
  results: &ResultMap,
  cancel: &CancellationToken,
) -> Result<(), BuildError> {
  let links = target_links(&request.frontend_attrs);
  if links.is_empty() {
    return Ok(());
  }

  let keys: Vec<String> = links.iter().map(|(_, dep)| result_key(node_index, dep)).collect();
  debug!(node = node_index, deps = ?keys, "waiting for context dependencies");
  let ready = results.get(&keys, cancel).await.map_err(|err| match err {
    WaitError::Canceled => BuildError::Canceled,
    other => BuildError::Wait(other),
  })?;

  for ((name, _), key) in links.iter().zip(&keys) {
    link_input(request, name, &ready[key]);
  }
  Ok(())
}
