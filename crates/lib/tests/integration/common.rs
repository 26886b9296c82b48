//! Shared test helpers for coordinator integration tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetbuild_lib::backend::{
  BackendError, BuildClient, BuildRef, Capabilities, Driver, GatewayResult, SolveResponse, WorkerInfo,
};
use fleetbuild_lib::build::{Coordinator, Inputs, TargetOptions};
use fleetbuild_lib::config::BuildConfig;
use fleetbuild_lib::consts::{ATTR_REQUEST_ID, ATTR_SOURCE, EXPORTER_IMAGE_DESCRIPTOR};
use fleetbuild_lib::manifest::{self, Descriptor, ImageRegistry, MEDIA_TYPE_OCI_MANIFEST, RegistryError};
use fleetbuild_lib::node::Node;
use fleetbuild_lib::platform::Platform;
use fleetbuild_lib::request::{DefaultRequestBuilder, SolveRequest};
use fleetbuild_lib::session::SharedSession;

/// Ordered record of solve events across every client of a test.
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Build argument naming the target a request belongs to.
pub const MARKER: &str = "build-arg:TARGET";

/// A scripted build backend.
#[derive(Default)]
pub struct TestClient {
  pub name: String,
  pub workers: Vec<Platform>,
  pub solve_delay: Duration,
  /// Fail solving requests of this target.
  pub fail_target: Option<String>,
  /// Subrequest the frontend rejects unless a pinned source is set.
  pub reject_subrequest: Option<String>,
  pub export_response: BTreeMap<String, String>,
  pub log: EventLog,
  pub solved: Mutex<Vec<SolveRequest>>,
  pub attached: Mutex<Vec<String>>,
  pub closed: Mutex<Vec<String>>,
  /// Context archives streamed by solved requests.
  pub uploads: Mutex<Vec<Vec<u8>>>,
  pub evaluated: AtomicUsize,
}

impl TestClient {
  pub fn named(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ..Default::default()
    }
  }

  pub fn solved(&self) -> Vec<SolveRequest> {
    self.solved.lock().unwrap().clone()
  }

  pub fn attached(&self) -> Vec<String> {
    self.attached.lock().unwrap().clone()
  }

  pub fn closed(&self) -> Vec<String> {
    self.closed.lock().unwrap().clone()
  }

  pub fn uploads(&self) -> Vec<Vec<u8>> {
    self.uploads.lock().unwrap().clone()
  }

  /// Respond to exports with an image descriptor for `platform`.
  pub fn exporting_image(mut self, digest: &str, platform: &str) -> Self {
    let descriptor = Descriptor {
      media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
      digest: digest.to_string(),
      size: 512,
      platform: Some(platform.parse().unwrap()),
      annotations: BTreeMap::new(),
    };
    self.export_response.insert(
      EXPORTER_IMAGE_DESCRIPTOR.to_string(),
      manifest::encode_descriptor(&descriptor).unwrap(),
    );
    self
  }

  fn marker(request: &SolveRequest) -> String {
    request.frontend_attrs.get(MARKER).cloned().unwrap_or_default()
  }
}

#[async_trait]
impl BuildClient for TestClient {
  async fn list_workers(&self) -> Result<Vec<WorkerInfo>, BackendError> {
    Ok(vec![WorkerInfo {
      id: format!("{}-worker", self.name),
      platforms: self.workers.clone(),
      ..Default::default()
    }])
  }

  async fn capabilities(&self) -> Result<Capabilities, BackendError> {
    Ok(Capabilities::default())
  }

  async fn solve(&self, request: &SolveRequest) -> Result<GatewayResult, BackendError> {
    let marker = Self::marker(request);
    self.log.lock().unwrap().push(format!("start:{marker}"));
    tokio::time::sleep(self.solve_delay).await;

    if let Some(subrequest) = &self.reject_subrequest
      && request.frontend_attrs.get(ATTR_REQUEST_ID) == Some(subrequest)
      && !request.frontend_attrs.contains_key(ATTR_SOURCE)
    {
      return Err(BackendError::UnsupportedSubrequest {
        name: subrequest.clone(),
      });
    }
    if self.fail_target.as_deref() == Some(marker.as_str()) {
      return Err(BackendError::Solve(format!("{marker} failed")));
    }
    if let Some(upload) = &request.upload {
      let data = upload
        .read_to_end()
        .await
        .map_err(|err| BackendError::Solve(err.to_string()))?;
      self.uploads.lock().unwrap().push(data);
    }

    self.solved.lock().unwrap().push(request.clone());
    self.log.lock().unwrap().push(format!("done:{marker}"));
    Ok(GatewayResult::single(BuildRef(format!("{}-{}", self.name, request.ref_id))))
  }

  async fn evaluate(&self, _result: &GatewayResult) -> Result<(), BackendError> {
    self.evaluated.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn export(&self, _request: &SolveRequest, _result: &GatewayResult) -> Result<SolveResponse, BackendError> {
    Ok(SolveResponse {
      exporter_response: self.export_response.clone(),
    })
  }

  async fn attach_session(&self, session: &SharedSession) -> Result<(), BackendError> {
    self.attached.lock().unwrap().push(session.id().to_string());
    Ok(())
  }

  async fn close_session(&self, session_id: &str) -> Result<(), BackendError> {
    self.closed.lock().unwrap().push(session_id.to_string());
    Ok(())
  }
}

#[derive(Debug)]
pub struct TestDriver {
  client: Arc<TestClient>,
  local: bool,
}

impl std::fmt::Debug for TestClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TestClient").field("name", &self.name).finish()
  }
}

#[async_trait]
impl Driver for TestDriver {
  fn is_local_daemon(&self) -> bool {
    self.local
  }

  async fn boot(&self) -> Result<Arc<dyn BuildClient>, BackendError> {
    Ok(self.client.clone())
  }
}

/// A node served by `client`, declaring `platforms`.
pub fn test_node(client: &Arc<TestClient>, platforms: &[&str]) -> Node {
  node_with_driver(client, platforms, false)
}

/// A node backed by a local image store daemon.
pub fn local_daemon_node(client: &Arc<TestClient>, platforms: &[&str]) -> Node {
  node_with_driver(client, platforms, true)
}

fn node_with_driver(client: &Arc<TestClient>, platforms: &[&str], local: bool) -> Node {
  let driver = Arc::new(TestDriver {
    client: client.clone(),
    local,
  });
  Node::new(client.name.clone(), driver)
    .with_builder("default")
    .with_platforms(platforms.iter().map(|p| p.parse().unwrap()).collect())
}

/// Options for a target built from `context`, tagged with its name.
pub fn target(name: &str, context: &Path) -> TargetOptions {
  let mut options = TargetOptions::new(Inputs::new(context.to_string_lossy()));
  options.build_args.insert("TARGET".to_string(), name.to_string());
  options
}

pub fn platforms(list: &[&str]) -> Vec<Platform> {
  list.iter().map(|p| p.parse().unwrap()).collect()
}

pub fn coordinator() -> Coordinator {
  Coordinator::new(Arc::new(DefaultRequestBuilder), BuildConfig::default())
}

/// Registry recording every push.
#[derive(Debug, Default)]
pub struct TestRegistry {
  pub pushes: Mutex<Vec<(String, String, bool)>>,
  pub calls: AtomicUsize,
}

impl TestRegistry {
  pub fn pushes(&self) -> Vec<(String, String, bool)> {
    self.pushes.lock().unwrap().clone()
  }
}

#[async_trait]
impl ImageRegistry for TestRegistry {
  async fn push(
    &self,
    name: &str,
    descriptor: &Descriptor,
    manifest: &[u8],
    insecure: bool,
  ) -> Result<(), RegistryError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    assert_eq!(manifest.len() as u64, descriptor.size);
    self
      .pushes
      .lock()
      .unwrap()
      .push((name.to_string(), descriptor.digest.clone(), insecure));
    Ok(())
  }
}
