//! End-to-end coordinator scenarios.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fleetbuild_lib::backend::SolveResponse;
use fleetbuild_lib::build::{BuildError, MetadataProvider, ResultHandle, TargetOptions};
use fleetbuild_lib::consts::{
  BUILD_REF_KEY, EXPORTER_IMAGE_DESCRIPTOR, EXPORTER_IMAGE_DIGEST, MOUNT_CONTEXT, MOUNT_DOCKERFILE, SUBREQUEST_OUTLINE,
};
use fleetbuild_lib::manifest;
use fleetbuild_lib::node::Node;
use fleetbuild_lib::request::{EXPORT_IMAGE, EXPORT_OCI, EXPORT_REGISTRY, ExportEntry};
use tracing_test::traced_test;

use super::common::{
  TestClient, TestRegistry, coordinator, local_daemon_node, platforms, target, test_node,
};

#[tokio::test]
async fn single_target_returns_backend_response() {
  let dir = tempfile::tempdir().unwrap();
  let mut client = TestClient::named("n0");
  client.export_response = BTreeMap::from([
    (EXPORTER_IMAGE_DIGEST.to_string(), "sha256:abc".to_string()),
    ("image.name".to_string(), "acme/app:1".to_string()),
  ]);
  let client = Arc::new(client);
  let nodes = vec![test_node(&client, &["linux/amd64"])];

  let mut app = target("app", dir.path());
  app.platforms = platforms(&["linux/amd64"]);
  app.exports = vec![ExportEntry::new(EXPORT_IMAGE)];
  let targets = BTreeMap::from([("app".to_string(), app)]);

  let responses = coordinator().build(&nodes, &targets).await.unwrap();
  let response = &responses["app"].exporter_response;

  let solved = client.solved();
  assert_eq!(solved.len(), 1);
  assert_eq!(response[EXPORTER_IMAGE_DIGEST], "sha256:abc");
  assert_eq!(response["image.name"], "acme/app:1");
  assert_eq!(response[BUILD_REF_KEY], format!("default/n0/{}", solved[0].ref_id));
  assert_eq!(response.len(), 3);
}

#[tokio::test]
async fn multi_node_push_merges_into_one_index() {
  let dir = tempfile::tempdir().unwrap();
  let amd = Arc::new(TestClient::named("amd").exporting_image("sha256:aaaa", "linux/amd64"));
  let riscv = Arc::new(TestClient::named("riscv").exporting_image("sha256:bbbb", "linux/riscv64"));
  let nodes = vec![test_node(&amd, &["linux/amd64"]), test_node(&riscv, &["linux/riscv64"])];
  let registry = Arc::new(TestRegistry::default());

  let mut app = target("app", dir.path());
  app.platforms = platforms(&["linux/amd64", "linux/riscv64"]);
  app.tags = vec!["acme/app:1.0".to_string(), "acme/app:latest".to_string()];
  app.exports = vec![ExportEntry::new(EXPORT_REGISTRY)];
  let targets = BTreeMap::from([("app".to_string(), app)]);

  let responses = coordinator()
    .with_registry(registry.clone())
    .build(&nodes, &targets)
    .await
    .unwrap();

  // Each node pushes by digest to the bare repository.
  for client in [&amd, &riscv] {
    let solved = client.solved();
    assert_eq!(solved.len(), 1);
    let export = &solved[0].exports[0];
    assert_eq!(export.attrs["name"], "acme/app");
    assert_eq!(export.attrs["push-by-digest"], "true");
  }

  let pushes = registry.pushes();
  assert_eq!(registry.calls.load(Ordering::SeqCst), 2);
  assert_eq!(
    pushes.iter().map(|(name, _, _)| name.as_str()).collect::<Vec<_>>(),
    vec!["acme/app:1.0", "acme/app:latest"]
  );
  assert_eq!(pushes[0].1, pushes[1].1);

  let response = &responses["app"];
  assert_eq!(response.exporter_response[EXPORTER_IMAGE_DIGEST], pushes[0].1);
  let index = manifest::descriptor_from_response("merged", response).unwrap();
  assert_eq!(index.media_type, manifest::MEDIA_TYPE_OCI_INDEX);
  assert!(response.exporter_response.contains_key(EXPORTER_IMAGE_DESCRIPTOR));
}

#[tokio::test]
async fn shared_context_uses_one_session() {
  let dir = tempfile::tempdir().unwrap();
  let client = Arc::new(TestClient::named("n0"));
  let nodes = vec![test_node(&client, &["linux/amd64"])];

  let targets = BTreeMap::from([
    ("api".to_string(), target("api", dir.path())),
    ("worker".to_string(), target("worker", dir.path())),
  ]);

  coordinator().build(&nodes, &targets).await.unwrap();

  let solved = client.solved();
  assert_eq!(solved.len(), 2);
  let context_ids: Vec<_> = solved.iter().map(|r| r.shared_session_for(MOUNT_CONTEXT)).collect();
  let dockerfile_ids: Vec<_> = solved.iter().map(|r| r.shared_session_for(MOUNT_DOCKERFILE)).collect();
  assert!(context_ids[0].is_some());
  assert_eq!(context_ids[0], context_ids[1]);
  assert_eq!(dockerfile_ids[0], context_ids[0]);

  let attached = client.attached();
  assert_eq!(attached.len(), 1);
  assert_eq!(Some(attached[0].as_str()), context_ids[0]);
  assert_eq!(client.closed(), attached);
}

#[tokio::test]
async fn result_handler_sees_every_pair() {
  let dir = tempfile::tempdir().unwrap();
  let a = Arc::new(TestClient::named("a"));
  let b = Arc::new(TestClient::named("b"));
  let nodes = vec![test_node(&a, &["linux/amd64"]), test_node(&b, &["linux/arm64"])];

  let mut app = target("app", dir.path());
  app.platforms = platforms(&["linux/amd64", "linux/arm64"]);
  let targets = BTreeMap::from([("app".to_string(), app)]);

  let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::default();
  let handler = {
    let seen = seen.clone();
    Arc::new(move |handle: &ResultHandle| {
      seen.lock().unwrap().push((handle.target.clone(), handle.node_index));
    })
  };

  coordinator()
    .build_with_result_handler(&nodes, &targets, Some(handler))
    .await
    .unwrap();

  let mut seen = seen.lock().unwrap().clone();
  seen.sort();
  assert_eq!(seen, vec![("app".to_string(), 0), ("app".to_string(), 1)]);
}

#[tokio::test]
async fn empty_node_list_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let targets = BTreeMap::from([("app".to_string(), target("app", dir.path()))]);
  let err = coordinator().build(&[], &targets).await.unwrap_err();
  assert!(matches!(err, BuildError::DriverRequired));
}

#[tokio::test]
async fn nodes_that_failed_to_load_are_skipped() {
  let dir = tempfile::tempdir().unwrap();
  let broken = Node {
    name: "broken".to_string(),
    load_error: Some("certificate expired".to_string()),
    ..Default::default()
  };
  let targets = BTreeMap::from([("app".to_string(), target("app", dir.path()))]);

  let err = coordinator().build(&[broken.clone()], &targets).await.unwrap_err();
  assert_eq!(err.to_string(), "no valid drivers found");

  let client = Arc::new(TestClient::named("ok"));
  let nodes = vec![broken, test_node(&client, &["linux/amd64"])];
  coordinator().build(&nodes, &targets).await.unwrap();
  assert_eq!(client.solved().len(), 1);
}

#[tokio::test]
async fn multi_node_push_needs_a_tag() {
  let dir = tempfile::tempdir().unwrap();
  let a = Arc::new(TestClient::named("a"));
  let b = Arc::new(TestClient::named("b"));
  let nodes = vec![test_node(&a, &["linux/amd64"]), test_node(&b, &["linux/arm64"])];

  let mut app = target("app", dir.path());
  app.platforms = platforms(&["linux/amd64", "linux/arm64"]);
  app.exports = vec![ExportEntry::new(EXPORT_REGISTRY)];
  let targets = BTreeMap::from([("app".to_string(), app)]);

  let err = coordinator()
    .with_registry(Arc::new(TestRegistry::default()))
    .build(&nodes, &targets)
    .await
    .unwrap_err();
  assert!(matches!(err, BuildError::MissingPushTag));
  assert!(a.solved().is_empty());
  assert!(b.solved().is_empty());
}

#[tokio::test]
async fn multi_node_push_from_local_daemon_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let a = Arc::new(TestClient::named("a"));
  let b = Arc::new(TestClient::named("b"));
  let nodes = vec![local_daemon_node(&a, &["linux/amd64"]), test_node(&b, &["linux/arm64"])];

  let mut app = target("app", dir.path());
  app.platforms = platforms(&["linux/amd64", "linux/arm64"]);
  app.tags = vec!["acme/app:1".to_string()];
  app.exports = vec![ExportEntry::new(EXPORT_IMAGE).with_attr("push", "true")];
  let targets = BTreeMap::from([("app".to_string(), app)]);

  let err = coordinator()
    .with_registry(Arc::new(TestRegistry::default()))
    .build(&nodes, &targets)
    .await
    .unwrap_err();
  assert!(matches!(err, BuildError::MultiNodePushLocalDaemon));
}

#[tokio::test]
async fn multi_node_oci_export_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let a = Arc::new(TestClient::named("a"));
  let b = Arc::new(TestClient::named("b"));
  let nodes = vec![test_node(&a, &["linux/amd64"]), test_node(&b, &["linux/arm64"])];

  let mut app = target("app", dir.path());
  app.platforms = platforms(&["linux/amd64", "linux/arm64"]);
  app.exports = vec![ExportEntry::new(EXPORT_OCI)];
  let mut other = target("other", dir.path());
  other.platforms = platforms(&["linux/amd64"]);
  let targets = BTreeMap::from([("app".to_string(), app), ("other".to_string(), other)]);

  let err = coordinator().build(&nodes, &targets).await.unwrap_err();
  assert_eq!(err.to_string(), "target app: oci exports are not supported for multi-node builds");
}

#[tokio::test]
async fn first_failure_is_attributed_to_its_target() {
  let dir = tempfile::tempdir().unwrap();
  let mut client = TestClient::named("n0");
  client.fail_target = Some("broken".to_string());
  let client = Arc::new(client);
  let nodes = vec![test_node(&client, &["linux/amd64"])];

  let targets = BTreeMap::from([
    ("broken".to_string(), target("broken", dir.path())),
    ("fine".to_string(), target("fine", dir.path())),
  ]);

  let err = coordinator().build(&nodes, &targets).await.unwrap_err();
  match err {
    BuildError::Target { target, source } => {
      assert_eq!(target, "broken");
      assert_eq!(source.to_string(), "solve failed: broken failed");
    }
    other => panic!("unexpected error: {other}"),
  }
  // Shared sessions are closed on the failure path too.
  assert_eq!(client.closed(), client.attached());
}

#[tokio::test]
async fn unsupported_outline_retries_with_pinned_frontend() {
  let dir = tempfile::tempdir().unwrap();
  let mut client = TestClient::named("n0");
  client.reject_subrequest = Some(SUBREQUEST_OUTLINE.to_string());
  let client = Arc::new(client);
  let nodes = vec![test_node(&client, &["linux/amd64"])];

  let mut app = target("app", dir.path());
  app.print = Some("outline".to_string());
  let targets = BTreeMap::from([("app".to_string(), app)]);

  coordinator().build(&nodes, &targets).await.unwrap();

  let solved = client.solved();
  assert_eq!(solved.len(), 1);
  assert_eq!(solved[0].frontend, "gateway.v0");
  assert_eq!(solved[0].frontend_attrs["source"], "docker/dockerfile:1.7");
}

struct Provenance {
  calls: AtomicUsize,
}

impl MetadataProvider for Provenance {
  fn metadata(&self, target: &str, _response: &SolveResponse) -> BTreeMap<String, String> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    BTreeMap::from([("buildx.build.provenance".to_string(), format!("{target}-provenance"))])
  }
}

#[tokio::test]
async fn metadata_provider_augments_responses() {
  let dir = tempfile::tempdir().unwrap();
  let client = Arc::new(TestClient::named("n0"));
  let nodes = vec![test_node(&client, &["linux/amd64"])];
  let provenance = Arc::new(Provenance {
    calls: AtomicUsize::new(0),
  });
  let targets = BTreeMap::from([("app".to_string(), target("app", dir.path()))]);

  let responses = coordinator()
    .with_metadata(provenance.clone())
    .build(&nodes, &targets)
    .await
    .unwrap();

  assert_eq!(responses["app"].exporter_response["buildx.build.provenance"], "app-provenance");
  assert_eq!(provenance.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[traced_test]
async fn missing_outputs_are_reported() {
  let dir = tempfile::tempdir().unwrap();
  let client = Arc::new(TestClient::named("n0"));
  let nodes = vec![test_node(&client, &["linux/amd64"])];
  let targets: BTreeMap<String, TargetOptions> = BTreeMap::from([("app".to_string(), target("app", dir.path()))]);

  coordinator().build(&nodes, &targets).await.unwrap();
  assert!(logs_contain("no output specified"));
}

#[tokio::test]
async fn unmatched_platform_falls_back_to_first_node() {
  let dir = tempfile::tempdir().unwrap();
  let first = Arc::new(TestClient::named("first"));
  let second = Arc::new(TestClient::named("second"));
  let nodes = vec![test_node(&first, &["linux/amd64"]), test_node(&second, &["linux/arm64"])];

  let mut app = target("app", dir.path());
  app.platforms = platforms(&["linux/s390x"]);
  let targets = BTreeMap::from([("app".to_string(), app)]);

  coordinator().build(&nodes, &targets).await.unwrap();
  assert_eq!(first.solved().len(), 1);
  assert!(second.solved().is_empty());
}
