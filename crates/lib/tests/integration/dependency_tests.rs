//! Targets consuming other targets as build contexts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleetbuild_lib::backend::BuildRef;
use fleetbuild_lib::build::BuildError;

use super::common::{TestClient, coordinator, platforms, target, test_node};

#[tokio::test]
async fn dependent_waits_for_its_producer() {
  let dir = tempfile::tempdir().unwrap();
  let mut client = TestClient::named("n0");
  client.solve_delay = Duration::from_millis(20);
  let client = Arc::new(client);
  let nodes = vec![test_node(&client, &["linux/amd64"])];

  let mut app = target("app", dir.path());
  app.inputs = app.inputs.with_context("base", "target:base");
  let targets = BTreeMap::from([("app".to_string(), app), ("base".to_string(), target("base", dir.path()))]);

  coordinator().build(&nodes, &targets).await.unwrap();

  let log = client.log.lock().unwrap().clone();
  assert_eq!(log, vec!["start:base", "done:base", "start:app", "done:app"]);

  let solved = client.solved();
  let base = solved.iter().find(|r| r.frontend_attrs["build-arg:TARGET"] == "base").unwrap();
  let app = solved.iter().find(|r| r.frontend_attrs["build-arg:TARGET"] == "app").unwrap();
  assert_eq!(app.frontend_attrs["context:base"], "input:base");
  assert_eq!(app.frontend_inputs["base"], BuildRef(format!("n0-{}", base.ref_id)));
  // The producer stays alive until its dependent is done with it.
  assert_eq!(client.evaluated.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_context_target_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let client = Arc::new(TestClient::named("n0"));
  let nodes = vec![test_node(&client, &["linux/amd64"])];

  let mut app = target("app", dir.path());
  app.inputs = app.inputs.with_context("base", "target:missing");
  let targets = BTreeMap::from([("app".to_string(), app)]);

  let err = coordinator().build(&nodes, &targets).await.unwrap_err();
  assert_eq!(err.to_string(), "failed to find target missing for context base");
  assert!(client.solved().is_empty());
}

#[tokio::test]
async fn producer_on_another_node_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let amd = Arc::new(TestClient::named("amd"));
  let arm = Arc::new(TestClient::named("arm"));
  let nodes = vec![test_node(&amd, &["linux/amd64"]), test_node(&arm, &["linux/arm64"])];

  let mut app = target("app", dir.path());
  app.platforms = platforms(&["linux/amd64"]);
  app.inputs = app.inputs.with_context("base", "target:base");
  let mut base = target("base", dir.path());
  base.platforms = platforms(&["linux/arm64"]);
  let targets = BTreeMap::from([("app".to_string(), app), ("base".to_string(), base)]);

  let err = coordinator().build(&nodes, &targets).await.unwrap_err();
  assert!(matches!(err, BuildError::CrossDriver { ref target, ref context } if target == "app" && context == "base"));
  assert!(amd.solved().is_empty());
  assert!(arm.solved().is_empty());
}

#[tokio::test]
async fn context_cycle_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let client = Arc::new(TestClient::named("n0"));
  let nodes = vec![test_node(&client, &["linux/amd64"])];

  let mut a = target("a", dir.path());
  a.inputs = a.inputs.with_context("b", "target:b");
  let mut b = target("b", dir.path());
  b.inputs = b.inputs.with_context("a", "target:a");
  let targets = BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]);

  let err = coordinator().build(&nodes, &targets).await.unwrap_err();
  assert!(matches!(err, BuildError::CycleDetected(_)));
  assert!(client.solved().is_empty());
}

#[tokio::test]
async fn failing_producer_cancels_dependent() {
  let dir = tempfile::tempdir().unwrap();
  let mut client = TestClient::named("n0");
  client.fail_target = Some("base".to_string());
  let client = Arc::new(client);
  let nodes = vec![test_node(&client, &["linux/amd64"])];

  let mut app = target("app", dir.path());
  app.inputs = app.inputs.with_context("base", "target:base");
  let targets = BTreeMap::from([("app".to_string(), app), ("base".to_string(), target("base", dir.path()))]);

  let err = coordinator().build(&nodes, &targets).await.unwrap_err();
  assert!(matches!(err, BuildError::Target { ref target, .. } if target == "base"));
  let log = client.log.lock().unwrap().clone();
  assert!(!log.iter().any(|e| e == "start:app"));
}
