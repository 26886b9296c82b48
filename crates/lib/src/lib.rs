//! fleetbuild-lib: orchestration core for multi-node container image builds
//!
//! This crate decides which build node handles which platform of each target
//! and drives the resulting requests against remote build backends:
//! - `resolve`: platform-to-node assignment with a strict and a compatible pass
//! - `build`: the coordinator dispatching concurrent per-(target, node) requests
//! - `session`: shared upload sessions for identical local directories
//! - `stream`: fan-out reading of a single piped input stream
//! - `manifest`: merging per-node images into one multi-platform index

pub mod backend;
pub mod build;
pub mod config;
pub mod consts;
pub mod manifest;
pub mod node;
pub mod platform;
pub mod request;
pub mod resolve;
pub mod session;
pub mod stream;
pub mod util;
pub mod waitmap;
