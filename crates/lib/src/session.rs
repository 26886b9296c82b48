//! Shared upload sessions.
//!
//! When several requests on the same node mount the same directory under the
//! same name, the directory is uploaded once through a shared session instead
//! of once per request. A session may carry several mount names but never the
//! same name twice.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::backend::{BackendError, BuildClient};
use crate::consts::ATTR_LOCAL_SESSION_PREFIX;
use crate::request::SolveRequest;
use crate::util::hash::unique_id;

/// A directory synced through a shared session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedDir {
  pub path: PathBuf,
  /// Force uid/gid 0 on uploaded files so results are reproducible.
  pub reset_ownership: bool,
}

/// One upload session serving several requests on a node.
pub struct SharedSession {
  id: String,
  node_index: usize,
  dirs: BTreeMap<String, SyncedDir>,
  members: AtomicUsize,
  attached: OnceCell<()>,
  closed: AtomicBool,
}

impl SharedSession {
  fn new(node_index: usize, dirs: BTreeMap<String, SyncedDir>, members: usize) -> Self {
    Self {
      id: unique_id(),
      node_index,
      dirs,
      members: AtomicUsize::new(members),
      attached: OnceCell::new(),
      closed: AtomicBool::new(false),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn node_index(&self) -> usize {
    self.node_index
  }

  pub fn dirs(&self) -> &BTreeMap<String, SyncedDir> {
    &self.dirs
  }

  /// Requests that have not finished yet.
  pub fn members(&self) -> usize {
    self.members.load(Ordering::SeqCst)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Attach the session to the transport. Only the first caller attaches.
  pub async fn ensure_attached(&self, client: &dyn BuildClient) -> Result<(), BackendError> {
    self
      .attached
      .get_or_try_init(|| async {
        debug!(session = %self.id, node = self.node_index, "attaching shared session");
        client.attach_session(self).await
      })
      .await
      .map(|_| ())
  }

  /// A member request finished. The last one closes the session.
  pub async fn release(&self, client: &dyn BuildClient) -> Result<(), BackendError> {
    let previous = self
      .members
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .unwrap_or(0);
    if previous == 1 {
      self.close(client).await?;
    }
    Ok(())
  }

  /// Close the session. Safe to call more than once.
  pub async fn close(&self, client: &dyn BuildClient) -> Result<(), BackendError> {
    if self.closed.swap(true, Ordering::SeqCst) || !self.attached.initialized() {
      return Ok(());
    }
    debug!(session = %self.id, node = self.node_index, "closing shared session");
    client.close_session(&self.id).await
  }
}

impl fmt::Debug for SharedSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedSession")
      .field("id", &self.id)
      .field("node_index", &self.node_index)
      .field("dirs", &self.dirs)
      .field("members", &self.members())
      .finish()
  }
}

fn canonical(path: &Path) -> PathBuf {
  dunce::canonicalize(path).unwrap_or_else(|err| {
    warn!(path = %path.display(), error = %err, "could not resolve mount directory");
    path.to_path_buf()
  })
}

#[derive(Default)]
struct Reservation {
  dirs: BTreeMap<String, SyncedDir>,
  /// Request position -> mount names routed through this session.
  members: BTreeMap<usize, Vec<String>>,
}

/// Route identical local mounts of `requests` through shared sessions.
///
/// Each item pairs a request with the index of the node it runs on. Returns
/// the sessions created; member requests hold them in `shared_sessions` and
/// carry a `local-sessionid:<mount>` attribute per shared mount.
pub fn share_local_mounts<'a, I>(requests: I) -> Vec<Arc<SharedSession>>
where
  I: IntoIterator<Item = (usize, &'a mut SolveRequest)>,
{
  let mut requests: Vec<(usize, &'a mut SolveRequest)> = requests.into_iter().collect();

  let mut groups: BTreeMap<(usize, String, PathBuf), BTreeSet<usize>> = BTreeMap::new();
  for (pos, (node, req)) in requests.iter().enumerate() {
    if req.upload.is_some() {
      continue;
    }
    for (name, dir) in &req.local_mounts {
      if req.shared_session_for(name).is_some() {
        continue;
      }
      groups
        .entry((*node, name.clone(), canonical(dir)))
        .or_default()
        .insert(pos);
    }
  }

  let mut reservations: BTreeMap<usize, Vec<Reservation>> = BTreeMap::new();
  for ((node, name, dir), members) in groups {
    if members.len() < 2 {
      continue;
    }
    let slots = reservations.entry(node).or_default();
    let slot = match slots.iter().position(|r| !r.dirs.contains_key(&name)) {
      Some(i) => i,
      None => {
        slots.push(Reservation::default());
        slots.len() - 1
      }
    };
    let reservation = &mut slots[slot];
    reservation.dirs.insert(
      name.clone(),
      SyncedDir {
        path: dir,
        reset_ownership: true,
      },
    );
    for pos in members {
      reservation.members.entry(pos).or_default().push(name.clone());
    }
  }

  let mut sessions = Vec::new();
  for (node, slots) in reservations {
    for reservation in slots {
      let session = Arc::new(SharedSession::new(node, reservation.dirs, reservation.members.len()));
      debug!(
        session = %session.id,
        node,
        mounts = session.dirs.len(),
        members = reservation.members.len(),
        "sharing local mounts"
      );
      for (pos, names) in reservation.members {
        let req = &mut requests[pos].1;
        for name in names {
          req
            .frontend_attrs
            .insert(format!("{ATTR_LOCAL_SESSION_PREFIX}{name}"), session.id.clone());
        }
        req.shared_sessions.push(session.clone());
      }
      sessions.push(session);
    }
  }
  sessions
}
