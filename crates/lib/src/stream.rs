//! Fan-out reading of one physical input stream.
//!
//! A [`StreamReplicator`] lets several independent readers consume the same
//! source (typically piped stdin) without buffering it whole. Only the most
//! recently fetched chunk is kept. A reader that has consumed that chunk may
//! fetch the next one only once every other open reader has consumed it too;
//! otherwise it waits. Closing a reader removes it from that rule.
//!
//! Once the stream has been drained and materialized elsewhere,
//! [`StreamReplicator::reset`] switches to buffered mode, where every new
//! reader is an independent cursor over the stored bytes.

use std::fmt;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::consts::STREAM_CHUNK_SIZE;

/// Terminal state of the source, replayed to every reader reaching it.
#[derive(Debug, Clone)]
enum Terminal {
  Eof,
  Error(io::ErrorKind, String),
}

impl Terminal {
  fn from_error(err: &io::Error) -> Self {
    Terminal::Error(err.kind(), err.to_string())
  }

  fn to_result(&self) -> io::Result<usize> {
    match self {
      Terminal::Eof => Ok(0),
      Terminal::Error(kind, message) => Err(io::Error::new(*kind, message.clone())),
    }
  }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReaderCursor {
  offset: u64,
  closed: bool,
  /// Created after the start of the stream left the window.
  late: bool,
}

struct State {
  source: Option<Box<dyn Read + Send>>,
  /// Bytes pulled by `peek` that have not entered the window yet.
  pending: Vec<u8>,
  /// The current window: the most recently fetched chunk.
  buffer: Vec<u8>,
  /// Absolute stream offset of `buffer[0]`.
  base: u64,
  terminal: Option<Terminal>,
  /// A reader is reading from the source with the lock released.
  fetching: bool,
  readers: Vec<ReaderCursor>,
  buffered: Option<Arc<[u8]>>,
}

impl State {
  fn window_end(&self) -> u64 {
    self.base + self.buffer.len() as u64
  }

  /// Whether some open reader other than `id` still has bytes in the window.
  fn has_lagging_reader(&self, id: usize, end: u64) -> bool {
    self
      .readers
      .iter()
      .enumerate()
      .any(|(other, r)| other != id && !r.closed && r.offset < end)
  }

  fn rotate(&mut self, chunk: Vec<u8>) {
    self.base = self.window_end();
    self.buffer = chunk;
  }
}

struct Shared {
  state: Mutex<State>,
  cond: Condvar,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
    self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
  }

  fn read(&self, id: usize, buf: &mut [u8]) -> io::Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }

    let mut state = self.lock();
    loop {
      let reader = state.readers[id];
      if reader.late {
        return Err(io::Error::other("stream advanced past this reader before it started reading"));
      }
      if reader.closed {
        return Ok(0);
      }

      let end = state.window_end();

      if reader.offset < end {
        let start = (reader.offset - state.base) as usize;
        let n = buf.len().min(state.buffer.len() - start);
        buf[..n].copy_from_slice(&state.buffer[start..start + n]);
        state.readers[id].offset += n as u64;
        self.cond.notify_all();
        return Ok(n);
      }

      if state.pending.is_empty()
        && let Some(terminal) = &state.terminal
      {
        return terminal.to_result();
      }

      // Someone else is fetching, or a slower reader still needs the window.
      if state.fetching || state.has_lagging_reader(id, end) {
        state = self.wait(state);
        continue;
      }

      if !state.pending.is_empty() {
        let chunk = std::mem::take(&mut state.pending);
        state.rotate(chunk);
        self.cond.notify_all();
        continue;
      }

      let Some(mut source) = state.source.take() else {
        state.terminal = Some(Terminal::Eof);
        self.cond.notify_all();
        continue;
      };
      state.fetching = true;
      drop(state);

      let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
      let result = loop {
        match source.read(&mut chunk) {
          Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
          other => break other,
        }
      };

      state = self.lock();
      state.source = Some(source);
      state.fetching = false;
      match result {
        Ok(0) => state.terminal = Some(Terminal::Eof),
        Ok(n) => {
          chunk.truncate(n);
          state.rotate(chunk);
        }
        Err(err) => state.terminal = Some(Terminal::from_error(&err)),
      }
      self.cond.notify_all();
      // Loop back: copy from the new window, or report the terminal state.
    }
  }

  fn close(&self, id: usize) {
    let mut state = self.lock();
    state.readers[id].closed = true;
    self.cond.notify_all();
  }
}

/// One physical stream shared by many logical readers.
#[derive(Clone)]
pub struct StreamReplicator {
  shared: Arc<Shared>,
}

impl StreamReplicator {
  pub fn new<R: Read + Send + 'static>(source: R) -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State {
          source: Some(Box::new(source)),
          pending: Vec::new(),
          buffer: Vec::new(),
          base: 0,
          terminal: None,
          fetching: false,
          readers: Vec::new(),
          buffered: None,
        }),
        cond: Condvar::new(),
      }),
    }
  }

  /// Return up to `n` leading bytes of the stream without consuming them.
  ///
  /// Peeking is only possible before any reader has moved past the start of
  /// the stream, or in buffered mode.
  pub fn peek(&self, n: usize) -> io::Result<Vec<u8>> {
    let mut state = self.shared.lock();
    loop {
      if let Some(data) = &state.buffered {
        return Ok(data[..n.min(data.len())].to_vec());
      }
      if !state.fetching {
        break;
      }
      state = self.shared.wait(state);
    }

    if state.base == 0 && state.buffer.len() >= n {
      return Ok(state.buffer[..n].to_vec());
    }
    if state.base != 0 || !state.buffer.is_empty() {
      return Err(io::Error::other("cannot peek a stream that is already being read"));
    }

    while state.pending.len() < n && state.terminal.is_none() {
      let Some(mut source) = state.source.take() else {
        state.terminal = Some(Terminal::Eof);
        break;
      };
      // Readers wait on `fetching` while the lock is released.
      state.fetching = true;
      let mut chunk = vec![0u8; n - state.pending.len()];
      drop(state);

      let result = source.read(&mut chunk);

      state = self.shared.lock();
      state.source = Some(source);
      state.fetching = false;
      self.shared.cond.notify_all();
      match result {
        Ok(0) => state.terminal = Some(Terminal::Eof),
        Ok(read) => state.pending.extend_from_slice(&chunk[..read]),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => state.terminal = Some(Terminal::from_error(&err)),
      }
    }

    if state.pending.is_empty()
      && let Some(Terminal::Error(kind, message)) = &state.terminal
    {
      return Err(io::Error::new(*kind, message.clone()));
    }
    Ok(state.pending[..n.min(state.pending.len())].to_vec())
  }

  /// Switch to buffered mode: every reader created from now on reads `data`
  /// from the start, independently of all others.
  pub fn reset(&self, data: Vec<u8>) {
    let mut state = self.shared.lock();
    state.buffered = Some(Arc::from(data));
    self.shared.cond.notify_all();
  }

  pub fn is_buffered(&self) -> bool {
    self.shared.lock().buffered.is_some()
  }

  /// Create a new logical reader positioned at the start of the stream.
  ///
  /// A live reader created after the start of the stream was released fails
  /// on its first read and never holds back the other readers.
  pub fn new_read_closer(&self) -> ReplicatedReader {
    let mut state = self.shared.lock();
    if let Some(data) = &state.buffered {
      return ReplicatedReader {
        inner: ReaderInner::Buffered(Cursor::new(data.clone())),
      };
    }

    let late = state.base > 0;
    state.readers.push(ReaderCursor {
      offset: 0,
      closed: late,
      late,
    });
    ReplicatedReader {
      inner: ReaderInner::Live {
        shared: self.shared.clone(),
        id: state.readers.len() - 1,
        closed: false,
      },
    }
  }
}

impl fmt::Debug for StreamReplicator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.lock();
    f.debug_struct("StreamReplicator")
      .field("base", &state.base)
      .field("window", &state.buffer.len())
      .field("readers", &state.readers.len())
      .field("buffered", &state.buffered.is_some())
      .finish()
  }
}

enum ReaderInner {
  Live { shared: Arc<Shared>, id: usize, closed: bool },
  Buffered(Cursor<Arc<[u8]>>),
}

/// A logical reader of a [`StreamReplicator`]. Dropping it closes it.
pub struct ReplicatedReader {
  inner: ReaderInner,
}

impl ReplicatedReader {
  /// Stop participating; other readers no longer wait for this one.
  pub fn close(&mut self) {
    if let ReaderInner::Live { shared, id, closed } = &mut self.inner
      && !*closed
    {
      *closed = true;
      shared.close(*id);
    }
  }
}

impl Read for ReplicatedReader {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match &mut self.inner {
      ReaderInner::Live { shared, id, .. } => shared.read(*id, buf),
      ReaderInner::Buffered(cursor) => cursor.read(buf),
    }
  }
}

impl Drop for ReplicatedReader {
  fn drop(&mut self) {
    self.close();
  }
}

impl fmt::Debug for ReplicatedReader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.inner {
      ReaderInner::Live { id, closed, .. } => f.debug_struct("ReplicatedReader").field("id", id).field("closed", closed).finish(),
      ReaderInner::Buffered(cursor) => f
        .debug_struct("ReplicatedReader")
        .field("buffered_position", &cursor.position())
        .finish(),
    }
  }
}

/// A replicated reader consumed from async code.
///
/// A [`ReplicatedReader`] blocks until every other open reader of the same
/// stream has caught up, so it must never be read on a runtime thread. Each
/// chunk is read on the blocking pool instead.
#[derive(Debug, Clone)]
pub struct UploadStream {
  reader: Arc<Mutex<ReplicatedReader>>,
}

impl UploadStream {
  pub fn new(reader: ReplicatedReader) -> Self {
    Self {
      reader: Arc::new(Mutex::new(reader)),
    }
  }

  /// Next chunk of the stream, or `None` at the end.
  pub async fn next_chunk(&self) -> io::Result<Option<Vec<u8>>> {
    let reader = self.reader.clone();
    tokio::task::spawn_blocking(move || -> io::Result<Option<Vec<u8>>> {
      let mut reader = reader.lock().unwrap_or_else(PoisonError::into_inner);
      let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
      let n = reader.read(&mut chunk)?;
      chunk.truncate(n);
      Ok((n > 0).then_some(chunk))
    })
    .await
    .map_err(io::Error::other)?
  }

  pub async fn read_to_end(&self) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = self.next_chunk().await? {
      data.extend_from_slice(&chunk);
    }
    Ok(data)
  }
}
