//! A key-value binding over a single JSON file.
//!
//! The whole document is mirrored in memory. Every mutation is applied to the
//! mirror right away and then persisted by a background write-back worker,
//! which rewrites the entire file under an exclusive lock. Edits made to the
//! file by other processes are picked up by a debounced watcher and merged
//! into the mirror in place.

use crate::error::{BindingError, Result};
use crate::merge;
use crate::watcher::{FileWatcher, Reconcile};
use crate::writer::{self, OpenMode};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default delay between the last external change event and reconciliation.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

const EMPTY_DOCUMENT: &str = "{}";

#[derive(Debug, Clone)]
pub struct JsonStoreOptions {
    /// Quiet period after a change event before the file is re-read.
    pub debounce: Duration,
    /// Watch the file for external edits.
    pub watch: bool,
}

impl Default for JsonStoreOptions {
    fn default() -> Self {
        JsonStoreOptions {
            debounce: DEFAULT_DEBOUNCE,
            watch: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Mirror loaded, no watcher running.
    Loaded,
    /// Mirror loaded and the file is being watched for external edits.
    Watching,
    /// Flushed and shut down. Reads still serve the last mirror.
    Closed,
}

/// The in-memory document plus the bookkeeping shared with the watcher and
/// write-back threads.
struct Mirror {
    path: PathBuf,
    doc: RwLock<Map<String, Value>>,
    /// Write-backs dispatched but not yet finished.
    in_flight: AtomicUsize,
    /// Bumped on every local mutation.
    generation: AtomicU64,
}

impl Mirror {
    fn read(&self) -> RwLockReadGuard<'_, Map<String, Value>> {
        self.doc.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Map<String, Value>> {
        self.doc.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-read the file and merge it into the mirror. A malformed file leaves
    /// the mirror untouched.
    fn reconcile(&self) -> Reconcile {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return Reconcile::Postpone;
        }
        let generation = self.generation.load(Ordering::SeqCst);

        let content = match writer::read_shared(&self.path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!(
                    "Could not re-read {}: {e}. Keeping the in-memory document.",
                    self.path.display()
                );
                return Reconcile::Done;
            }
        };
        let parsed = match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                log::warn!(
                    "{} no longer holds a JSON object. Keeping the in-memory document.",
                    self.path.display()
                );
                return Reconcile::Done;
            }
            Err(e) => {
                log::warn!(
                    "Could not parse {}: {e}. Keeping the in-memory document; new entries may not be saved.",
                    self.path.display()
                );
                return Reconcile::Done;
            }
        };

        let mut doc = self.write();
        // A local mutation slipped in while the file was being read; its
        // write-back will trigger another round.
        if self.in_flight.load(Ordering::SeqCst) > 0
            || self.generation.load(Ordering::SeqCst) != generation
        {
            return Reconcile::Postpone;
        }
        merge::merge_object(&mut doc, &parsed);
        log::debug!("Reconciled {} from disk", self.path.display());
        Reconcile::Done
    }
}

enum WriteJob {
    Persist(String),
    Barrier(mpsc::Sender<()>),
}

/// Background thread that persists document snapshots in dispatch order.
struct WriteBack {
    tx: Option<mpsc::Sender<WriteJob>>,
    thread: Option<JoinHandle<()>>,
}

impl WriteBack {
    fn start(mirror: Arc<Mirror>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteJob>();

        let thread = std::thread::Builder::new()
            .name("persistmap-writeback".into())
            .spawn(move || {
                for job in rx {
                    match job {
                        WriteJob::Persist(snapshot) => {
                            match writer::write(&mirror.path, &snapshot, OpenMode::Truncate) {
                                Ok(()) => log::debug!(
                                    "Wrote {} bytes to {}",
                                    snapshot.len(),
                                    mirror.path.display()
                                ),
                                Err(e) => log::error!("Write-back failed: {e}"),
                            }
                            mirror.in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                        WriteJob::Barrier(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })?;

        Ok(WriteBack {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    fn dispatch(&self, mirror: &Mirror, snapshot: String) {
        let sent = match &self.tx {
            Some(tx) => tx.send(WriteJob::Persist(snapshot)).is_ok(),
            None => false,
        };
        if !sent {
            mirror.in_flight.fetch_sub(1, Ordering::SeqCst);
            log::error!(
                "Write-back worker for {} is gone; change not persisted",
                mirror.path.display()
            );
        }
    }

    /// Block until every job queued before this call has finished.
    fn barrier(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if let Some(tx) = &self.tx {
            if tx.send(WriteJob::Barrier(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    /// Drain the queue and join the worker.
    fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Write-back thread panicked");
            }
        }
    }
}

impl Drop for WriteBack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Lifecycle {
    state: StoreState,
    watcher: Option<FileWatcher>,
    write_back: Option<WriteBack>,
    /// Outcome of the final flush, once `close` has run.
    flushed: Option<bool>,
}

struct Inner {
    mirror: Arc<Mirror>,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        let path = &self.mirror.path;

        match lifecycle.flushed {
            Some(true) => return Ok(()),
            Some(false) => return Err(BindingError::Closed(path.clone())),
            None => {}
        }

        if let Some(watcher) = lifecycle.watcher.take() {
            watcher.stop();
        }
        if let Some(mut write_back) = lifecycle.write_back.take() {
            write_back.shutdown();
        }
        lifecycle.state = StoreState::Closed;

        let result = serde_json::to_string(&*self.mirror.read())
            .map_err(BindingError::from)
            .and_then(|snapshot| writer::write(path, &snapshot, OpenMode::Truncate));

        lifecycle.flushed = Some(result.is_ok());
        match &result {
            Ok(()) => log::info!("Flushed and closed {}", path.display()),
            Err(e) => log::error!("Final flush of {} failed: {e}", path.display()),
        }
        result
    }
}

/// A live JSON document bound to a file.
///
/// Cloning is cheap and every clone refers to the same document.
#[derive(Clone)]
pub struct JsonStore {
    inner: Arc<Inner>,
}

impl JsonStore {
    /// Open (or create) the JSON file at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, JsonStoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: JsonStoreOptions) -> Result<Self> {
        let path = absolute(path.as_ref())?;
        prepare_target(&path)?;

        let doc = load_document(&path)?;
        log::info!("Loaded {} ({} keys)", path.display(), doc.len());

        let mirror = Arc::new(Mirror {
            path: path.clone(),
            doc: RwLock::new(doc),
            in_flight: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        });

        let write_back = WriteBack::start(Arc::clone(&mirror))?;

        let (state, watcher) = if options.watch {
            let watched = Arc::clone(&mirror);
            let watcher = FileWatcher::start(&path, options.debounce, move || watched.reconcile())?;
            (StoreState::Watching, Some(watcher))
        } else {
            (StoreState::Loaded, None)
        };

        Ok(JsonStore {
            inner: Arc::new(Inner {
                mirror,
                lifecycle: Mutex::new(Lifecycle {
                    state,
                    watcher,
                    write_back: Some(write_back),
                    flushed: None,
                }),
            }),
        })
    }

    /// The absolute path of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.mirror.path
    }

    pub fn state(&self) -> StoreState {
        self.inner.lifecycle().state
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.mirror.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.mirror.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.mirror.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.mirror.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.mirror.read().is_empty()
    }

    /// A copy of the whole document.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.inner.mirror.read().clone())
    }

    /// Set `key` to `value` and schedule a write-back.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.mutate(|doc| {
            doc.insert(key.to_string(), value);
        })
    }

    /// Remove `key` and schedule a write-back. Removing a missing key still
    /// rewrites the file.
    pub fn delete(&self, key: &str) -> Result<Option<Value>> {
        self.mutate(|doc| doc.remove(key))
    }

    /// Edit the value at `key` in place, starting from `null` when the key is
    /// absent, and schedule a write-back.
    ///
    /// `edit` runs while the store's locks are held, so it must not call back
    /// into this store (or any clone of it): doing so deadlocks.
    pub fn update<F>(&self, key: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Value),
    {
        self.mutate(|doc| edit(doc.entry(key.to_string()).or_insert(Value::Null)))
    }

    /// Wait until every write-back dispatched so far has reached the file.
    pub fn flush(&self) -> Result<()> {
        let lifecycle = self.inner.lifecycle();
        match &lifecycle.write_back {
            Some(write_back) => {
                write_back.barrier();
                Ok(())
            }
            None => Err(BindingError::Closed(self.inner.mirror.path.clone())),
        }
    }

    /// Stop watching, drain pending write-backs and write the mirror one last
    /// time, synchronously.
    ///
    /// Closing twice does not write twice: the second call reports whether the
    /// first flush succeeded.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// A handle the owning process can run from its termination handlers.
    pub fn shutdown_hook(&self) -> ShutdownHook {
        ShutdownHook {
            inner: Arc::clone(&self.inner),
        }
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut Map<String, Value>) -> R) -> Result<R> {
        // Held across dispatch so write-backs queue in mutation order.
        let lifecycle = self.inner.lifecycle();
        let mirror = &self.inner.mirror;
        let write_back = match (&lifecycle.write_back, lifecycle.state) {
            (Some(write_back), StoreState::Loaded | StoreState::Watching) => write_back,
            _ => return Err(BindingError::Closed(mirror.path.clone())),
        };

        let (result, snapshot) = {
            let mut doc = mirror.write();
            let result = apply(&mut doc);
            let snapshot = serde_json::to_string(&*doc)?;
            mirror.in_flight.fetch_add(1, Ordering::SeqCst);
            mirror.generation.fetch_add(1, Ordering::SeqCst);
            (result, snapshot)
        };

        write_back.dispatch(mirror, snapshot);
        Ok(result)
    }
}

impl fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonStore")
            .field("path", &self.inner.mirror.path)
            .field("state", &self.state())
            .finish()
    }
}

/// Flushes a [`JsonStore`] when the process is about to exit.
#[derive(Clone)]
pub struct ShutdownHook {
    inner: Arc<Inner>,
}

impl ShutdownHook {
    /// Close the store and return the exit code the process should use:
    /// 0 when the final flush succeeded, 1 otherwise. Safe to run more than
    /// once, from any thread.
    pub fn run(&self) -> i32 {
        match self.inner.close() {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Reject unusable targets and make sure the file holds at least `{}`.
///
/// A dangling symlink is followed: the document is created at its target.
fn prepare_target(path: &Path) -> Result<()> {
    let is_symlink = std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);

    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            return Err(BindingError::InvalidTarget {
                path: path.to_path_buf(),
                reason: "is a directory".into(),
            });
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if is_symlink {
        log::warn!(
            "{} is a symlink, unexpected behaviour may occur",
            path.display()
        );
    }

    if writer::init_if_empty(path, EMPTY_DOCUMENT)? {
        log::debug!("Initialized {} with an empty document", path.display());
    }
    Ok(())
}

fn load_document(path: &Path) -> Result<Map<String, Value>> {
    let content = writer::read_shared(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map),
        _ => Err(BindingError::InvalidTarget {
            path: path.to_path_buf(),
            reason: "document root is not a JSON object".into(),
        }),
    }
}
