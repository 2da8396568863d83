use notify::event::{AccessKind, AccessMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A single-slot timer: scheduling again cancels the pending deadline and
/// starts a new one, so a burst of events fires once, `delay` after the last.
#[derive(Debug, Clone)]
pub struct PendingTimer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl PendingTimer {
    pub fn new(delay: Duration) -> Self {
        PendingTimer {
            delay,
            deadline: None,
        }
    }

    /// Cancel any pending deadline and schedule a fresh one.
    pub fn schedule(&mut self) {
        self.schedule_at(Instant::now());
    }

    pub fn schedule_at(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the pending deadline, `None` when nothing is scheduled.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// Consume the deadline if it has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// What the change callback wants the watcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    Done,
    /// Try again after another debounce delay.
    Postpone,
}

/// Watches one file and calls back once per debounced burst of changes.
pub struct FileWatcher {
    watcher: Option<RecommendedWatcher>,
    /// Handle to the background thread processing events
    thread: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Start watching `path`. `on_change` runs on the watcher thread, `debounce`
    /// after the last relevant event of a burst.
    ///
    /// Regular files are watched through their parent directory so editors
    /// that replace the file by rename are still seen. A symlink is watched
    /// directly, which follows it to its target.
    pub fn start<F>(path: &Path, debounce: Duration, mut on_change: F) -> Result<Self, notify::Error>
    where
        F: FnMut() -> Reconcile + Send + 'static,
    {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            Config::default(),
        )?;

        let is_symlink = std::fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        let watched: PathBuf = match path.parent() {
            Some(parent) if !is_symlink => parent.to_path_buf(),
            _ => path.to_path_buf(),
        };
        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        let file_name = path.file_name().map(|n| n.to_os_string());
        let label = path.display().to_string();

        let thread = std::thread::Builder::new()
            .name("persistmap-watcher".into())
            .spawn(move || {
                let mut timer = PendingTimer::new(debounce);

                loop {
                    let received = match timer.remaining(Instant::now()) {
                        Some(wait) => notify_rx.recv_timeout(wait),
                        None => notify_rx
                            .recv()
                            .map_err(|_| mpsc::RecvTimeoutError::Disconnected),
                    };

                    match received {
                        Ok(Ok(event)) => {
                            if is_change(&event.kind) && concerns(&event, file_name.as_ref()) {
                                log::debug!("Change event {:?} on {label}", event.kind);
                                timer.schedule();
                            }
                        }
                        Ok(Err(e)) => {
                            log::warn!("File watcher error: {e}");
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            // Watcher was dropped, exit the thread
                            break;
                        }
                    }

                    if timer.fire_if_due(Instant::now()) && on_change() == Reconcile::Postpone {
                        timer.schedule();
                    }
                }
            })?;

        Ok(FileWatcher {
            watcher: Some(watcher),
            thread: Some(thread),
        })
    }

    /// Stop watching and wait for the event thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the watcher drops its sender, which ends the event loop.
        drop(self.watcher.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("File watcher thread panicked");
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writes, creations, removals and renames count; plain reads do not, so our
/// own reconciliation reads never feed back into the watcher.
fn is_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        _ => false,
    }
}

fn concerns(event: &Event, file_name: Option<&OsString>) -> bool {
    match file_name {
        Some(name) => {
            event.paths.is_empty()
                || event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(name.as_os_str()))
        }
        None => true,
    }
}
