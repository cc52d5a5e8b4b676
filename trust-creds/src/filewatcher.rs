//! Filesystem change notifications for individual files.
//!
//! [`FileWatcher`] is the seam between the certificate watch loop and the
//! operating system. [`NotifyFileWatcher`] implements it with the `notify` crate
//! (inotify on Linux, FSEvents on macOS).

use crate::error::{CredentialsError, Result};
use log::debug;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Kind of change observed on a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    /// The file appeared.
    Create,
    /// The file content changed.
    Write,
    /// The file disappeared.
    Remove,
}

impl FileEventKind {
    /// Returns `true` for events that should trigger a reload.
    pub fn is_create_or_write(self) -> bool {
        matches!(self, FileEventKind::Create | FileEventKind::Write)
    }
}

/// A change to one watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// The watched file.
    pub path: PathBuf,
    /// What happened to it.
    pub kind: FileEventKind,
}

/// Event and error channels for one watched file.
///
/// Both channels close when the watcher is closed or dropped.
#[derive(Debug)]
pub struct PathWatch {
    /// Change events for the file.
    pub events: mpsc::UnboundedReceiver<FileEvent>,
    /// Errors reported while watching the file.
    pub errors: mpsc::UnboundedReceiver<CredentialsError>,
}

/// Source of per-file change notifications.
pub trait FileWatcher: Send + 'static {
    /// Starts watching `path` and returns its channels.
    ///
    /// ## Errors
    ///
    /// Returns [`CredentialsError::Watch`] if the path cannot be watched.
    fn add(&mut self, path: &Path) -> Result<PathWatch>;

    /// Releases every watch. Channels returned by [`FileWatcher::add`] close.
    fn close(&mut self);
}

/// [`FileWatcher`] backed by `notify`.
///
/// The parent directory of each file is watched rather than the file itself, so
/// atomic renames and symlink swaps (as done by Kubernetes secret volumes) are
/// observed. An event is reported only when the file's bytes actually changed;
/// only a SHA-256 fingerprint of the content is retained.
///
/// A file may be added more than once (for example a combined certificate and
/// key PEM); every returned [`PathWatch`] receives its events.
pub struct NotifyFileWatcher {
    watcher: Option<RecommendedWatcher>,
    targets: Arc<Mutex<HashMap<PathBuf, Target>>>,
    watched_dirs: HashSet<PathBuf>,
}

struct Target {
    fingerprint: Option<[u8; 32]>,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    events: mpsc::UnboundedSender<FileEvent>,
    errors: mpsc::UnboundedSender<CredentialsError>,
}

impl NotifyFileWatcher {
    /// Creates a watcher with no watched files.
    ///
    /// ## Errors
    ///
    /// Returns [`CredentialsError::Watch`] if the platform watcher cannot be created.
    pub fn new() -> Result<Self> {
        let targets: Arc<Mutex<HashMap<PathBuf, Target>>> = Arc::default();
        let callback_targets = Arc::clone(&targets);

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            dispatch(&callback_targets, res);
        })?;

        Ok(Self {
            watcher: Some(watcher),
            targets,
            watched_dirs: HashSet::new(),
        })
    }
}

impl fmt::Debug for NotifyFileWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyFileWatcher")
            .field("open", &self.watcher.is_some())
            .field("watched_dirs", &self.watched_dirs)
            .finish()
    }
}

impl FileWatcher for NotifyFileWatcher {
    fn add(&mut self, path: &Path) -> Result<PathWatch> {
        let watcher = self
            .watcher
            .as_mut()
            .ok_or_else(|| CredentialsError::Watch("file watcher is closed".into()))?;

        let absolute = std::path::absolute(path).map_err(|e| {
            CredentialsError::Watch(format!("cannot resolve {}: {e}", path.display()))
        })?;
        let (Some(parent), Some(file_name)) = (absolute.parent(), absolute.file_name()) else {
            return Err(CredentialsError::Watch(format!(
                "{} does not name a file",
                absolute.display()
            )));
        };
        // Backends report canonical directory paths (e.g. /private/var on macOS).
        let dir = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
        let path = dir.join(file_name);

        let (events_tx, events) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();

        let subscriber = Subscriber {
            events: events_tx,
            errors: errors_tx,
        };

        // The lock must not be held across `watch()`: the notify backend thread may be
        // blocked in `dispatch` waiting for it.
        lock(&self.targets)
            .entry(path.clone())
            .or_insert_with(|| Target {
                fingerprint: fingerprint(&path),
                subscribers: Vec::new(),
            })
            .subscribers
            .push(subscriber);

        if !self.watched_dirs.contains(&dir) {
            if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                lock(&self.targets).remove(&path);
                return Err(e.into());
            }
            self.watched_dirs.insert(dir.clone());
        }

        debug!("watching {} (directory {})", path.display(), dir.display());
        Ok(PathWatch { events, errors })
    }

    fn close(&mut self) {
        self.watcher.take();
        self.watched_dirs.clear();
        lock(&self.targets).clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn dispatch(targets: &Mutex<HashMap<PathBuf, Target>>, res: notify::Result<notify::Event>) {
    let mut targets = lock(targets);

    match res {
        Ok(event) => {
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            for (path, target) in targets.iter_mut() {
                if !event.paths.iter().any(|p| touches(p, path)) {
                    continue;
                }
                if let Some(kind) = target.observe(path) {
                    for sub in &target.subscribers {
                        let _ = sub.events.send(FileEvent {
                            path: path.clone(),
                            kind,
                        });
                    }
                }
            }
        }
        Err(err) => {
            for (path, target) in targets.iter() {
                if err.paths.is_empty() || err.paths.iter().any(|p| touches(p, path)) {
                    for sub in &target.subscribers {
                        let _ = sub.errors.send(CredentialsError::Watch(err.to_string()));
                    }
                }
            }
        }
    }
}

/// Whether a change at `changed` may have altered the content seen at `target`.
fn touches(changed: &Path, target: &Path) -> bool {
    let dir = target.parent();
    changed == target || changed.parent() == dir || Some(changed) == dir
}

fn fingerprint(path: &Path) -> Option<[u8; 32]> {
    std::fs::read(path).ok().map(|bytes| Sha256::digest(&bytes).into())
}

impl Target {
    fn observe(&mut self, path: &Path) -> Option<FileEventKind> {
        match fingerprint(path) {
            Some(current) => {
                let kind = match self.fingerprint {
                    None => Some(FileEventKind::Create),
                    Some(prev) if prev != current => Some(FileEventKind::Write),
                    Some(_) => None,
                };
                self.fingerprint = Some(current);
                kind
            }
            None => self.fingerprint.take().map(|_| FileEventKind::Remove),
        }
    }
}
