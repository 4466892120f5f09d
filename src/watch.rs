//! Change-event source (§4.8). The raw kernel notification APIs are treated
//! as an external collaborator (`SPEC_FULL.md` §1); here that collaborator
//! is the `notify` crate. The bounded directory-watch cache is, per the
//! REDESIGN FLAG in §9, an arena of entries plus two `HashMap` indices and an
//! index-based LRU list, replacing the intrusive triple-linked structure and
//! fixed hash table in `original_source/notify.c`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How often `NotifyChangeSource::next_event` re-checks its shutdown flag
/// between notification-channel polls, so `SIGINT` is noticed promptly
/// rather than only once an unrelated filesystem event arrives.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A deduplicated, source-relative change event, or the periodic full-sync
/// sentinel (§4.9).
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Path(PathBuf),
    FullSync,
}

/// Abstracts the stream of changed absolute paths, so the scheduler does not
/// depend on a concrete notification backend (§4.8).
pub trait ChangeEventSource: Send {
    /// Blocks until the next change event, or returns `Ok(None)` once the
    /// underlying source has closed or shutdown has been requested (daemon
    /// shutdown).
    fn next_event(&mut self) -> Result<Option<PathBuf>>;
}

/// `notify`-crate-backed implementation. §4.8 describes two separate
/// underlying kernel signals (a mount-level fd stream, a directory-level
/// watch stream) unified by the adapter; here `notify`'s recommended
/// backend plays the mount-level role (it is the abstract, black-box
/// notification source per `SPEC_FULL.md` §1), while this adapter drives
/// its own bounded, explicit per-directory watches — the directory-level
/// stream and watch cache that §4.8 actually specifies — on top of it via
/// `DirectoryWatcher`, rather than delegating watch-count bounding to the
/// underlying library (which has no such cap).
pub struct NotifyChangeSource {
    rx: Receiver<notify::Result<notify::Event>>,
    watches: Arc<DirectoryWatcher>,
    source_root: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl NotifyChangeSource {
    /// Builds a change source sharing `watches` with the traversal driver,
    /// so a startup/periodic full sync and live event handling both refresh
    /// the same bounded LRU set of directory watches (§4.8, §4.6). `shutdown`
    /// is polled between notification-channel waits so a signal handler that
    /// sets it unblocks `next_event` without waiting on the filesystem.
    pub fn new(source_root: &Path, watches: Arc<DirectoryWatcher>, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let rx = watches.take_receiver()?;
        watches.ensure_watch(source_root);
        Ok(NotifyChangeSource { rx, watches, source_root: source_root.to_path_buf(), shutdown })
    }
}

impl ChangeEventSource for NotifyChangeSource {
    fn next_event(&mut self) -> Result<Option<PathBuf>> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.rx.recv_timeout(SHUTDOWN_POLL_INTERVAL) {
                Ok(Ok(event)) => {
                    self.watches.observe(&event);
                    if let Some(path) = event.paths.into_iter().next() {
                        if path.starts_with(&self.source_root) {
                            return Ok(Some(path));
                        }
                    }
                    // event carried no path under our root; keep waiting.
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "notification source reported an error");
                }
                Err(RecvTimeoutError::Timeout) => {
                    // no event within the poll window; re-check shutdown and retry.
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(None), // channel closed: source shut down.
            }
        }
    }
}

/// Ties the bounded `WatchCache` LRU bookkeeping (below) to real
/// non-recursive kernel directory watches, so the cap on live watches
/// (`maxInotifyWatches`) is actually enforced rather than left to the
/// underlying notification library's own (unbounded) internal state.
pub struct DirectoryWatcher {
    watcher: Mutex<RecommendedWatcher>,
    cache: WatchCache,
    rx: Mutex<Option<Receiver<notify::Result<notify::Event>>>>,
}

impl DirectoryWatcher {
    pub fn new(capacity: usize) -> Result<Arc<Self>> {
        let (tx, rx): (Sender<notify::Result<notify::Event>>, _) = std::sync::mpsc::channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| Error::ConfigError(format!("failed to start notification source: {e}")))?;

        Ok(Arc::new(DirectoryWatcher {
            watcher: Mutex::new(watcher),
            cache: WatchCache::new(capacity),
            rx: Mutex::new(Some(rx)),
        }))
    }

    /// Hands the event receiver to its one live consumer (the daemon's
    /// `NotifyChangeSource`). Callers that only seed watches during a full
    /// sync — e.g. the `run`/`purge`/`restore`/`list` commands never call
    /// this at all — don't need it.
    fn take_receiver(&self) -> Result<Receiver<notify::Result<notify::Event>>> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| Error::ConfigError("directory watcher event stream already taken".into()))
    }

    /// Adds or refreshes a non-recursive watch on `path`, evicting (and
    /// unwatching) the LRU entry if the cache is at capacity. A failed
    /// watch creation — e.g. `ENOSPC` — is logged and the path is dropped
    /// from the cache rather than retried: per §7 `ResourceExhausted`, it
    /// relies on a later full sync instead of aborting the daemon.
    pub fn ensure_watch(&self, path: &Path) {
        let evicted = self.cache.touch(path);
        if let Some(evicted_path) = &evicted {
            let _ = self.watcher.lock().unwatch(evicted_path);
            debug!(path = %evicted_path.display(), "evicted directory watch (LRU)");
        }
        if let Err(e) = self.watcher.lock().watch(path, RecursiveMode::NonRecursive) {
            warn!(path = %path.display(), error = %e, "failed to add directory watch; relying on periodic full sync");
            self.cache.remove(path);
        }
    }

    /// Unconditionally drops a watch, mirroring §4.8's `DELETE_SELF`/
    /// `MOVE_SELF` handling.
    pub fn forget(&self, path: &Path) {
        let _ = self.watcher.lock().unwatch(path);
        self.cache.remove(path);
    }

    /// Reacts to one incoming kernel event: refreshes the watch on the
    /// event's containing directory (§4.8: "the parent directory is
    /// added/refreshed"), and for a removal drops any watch held directly
    /// on the affected path (approximating `DELETE_SELF`/`MOVE_SELF`).
    fn observe(&self, event: &notify::Event) {
        let is_removal = matches!(event.kind, notify::EventKind::Remove(_));
        for path in &event.paths {
            if is_removal {
                self.forget(path);
            }
            if let Some(parent) = path.parent() {
                self.ensure_watch(parent);
            }
        }
    }

    pub fn watch_count(&self) -> usize {
        self.cache.len()
    }
}

type WatchId = usize;

struct WatchEntry {
    path: PathBuf,
    prev: Option<WatchId>,
    next: Option<WatchId>,
}

/// Bounded LRU cache of directory watches. Stable slot indices replace raw
/// pointers; eviction and lookup are both O(1).
pub struct WatchCache {
    inner: Mutex<WatchCacheInner>,
}

struct WatchCacheInner {
    arena: Vec<Option<WatchEntry>>,
    free_list: Vec<WatchId>,
    by_path: HashMap<PathBuf, WatchId>,
    head: Option<WatchId>, // most recently used
    tail: Option<WatchId>, // least recently used, evicted first
    capacity: usize,
}

impl WatchCache {
    pub fn new(capacity: usize) -> Self {
        WatchCache {
            inner: Mutex::new(WatchCacheInner {
                arena: Vec::new(),
                free_list: Vec::new(),
                by_path: HashMap::new(),
                head: None,
                tail: None,
                capacity,
            }),
        }
    }

    /// Adds or refreshes a directory watch for `path`, evicting the LRU tail
    /// if the cache is at capacity. Returns the id evicted, if any, so the
    /// caller can release the corresponding kernel watch.
    pub fn touch(&self, path: &Path) -> Option<PathBuf> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_path.get(path) {
            inner.move_to_front(id);
            return None;
        }

        let evicted = if inner.by_path.len() >= inner.capacity {
            inner.evict_tail()
        } else {
            None
        };

        let id = inner.alloc(path.to_path_buf());
        inner.push_front(id);
        inner.by_path.insert(path.to_path_buf(), id);

        if let Some(ref evicted_path) = evicted {
            debug!(path = %evicted_path.display(), "evicted watch cache entry (LRU)");
        }
        evicted
    }

    /// Unconditionally removes a path from the cache (`DELETE_SELF`/
    /// `MOVE_SELF` per §4.8).
    pub fn remove(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.by_path.remove(path) {
            inner.unlink(id);
            inner.arena[id] = None;
            inner.free_list.push(id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_path.len()
    }
}

impl WatchCacheInner {
    fn alloc(&mut self, path: PathBuf) -> WatchId {
        let entry = WatchEntry { path, prev: None, next: None };
        if let Some(id) = self.free_list.pop() {
            self.arena[id] = Some(entry);
            id
        } else {
            self.arena.push(Some(entry));
            self.arena.len() - 1
        }
    }

    fn push_front(&mut self, id: WatchId) {
        let old_head = self.head;
        if let Some(entry) = self.arena[id].as_mut() {
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(old_head_id) = old_head {
            if let Some(old_head_entry) = self.arena[old_head_id].as_mut() {
                old_head_entry.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn unlink(&mut self, id: WatchId) {
        let (prev, next) = match self.arena[id].as_ref() {
            Some(e) => (e.prev, e.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.arena[p].as_mut() {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.arena[n].as_mut() {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, id: WatchId) {
        if self.head == Some(id) {
            return;
        }
        self.unlink(id);
        if let Some(entry) = self.arena[id].as_mut() {
            entry.prev = None;
            entry.next = None;
        }
        self.push_front(id);
    }

    fn evict_tail(&mut self) -> Option<PathBuf> {
        let tail_id = self.tail?;
        self.unlink(tail_id);
        let entry = self.arena[tail_id].take()?;
        self.by_path.remove(&entry.path);
        self.free_list.push(tail_id);
        Some(entry.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = WatchCache::new(2);
        cache.touch(Path::new("/a"));
        cache.touch(Path::new("/b"));
        assert_eq!(cache.len(), 2);

        // touching /a makes /b the LRU entry
        cache.touch(Path::new("/a"));
        let evicted = cache.touch(Path::new("/c"));
        assert_eq!(evicted.as_deref(), Some(Path::new("/b")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn remove_is_unconditional() {
        let cache = WatchCache::new(4);
        cache.touch(Path::new("/a"));
        cache.remove(Path::new("/a"));
        assert_eq!(cache.len(), 0);
        cache.remove(Path::new("/a")); // no-op, must not panic
    }

    #[test]
    fn touching_existing_entry_does_not_grow_cache() {
        let cache = WatchCache::new(4);
        cache.touch(Path::new("/a"));
        cache.touch(Path::new("/a"));
        assert_eq!(cache.len(), 1);
    }
}
