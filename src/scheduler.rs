//! Scheduler (§4.9). REDESIGN FLAG: the original's singly-linked queue plus
//! semaphore is replaced by a bounded `std::sync::mpsc` channel; the
//! debounce-and-detach pattern drains whatever has accumulated once the
//! quiet window elapses.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::traversal;
use crate::watch::{ChangeEvent, DirectoryWatcher};

const QUEUE_CAPACITY: usize = 4096;

/// Join handles for detached worker/full-sync threads, collected so
/// shutdown can perform "a final join on all workers and periodic tasks"
/// (§5) before the process exits, rather than leaking them as daemon
/// threads.
type HandleBin = Arc<Mutex<Vec<thread::JoinHandle<()>>>>;

pub struct Scheduler {
    tx: SyncSender<ChangeEvent>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
    worker_handles: HandleBin,
}

impl Scheduler {
    pub fn enqueue_path(&self, path: std::path::PathBuf) {
        let _ = self.tx.try_send(ChangeEvent::Path(path));
    }

    pub fn enqueue_full_sync(&self) {
        let _ = self.tx.try_send(ChangeEvent::FullSync);
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.join();
        }
        for handle in self.worker_handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Shared in-flight tracking so at most one worker processes a given
/// relative path concurrently (§4.9, §5 concurrency guarantee); duplicate
/// queued work for a path already in flight is dropped.
struct WorkerPool {
    in_flight: Mutex<HashSet<String>>,
    slots: std::sync::mpsc::SyncSender<()>,
    slots_rx: Mutex<Receiver<()>>,
}

/// Starts the scheduler's debounce thread, worker pool, and periodic
/// full-sync producer. Returns a handle used to enqueue events and, on
/// shutdown, join every spawned thread. `watches`, when present, is shared
/// with the live `NotifyChangeSource` so periodic full syncs refresh the
/// same bounded directory-watch cache (§4.8).
pub fn spawn(
    config: Arc<Config>,
    debounce: Duration,
    full_sync_cycle: Duration,
    watches: Option<Arc<DirectoryWatcher>>,
) -> Scheduler {
    let (tx, rx) = sync_channel(QUEUE_CAPACITY);
    let shutdown = Arc::new(AtomicBool::new(false));

    let pool = Arc::new(build_worker_pool(config.threads));
    let worker_handles: HandleBin = Arc::new(Mutex::new(Vec::new()));

    let debounce_handle = {
        let config = Arc::clone(&config);
        let shutdown = Arc::clone(&shutdown);
        let pool = Arc::clone(&pool);
        let worker_handles = Arc::clone(&worker_handles);
        thread::Builder::new()
            .name("driftvault-scheduler".into())
            .spawn(move || debounce_loop(config, rx, debounce, shutdown, pool, worker_handles, watches))
            .expect("failed to spawn scheduler thread")
    };

    let producer_handle = {
        let tx = tx.clone();
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("driftvault-full-sync-producer".into())
            .spawn(move || periodic_full_sync_producer(tx, full_sync_cycle, shutdown))
            .expect("failed to spawn full-sync producer thread")
    };

    Scheduler { tx, shutdown, handles: vec![debounce_handle, producer_handle], worker_handles }
}

fn build_worker_pool(threads: usize) -> WorkerPool {
    let (slots_tx, slots_rx) = sync_channel(threads.max(1));
    for _ in 0..threads.max(1) {
        let _ = slots_tx.try_send(());
    }
    WorkerPool {
        in_flight: Mutex::new(HashSet::new()),
        slots: slots_tx,
        slots_rx: Mutex::new(slots_rx),
    }
}

fn periodic_full_sync_producer(tx: SyncSender<ChangeEvent>, cycle: Duration, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(cycle);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let _ = tx.try_send(ChangeEvent::FullSync);
    }
}

/// Main loop (§4.9): block for the first event, then sleep `debounce` to
/// coalesce bursts, detach the entire backlog under one lock acquisition,
/// and process it in order.
fn debounce_loop(
    config: Arc<Config>,
    rx: Receiver<ChangeEvent>,
    debounce: Duration,
    shutdown: Arc<AtomicBool>,
    pool: Arc<WorkerPool>,
    worker_handles: HandleBin,
    watches: Option<Arc<DirectoryWatcher>>,
) {
    let full_sync_running = Arc::new(AtomicBool::new(false));

    loop {
        let first = match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        thread::sleep(debounce);

        let mut batch = vec![first];
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
        }

        for event in batch {
            match event {
                ChangeEvent::Path(path) => dispatch_path(&config, &pool, path, &worker_handles),
                ChangeEvent::FullSync => {
                    dispatch_full_sync(&config, &full_sync_running, &worker_handles, watches.as_ref())
                }
            }
        }

        reap_finished(&worker_handles);

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }
}

/// Drops join handles for threads that have already finished, so the bin
/// doesn't grow unboundedly across a long-running daemon's lifetime; the
/// remainder are joined at shutdown.
fn reap_finished(worker_handles: &HandleBin) {
    worker_handles.lock().retain(|h| !h.is_finished());
}

fn dispatch_path(
    config: &Arc<Config>,
    pool: &Arc<WorkerPool>,
    path: std::path::PathBuf,
    worker_handles: &HandleBin,
) {
    let rel_key = path.to_string_lossy().into_owned();

    {
        let mut in_flight = pool.in_flight.lock();
        if in_flight.contains(&rel_key) {
            debug!(path = %path.display(), "duplicate work for in-flight path dropped");
            return;
        }
        in_flight.insert(rel_key.clone());
    }

    // walk to the parent components synchronously, as §4.9 step 3 requires,
    // then hand the final component to a worker slot.
    let walked = match traversal::path_sync(config, &path) {
        Ok(Some(w)) => w,
        Ok(None) => {
            pool.in_flight.lock().remove(&rel_key);
            return;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "path_sync failed");
            pool.in_flight.lock().remove(&rel_key);
            return;
        }
    };

    acquire_slot(pool);

    let config = Arc::clone(config);
    let pool = Arc::clone(pool);
    let rel_key_for_worker = rel_key.clone();

    if config.threads == 1 {
        run_worker(&config, walked);
        release(&pool, &rel_key_for_worker);
        return;
    }

    let handle = thread::spawn(move || {
        run_worker(&config, walked);
        release(&pool, &rel_key_for_worker);
    });
    worker_handles.lock().push(handle);
}

fn run_worker(config: &Config, (rel_prefix, name): (std::path::PathBuf, String)) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let source_dir = nix::dir::Dir::open(
            &config.source.join(&rel_prefix),
            nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_DIRECTORY,
            nix::sys::stat::Mode::empty(),
        );
        let dest_dir = nix::dir::Dir::open(
            &config.dest.join(&rel_prefix),
            nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_DIRECTORY,
            nix::sys::stat::Mode::empty(),
        );
        match (source_dir, dest_dir) {
            (Ok(source_dir), Ok(dest_dir)) => {
                let rel = rel_prefix.join(&name);
                if let Err(e) = crate::engine::process(config, &source_dir, &dest_dir, &name, &rel) {
                    warn!(path = %rel.display(), error = %e, "worker backup step failed");
                }
            }
            _ => {
                warn!(path = %rel_prefix.join(&name).display(), "worker could not open parent directories");
            }
        }
    }));

    if result.is_err() {
        error!(path = %rel_prefix.join(&name).display(), "worker panicked; path skipped (§7 propagation policy)");
    }
}

fn acquire_slot(pool: &WorkerPool) {
    let _ = pool.slots_rx.lock().recv();
}

fn release(pool: &WorkerPool, rel_key: &str) {
    pool.in_flight.lock().remove(rel_key);
    let _ = pool.slots.try_send(());
}

/// Spawns the full-sync worker on its own thread so it runs concurrently
/// with incremental workers and never blocks the debounce loop from
/// draining further path events (§5: "a full sync may run concurrently
/// with incremental workers"). §4.9 step 3's "if the previous full-sync
/// worker has joined, spawn a new one; otherwise drop" is implemented by
/// `full_sync_running`, which only the worker thread itself clears.
fn dispatch_full_sync(
    config: &Arc<Config>,
    full_sync_running: &Arc<AtomicBool>,
    worker_handles: &HandleBin,
    watches: Option<&Arc<DirectoryWatcher>>,
) {
    if full_sync_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("full sync already running; sentinel dropped");
        return;
    }

    let config = Arc::clone(config);
    let full_sync_running = Arc::clone(full_sync_running);
    let watches = watches.cloned();
    let handle = thread::spawn(move || {
        info!("starting full sync");
        let result = match &watches {
            Some(watches) => traversal::full_sync_observing(&config, watches),
            None => traversal::full_sync(&config),
        };
        if let Err(e) = result {
            error!(error = %e, "full sync failed");
        }
        full_sync_running.store(false, Ordering::SeqCst);
    });
    worker_handles.lock().push(handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_path_is_dropped_while_in_flight() {
        let pool = build_worker_pool(1);
        {
            let mut in_flight = pool.in_flight.lock();
            in_flight.insert("a/b".to_string());
        }
        // a second dispatch for the same key must not proceed to walk/queue.
        assert!(pool.in_flight.lock().contains("a/b"));
    }
}
