//! Background delivery trigger.
//!
//! A fixed pool of OS threads, each owning a disjoint set of connections.
//! Membership changes are queued under a short lock and flagged in an atomic
//! mask; wake-ups after an inject only touch the mask. A worker with nothing
//! flagged parks for at most the idle interval.
use ahash::RandomState;
use hashbrown::{HashMap, HashSet};
use herald_common::ids::ConnectionId;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crate::subscriber::Subscriber;

const ADD: u8 = 1;
const REMOVE: u8 = 2;
const AWAKE: u8 = 4;

#[derive(Default)]
struct Pending {
    added: HashMap<ConnectionId, Arc<Subscriber>, RandomState>,
    removed: HashSet<ConnectionId, RandomState>,
}

struct Worker {
    index: usize,
    pending: Mutex<Pending>,
    mask: AtomicU8,
    // Connections assigned to this worker, including queued additions.
    load: AtomicUsize,
    stop: AtomicBool,
    thread: OnceLock<Thread>,
    idle_interval: Duration,
}

impl Worker {
    fn new(index: usize, idle_interval: Duration) -> Self {
        Self {
            index,
            pending: Mutex::new(Pending::default()),
            mask: AtomicU8::new(0),
            load: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            thread: OnceLock::new(),
            idle_interval,
        }
    }

    fn flag(&self, bit: u8) {
        self.mask.fetch_or(bit, Ordering::AcqRel);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    fn run(&self) {
        tracing::debug!(worker = self.index, "streamer started");
        let mut working: HashMap<ConnectionId, Arc<Subscriber>, RandomState> =
            HashMap::with_hasher(RandomState::new());

        while !self.stop.load(Ordering::Acquire) {
            let mask = self.mask.swap(0, Ordering::AcqRel);
            if mask == 0 {
                thread::park_timeout(self.idle_interval);
                continue;
            }
            if mask & (ADD | REMOVE) != 0 {
                self.apply_pending(&mut working);
            }
            if mask & AWAKE != 0 {
                let failed: SmallVec<[ConnectionId; 4]> = working
                    .values()
                    .filter_map(|subscriber| match subscriber.tick(true) {
                        Ok(_) => None,
                        Err(err) => {
                            tracing::warn!(
                                worker = self.index,
                                connection = %subscriber.id(),
                                error = %err,
                                "dropping connection from streamer"
                            );
                            Some(subscriber.id())
                        }
                    })
                    .collect();
                for id in failed {
                    if let Some(subscriber) = working.remove(&id) {
                        self.detach(&subscriber);
                    }
                }
            }
        }

        for (_, subscriber) in working.drain() {
            self.detach(&subscriber);
        }
        let queued = std::mem::take(&mut self.pending.lock().added);
        for subscriber in queued.values() {
            self.detach(subscriber);
        }
        tracing::debug!(worker = self.index, "streamer stopped");
    }

    fn apply_pending(&self, working: &mut HashMap<ConnectionId, Arc<Subscriber>, RandomState>) {
        let Pending { added, removed } = std::mem::take(&mut *self.pending.lock());
        for id in removed {
            if let Some(subscriber) = working.remove(&id) {
                self.detach(&subscriber);
            }
        }
        working.extend(added);
    }

    fn detach(&self, subscriber: &Subscriber) {
        subscriber.outbound().release_usage();
        let load = self.load.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.report(load);
    }

    fn report(&self, load: usize) {
        metrics::gauge!("herald_streamer_connections", "worker" => self.index.to_string())
            .set(load as f64);
    }
}

/// Fixed set of streamer threads.
pub(crate) struct StreamerPool {
    workers: Vec<Arc<Worker>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamerPool {
    pub(crate) fn start(count: usize, idle_interval: Duration) -> io::Result<Self> {
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            handles: Mutex::new(Vec::with_capacity(count)),
        };
        for index in 0..count {
            let worker = Arc::new(Worker::new(index, idle_interval));
            let runner = Arc::clone(&worker);
            // On error the already started workers are stopped by `Drop`.
            let handle = thread::Builder::new()
                .name(format!("herald-streamer-{index}"))
                .spawn(move || runner.run())?;
            let _ = worker.thread.set(handle.thread().clone());
            pool.workers.push(worker);
            pool.handles.lock().push(handle);
        }
        tracing::info!(workers = count, "streamers started");
        Ok(pool)
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Hand a connection to the least loaded worker. Returns the worker index.
    pub(crate) fn add_connection(&self, subscriber: &Arc<Subscriber>) -> usize {
        let (index, worker) = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, worker)| worker.load.load(Ordering::Acquire))
            .expect("streamer pool is never empty");
        subscriber.assign_worker(index);
        subscriber.outbound().acquire_usage();
        let load = worker.load.fetch_add(1, Ordering::AcqRel) + 1;
        worker.report(load);
        worker
            .pending
            .lock()
            .added
            .insert(subscriber.id(), Arc::clone(subscriber));
        worker.flag(ADD);
        tracing::debug!(connection = %subscriber.id(), worker = index, "connection assigned");
        index
    }

    pub(crate) fn remove_connection(&self, subscriber: &Subscriber) {
        let Some(worker) = subscriber
            .worker()
            .and_then(|index| self.workers.get(index))
        else {
            return;
        };
        let id = subscriber.id();
        let cancelled = {
            let mut pending = worker.pending.lock();
            let queued = pending
                .added
                .get(&id)
                .is_some_and(|queued| std::ptr::eq(Arc::as_ptr(queued), subscriber));
            if queued {
                pending.added.remove(&id)
            } else {
                // A reconnect under the same id may be queued; removals apply first.
                pending.removed.insert(id);
                None
            }
        };
        match cancelled {
            // Never reached the working set.
            Some(queued) => worker.detach(&queued),
            None => worker.flag(REMOVE),
        }
    }

    pub(crate) fn signal_all(&self) {
        for worker in &self.workers {
            worker.flag(AWAKE);
        }
    }

    pub(crate) fn signal(&self, index: usize) {
        if let Some(worker) = self.workers.get(index) {
            worker.flag(AWAKE);
        }
    }

    pub(crate) fn load(&self, index: usize) -> usize {
        self.workers
            .get(index)
            .map_or(0, |worker| worker.load.load(Ordering::Acquire))
    }

    /// Stop every worker and wait for it to exit. Idempotent.
    pub(crate) fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        for worker in &self.workers {
            worker.stop.store(true, Ordering::Release);
            if let Some(thread) = worker.thread.get() {
                thread.unpark();
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("streamer thread panicked");
            }
        }
        tracing::info!(workers = self.workers.len(), "streamers stopped");
    }
}

impl Drop for StreamerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
