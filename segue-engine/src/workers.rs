//! Background worker threads.
//!
//! A [`WorkerThread`] owns one OS thread and a registry of time-slice
//! clients. Each pass it services every live client and then parks until the
//! earliest requested wake-up, or until [`WorkerThread::wake`] is called.
//! The engine runs three of these: track loading (which also hosts the
//! scanner), read-ahead ring filling, and the low-rate level/update tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace};

/// A unit of background work serviced round-robin on a worker thread.
pub(crate) trait TimeSliceClient: Send + Sync {
    /// Perform one slice of work and report how long until this client
    /// wants service again. `Duration::ZERO` requests an immediate re-run.
    fn run_slice(&self) -> Duration;

    /// Dead clients are pruned from the registry after the next pass.
    fn is_alive(&self) -> bool {
        true
    }
}

struct WorkerShared {
    name: String,
    clients: Mutex<Vec<Arc<dyn TimeSliceClient>>>,
    gate: Mutex<bool>,
    wakeup: Condvar,
    running: AtomicBool,
}

/// A named background thread servicing registered time-slice clients.
pub(crate) struct WorkerThread {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn spawn(name: &str) -> Self {
        let shared = Arc::new(WorkerShared {
            name: name.to_string(),
            clients: Mutex::new(Vec::new()),
            gate: Mutex::new(false),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(thread_shared))
            .expect("failed to spawn worker thread");

        debug!(worker = name, "worker thread started");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn register(&self, client: Arc<dyn TimeSliceClient>) {
        self.shared.clients.lock().unwrap().push(client);
        self.wake();
    }

    /// Interrupt the current park so new work is picked up promptly.
    pub fn wake(&self) {
        let mut pending = self.shared.gate.lock().unwrap();
        *pending = true;
        self.shared.wakeup.notify_all();
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.wake();
        if let Some(handle) = self.handle.take() {
            // A client can end up owning the last reference to the engine,
            // putting this drop on the worker's own thread; detach instead
            // of self-joining.
            if handle.thread().id() == std::thread::current().id() {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
        debug!(worker = %self.shared.name, "worker thread stopped");
    }
}

fn worker_loop(shared: Arc<WorkerShared>) {
    const IDLE_WAIT: Duration = Duration::from_millis(50);

    while shared.running.load(Ordering::SeqCst) {
        // Snapshot (and prune) the registry so run_slice executes without
        // holding the registry lock.
        let snapshot: Vec<Arc<dyn TimeSliceClient>> = {
            let mut clients = shared.clients.lock().unwrap();
            clients.retain(|c| c.is_alive());
            clients.clone()
        };

        let mut next = IDLE_WAIT;
        for client in &snapshot {
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
            if !client.is_alive() {
                continue;
            }
            let delay = client.run_slice();
            next = next.min(delay);
        }

        trace!(worker = %shared.name, clients = snapshot.len(), ?next, "worker pass");

        if next > Duration::ZERO {
            let mut pending = shared.gate.lock().unwrap();
            if !*pending {
                let (guard, _timeout) = shared
                    .wakeup
                    .wait_timeout(pending, next)
                    .unwrap();
                pending = guard;
            }
            *pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct CountingClient {
        runs: AtomicUsize,
        alive: AtomicBool,
    }

    impl TimeSliceClient for CountingClient {
        fn run_slice(&self) -> Duration {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Duration::from_millis(1)
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        check()
    }

    #[test]
    fn clients_are_serviced() {
        let worker = WorkerThread::spawn("test-worker");
        let client = Arc::new(CountingClient {
            runs: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        });
        worker.register(Arc::clone(&client) as Arc<dyn TimeSliceClient>);

        assert!(wait_until(1_000, || client.runs.load(Ordering::SeqCst) >= 3));
    }

    #[test]
    fn dead_clients_stop_running() {
        let worker = WorkerThread::spawn("test-worker-prune");
        let client = Arc::new(CountingClient {
            runs: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        });
        worker.register(Arc::clone(&client) as Arc<dyn TimeSliceClient>);
        assert!(wait_until(1_000, || client.runs.load(Ordering::SeqCst) >= 1));

        client.alive.store(false, Ordering::SeqCst);
        worker.wake();
        std::thread::sleep(Duration::from_millis(20));
        let frozen = client.runs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(client.runs.load(Ordering::SeqCst), frozen);
    }

    #[test]
    fn drop_joins_thread() {
        let worker = WorkerThread::spawn("test-worker-drop");
        drop(worker); // must not hang
    }
}
