//! Scheduler services consumed by the pooled-volume core.
//!
//! The core needs exactly three things from its host: a periodic callback on
//! a given core, a one-shot message to a given core, and a fan-out across
//! every core with a completion callback. [`Scheduler`] captures that
//! contract; [`CoreExecutor`] is the in-process implementation (one message
//! loop thread per core), and [`InlineScheduler`] is a deterministic
//! single-call-stack implementation for tests and simulation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::device::CoreId;

/// What a periodic poller accomplished this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Nothing to do.
    Idle,
    /// Work was found (and possibly remains).
    Busy,
}

/// A periodic callback, run on its registered core until unregistered.
pub type PollerFn = Box<dyn FnMut() -> PollResult + Send>;

/// A one-shot message, run once on its target core.
pub type Message = Box<dyn FnOnce() + Send>;

/// Handle identifying a registered poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerHandle {
    core: CoreId,
    id: u64,
}

/// Per-core scheduling services.
pub trait Scheduler: Send + Sync {
    /// Number of worker cores. Cores are numbered `0..num_cores()`.
    fn num_cores(&self) -> usize;

    /// Register a periodic callback on the given core.
    fn register_periodic(&self, core: CoreId, poller: PollerFn) -> PollerHandle;

    /// Unregister a periodic callback.
    fn unregister_periodic(&self, handle: PollerHandle);

    /// Send a one-shot message to the given core's run loop.
    fn send_to_core(&self, core: CoreId, message: Message);

    /// Run `f` once on every core; invoke `done` after the last core has
    /// finished. Implemented as an explicit fan-out with a countdown: one
    /// message per core, and the core that brings the count to zero fires
    /// the completion.
    fn run_on_every_core(&self, f: Arc<dyn Fn(CoreId) + Send + Sync>, done: Message) {
        let remaining = Arc::new(AtomicUsize::new(self.num_cores()));
        let done = Arc::new(Mutex::new(Some(done)));
        for core in 0..self.num_cores() {
            let f = Arc::clone(&f);
            let remaining = Arc::clone(&remaining);
            let done = Arc::clone(&done);
            self.send_to_core(
                core,
                Box::new(move || {
                    f(core);
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(cb) = done.lock().take() {
                            cb();
                        }
                    }
                }),
            );
        }
    }
}

enum Ctl {
    Run(Message),
    AddPoller(u64, PollerFn),
    RemovePoller(u64),
    Shutdown,
}

/// Thread-per-core message loop.
///
/// Each core owns a receiver; messages run in arrival order, and registered
/// pollers run once per loop iteration. When a poller reports
/// [`PollResult::Busy`] the loop skips the idle wait for the next iteration.
pub struct CoreExecutor {
    senders: Vec<Sender<Ctl>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_poller_id: AtomicU64,
}

impl CoreExecutor {
    /// Spawn `num_cores` worker threads with the given idle poll interval.
    pub fn new(num_cores: usize, poll_interval: Duration) -> Self {
        assert!(num_cores > 0);
        let mut senders = Vec::with_capacity(num_cores);
        let mut handles = Vec::with_capacity(num_cores);
        for core in 0..num_cores {
            let (tx, rx) = unbounded::<Ctl>();
            senders.push(tx);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("pvol-core-{}", core))
                    .spawn(move || core_loop(core, rx, poll_interval))
                    .expect("failed to spawn core thread"),
            );
        }
        Self {
            senders,
            handles: Mutex::new(handles),
            next_poller_id: AtomicU64::new(1),
        }
    }

    /// Stop all core threads and wait for them to exit.
    pub fn shutdown(&self) {
        for tx in &self.senders {
            let _ = tx.send(Ctl::Shutdown);
        }
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Run `f` on the given core and block the calling thread until it
    /// completes. Convenience for control-plane code living off-core.
    pub fn call_on_core<T, F>(&self, core: CoreId, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.send_to_core(
            core,
            Box::new(move || {
                let _ = tx.send(f());
            }),
        );
        rx.recv().expect("core loop gone")
    }
}

fn core_loop(core: CoreId, rx: Receiver<Ctl>, poll_interval: Duration) {
    let mut pollers: Vec<(u64, PollerFn)> = Vec::new();
    let mut busy = false;
    debug!(core, "core loop started");
    loop {
        let timeout = if busy { Duration::ZERO } else { poll_interval };
        match rx.recv_timeout(timeout) {
            Ok(Ctl::Run(message)) => message(),
            Ok(Ctl::AddPoller(id, poller)) => pollers.push((id, poller)),
            Ok(Ctl::RemovePoller(id)) => pollers.retain(|(pid, _)| *pid != id),
            Ok(Ctl::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // Drain whatever else is already queued before polling.
        loop {
            match rx.try_recv() {
                Ok(Ctl::Run(message)) => message(),
                Ok(Ctl::AddPoller(id, poller)) => pollers.push((id, poller)),
                Ok(Ctl::RemovePoller(id)) => pollers.retain(|(pid, _)| *pid != id),
                Ok(Ctl::Shutdown) => {
                    debug!(core, "core loop stopped");
                    return;
                }
                Err(_) => break,
            }
        }
        busy = false;
        for (_, poller) in pollers.iter_mut() {
            if poller() == PollResult::Busy {
                busy = true;
            }
        }
    }
    debug!(core, "core loop stopped");
}

impl Scheduler for CoreExecutor {
    fn num_cores(&self) -> usize {
        self.senders.len()
    }

    fn register_periodic(&self, core: CoreId, poller: PollerFn) -> PollerHandle {
        let id = self.next_poller_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.senders[core].send(Ctl::AddPoller(id, poller));
        PollerHandle { core, id }
    }

    fn unregister_periodic(&self, handle: PollerHandle) {
        let _ = self.senders[handle.core].send(Ctl::RemovePoller(handle.id));
    }

    fn send_to_core(&self, core: CoreId, message: Message) {
        let _ = self.senders[core].send(Ctl::Run(message));
    }
}

/// Deterministic scheduler: messages run inline on the calling stack, and
/// pollers run only when [`InlineScheduler::poll`] is called.
///
/// "Core affinity" is nominal here; the point is a fully deterministic
/// execution order for tests and single-threaded embeddings.
pub struct InlineScheduler {
    num_cores: usize,
    pollers: Mutex<Vec<Vec<(u64, PollerFn)>>>,
    next_poller_id: AtomicU64,
}

impl InlineScheduler {
    pub fn new(num_cores: usize) -> Self {
        assert!(num_cores > 0);
        Self {
            num_cores,
            pollers: Mutex::new((0..num_cores).map(|_| Vec::new()).collect()),
            next_poller_id: AtomicU64::new(1),
        }
    }

    /// Run every poller registered on `core` once.
    pub fn poll(&self, core: CoreId) -> PollResult {
        let mut pollers = self.pollers.lock();
        let mut busy = false;
        for (_, poller) in pollers[core].iter_mut() {
            if poller() == PollResult::Busy {
                busy = true;
            }
        }
        if busy {
            PollResult::Busy
        } else {
            PollResult::Idle
        }
    }

    /// Number of pollers currently registered on `core`.
    pub fn num_pollers(&self, core: CoreId) -> usize {
        self.pollers.lock()[core].len()
    }
}

impl Scheduler for InlineScheduler {
    fn num_cores(&self) -> usize {
        self.num_cores
    }

    fn register_periodic(&self, core: CoreId, poller: PollerFn) -> PollerHandle {
        let id = self.next_poller_id.fetch_add(1, Ordering::Relaxed);
        self.pollers.lock()[core].push((id, poller));
        PollerHandle { core, id }
    }

    fn unregister_periodic(&self, handle: PollerHandle) {
        self.pollers.lock()[handle.core].retain(|(id, _)| *id != handle.id);
    }

    fn send_to_core(&self, _core: CoreId, message: Message) {
        message();
    }
}
