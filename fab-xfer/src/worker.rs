//! Bounded worker pool multiplexing sessions onto OS threads.
//!
//! Each worker owns two independent halves (a mutex over 32 session slots
//! plus that half's poll-set), so a non-worker thread can assign into one
//! half while the worker drains the other. Workers sleep on a per-worker
//! condvar while their index is at or beyond the running count, and idle
//! down in LIFO order: only the highest-indexed running worker may stop, so
//! the running set is always a prefix of the allocated set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::XferError;
use crate::fabric::{Fabric, PollSet};
use crate::session::{LoopStatus, Session};

pub const MAX_WORKERS: usize = 128;
pub const SESSIONS_PER_HALF: usize = 32;
pub const HALVES: usize = 2;

/// Q8.8 exponentially-weighted average of contexts serviced per tick.
///
/// Folded only when the tick counter saturates, so the figure is cheap to
/// maintain in the inner loop. Exposed as a scheduling hint; the current
/// assignment policy does not consult it.
#[derive(Debug, Default)]
pub struct LoadAverage {
    average: u16,
    ctxs_serviced: u32,
    loops_since_mark: u16,
}

impl LoadAverage {
    pub fn note(&mut self, serviced: usize) {
        self.ctxs_serviced = self.ctxs_serviced.saturating_add(serviced as u32);
        if self.loops_since_mark == u16::MAX {
            let scaled = 256u64 * self.ctxs_serviced as u64 / (u16::MAX as u64 + 1);
            let folded = (self.average as u64 + scaled) / 2;
            self.average = folded.min(u16::MAX as u64) as u16;
            self.ctxs_serviced = 0;
            self.loops_since_mark = 0;
        } else {
            self.loops_since_mark += 1;
        }
    }

    /// Current average in Q8.8 fixed point.
    pub fn value(&self) -> u16 {
        self.average
    }
}

struct HalfState<F: Fabric> {
    slots: Vec<Option<Session<F>>>,
    poll_set: F::Ps,
}

struct Half<F: Fabric> {
    state: Mutex<HalfState<F>>,
    /// Written under the half mutex, read without for quick looks.
    nsessions: AtomicUsize,
}

impl<F: Fabric> Half<F> {
    fn new(fabric: &F) -> Result<Self, XferError> {
        let mut slots = Vec::with_capacity(SESSIONS_PER_HALF);
        slots.resize_with(SESSIONS_PER_HALF, || None);
        Ok(Self {
            state: Mutex::new(HalfState {
                slots,
                poll_set: fabric.poll_set()?,
            }),
            nsessions: AtomicUsize::new(0),
        })
    }
}

pub struct Worker<F: Fabric> {
    index: usize,
    halves: [Half<F>; HALVES],
    cond: Condvar,
    cancelled: AtomicBool,
    failed: AtomicBool,
    load: Mutex<LoadAverage>,
}

impl<F: Fabric> Worker<F> {
    fn new(index: usize, fabric: &F) -> Result<Self, XferError> {
        Ok(Self {
            index,
            halves: [Half::new(fabric)?, Half::new(fabric)?],
            cond: Condvar::new(),
            cancelled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            load: Mutex::new(LoadAverage::default()),
        })
    }

    fn nsessions(&self) -> usize {
        self.halves
            .iter()
            .map(|h| h.nsessions.load(Ordering::Relaxed))
            .sum()
    }

    pub fn load_average(&self) -> u16 {
        self.load.lock().value()
    }

    /// One inner-loop tick: for each half whose mutex is free, poll its
    /// poll-set and step every occupied slot, removing finished sessions.
    fn service(&self, token: &CancelToken) -> usize {
        let mut serviced = 0;
        for half in &self.halves {
            let Some(mut guard) = half.state.try_lock() else {
                continue;
            };
            let HalfState { slots, poll_set } = &mut *guard;
            // The readiness count is informational only.
            let _ready = poll_set.poll();
            for slot in slots.iter_mut() {
                let Some(session) = slot.as_mut() else {
                    continue;
                };
                serviced += 1;
                match session.poll(token) {
                    LoopStatus::Continue => {}
                    status @ (LoopStatus::End | LoopStatus::Error) => {
                        let session = slot.take().expect("occupied slot");
                        if let Err(e) = poll_set.del(session.cq()) {
                            warn!("poll-set removal failed: {e}");
                        }
                        half.nsessions.fetch_sub(1, Ordering::Relaxed);
                        if status == LoopStatus::Error {
                            self.failed.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        serviced
    }

    /// Place a session in the first half with a free slot. Called under the
    /// pool mutex.
    fn try_place(&self, session: Session<F>) -> Result<(), Session<F>> {
        for half in &self.halves {
            let mut guard = half.state.lock();
            let HalfState { slots, poll_set } = &mut *guard;
            let Some(free) = slots.iter_mut().find(|s| s.is_none()) else {
                continue;
            };
            if let Err(e) = poll_set.add(session.cq()) {
                warn!("poll-set insertion failed: {e}");
                return Err(session);
            }
            *free = Some(session);
            half.nsessions.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Err(session)
    }
}

struct PoolState<F: Fabric> {
    workers: Vec<Arc<Worker<F>>>,
    handles: Vec<JoinHandle<()>>,
    nworkers_running: usize,
    assignment_suspended: bool,
}

struct PoolShared<F: Fabric> {
    state: Mutex<PoolState<F>>,
    /// Signaled whenever a worker idles down; join-all waits here.
    joiner: Condvar,
}

/// The process's session scheduler.
pub struct WorkerPool<F: Fabric> {
    fabric: Arc<F>,
    shared: Arc<PoolShared<F>>,
    token: CancelToken,
}

impl<F: Fabric> WorkerPool<F> {
    pub fn new(fabric: Arc<F>, token: CancelToken) -> Self {
        Self {
            fabric,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    handles: Vec::new(),
                    nworkers_running: 0,
                    assignment_suspended: false,
                }),
                joiner: Condvar::new(),
            }),
            token,
        }
    }

    pub fn running(&self) -> usize {
        self.shared.state.lock().nworkers_running
    }

    pub fn allocated(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    /// Live session count of every allocated worker, in spawn order.
    pub fn sessions_per_worker(&self) -> Vec<usize> {
        self.shared
            .state
            .lock()
            .workers
            .iter()
            .map(|w| w.nsessions())
            .collect()
    }

    /// Hand a session to a worker: running workers newest-first (later
    /// workers are assumed least loaded), then the first idle worker, then a
    /// freshly spawned one.
    pub fn assign(&self, session: Session<F>) -> Result<(), XferError> {
        let mut st = self.shared.state.lock();
        if st.assignment_suspended {
            return Err(XferError::PoolSuspended);
        }
        let mut session = session;
        for i in (0..st.nworkers_running).rev() {
            match st.workers[i].try_place(session) {
                Ok(()) => return Ok(()),
                Err(back) => session = back,
            }
        }
        if st.nworkers_running < st.workers.len() {
            let worker = st.workers[st.nworkers_running].clone();
            match worker.try_place(session) {
                Ok(()) => {
                    st.nworkers_running += 1;
                    worker.cond.notify_one();
                    return Ok(());
                }
                Err(back) => session = back,
            }
        }
        if st.workers.len() < MAX_WORKERS {
            let index = st.workers.len();
            let worker = Arc::new(Worker::new(index, &*self.fabric)?);
            worker
                .try_place(session)
                .map_err(|_| XferError::Overflow("fresh worker refused a session"))?;
            let handle = self.spawn(index, worker.clone());
            st.handles.push(handle);
            st.workers.push(worker.clone());
            st.nworkers_running = index + 1;
            worker.cond.notify_one();
            return Ok(());
        }
        Err(XferError::PoolFull)
    }

    fn spawn(&self, index: usize, worker: Arc<Worker<F>>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let token = self.token.clone();
        thread::Builder::new()
            .name(format!("xfer-worker-{index}"))
            .spawn(move || worker_main(worker, shared, token))
            .expect("worker thread spawn")
    }

    /// Stop taking sessions (tests use this to exercise the refusal path).
    pub fn suspend_assignment(&self) {
        self.shared.state.lock().assignment_suspended = true;
    }

    /// Suspend assignment, wait for every worker to drain and idle down,
    /// then cancel, wake and join all threads. Fails if any worker failed.
    pub fn join_all(&self) -> Result<(), XferError> {
        let (workers, handles) = {
            let mut st = self.shared.state.lock();
            st.assignment_suspended = true;
            while st.nworkers_running > 0 {
                self.shared.joiner.wait(&mut st);
            }
            for worker in &st.workers {
                worker.cancelled.store(true, Ordering::SeqCst);
                worker.cond.notify_one();
            }
            (st.workers.clone(), std::mem::take(&mut st.handles))
        };
        for handle in handles {
            let _ = handle.join();
        }
        if workers.iter().any(|w| w.failed.load(Ordering::Relaxed)) {
            Err(XferError::WorkerFailed)
        } else {
            Ok(())
        }
    }
}

fn worker_main<F: Fabric>(worker: Arc<Worker<F>>, shared: Arc<PoolShared<F>>, token: CancelToken) {
    debug!(index = worker.index, "worker up");
    loop {
        {
            let mut st = shared.state.lock();
            while worker.index >= st.nworkers_running && !worker.cancelled.load(Ordering::Relaxed) {
                worker.cond.wait(&mut st);
            }
        }
        if worker.cancelled.load(Ordering::Relaxed) {
            debug!(index = worker.index, "worker down");
            return;
        }
        loop {
            let serviced = worker.service(&token);
            worker.load.lock().note(serviced);
            if worker.nsessions() == 0 {
                let mut st = shared.state.lock();
                // Re-check under the pool mutex: an assignment may have
                // landed between the quick look and here.
                if worker.nsessions() == 0 && worker.index + 1 == st.nworkers_running {
                    st.nworkers_running -= 1;
                    shared.joiner.notify_all();
                    break;
                }
            }
            if serviced == 0 {
                thread::yield_now();
            }
        }
    }
}
