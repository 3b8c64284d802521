use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to start pool thread {index}: {source}")]
    Spawn {
        index: usize,
        source: std::io::Error,
    },
}

const SLOT_IDLE: u32 = 0;
const SLOT_READY: u32 = 1;

/// Spins before falling back to yield while a slot is polled.
const SPIN_LIMIT: u32 = 4096;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Slot {
    state: AtomicU32,
    job: UnsafeCell<Option<Job>>,
}

// SAFETY: the job cell is written only while state == SLOT_IDLE (owner: the
// pusher) and read only after observing SLOT_READY (owner: the worker
// thread); the release/acquire pair on `state` orders the hand-off.
unsafe impl Sync for Slot {}

struct Shared {
    slots: Vec<Slot>,
    running: AtomicBool,
}

/// Fixed-size pool of alive threads. Each thread owns one job slot and spins
/// on it; dispatch and completion are strictly FIFO per thread and threads
/// never steal.
pub struct AliveThreadPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl AliveThreadPool {
    pub fn new(threads: usize) -> Result<Self, PoolError> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            slots: (0..threads)
                .map(|_| Slot {
                    state: AtomicU32::new(SLOT_IDLE),
                    job: UnsafeCell::new(None),
                })
                .collect(),
            running: AtomicBool::new(true),
        });

        let mut handles = Vec::with_capacity(threads);
        for tid in 0..threads {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("compute-{}", tid))
                .spawn(move || worker_loop(shared, tid))
                .map_err(|source| PoolError::Spawn { index: tid, source })?;
            handles.push(handle);
        }

        Ok(Self { shared, handles })
    }

    /// Pool with one thread per logical CPU.
    pub fn with_default_threads() -> Result<Self, PoolError> {
        Self::new(num_cpus::get())
    }

    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    fn push_job(&self, tid: usize, job: Job) {
        let slot = &self.shared.slots[tid];
        let mut spins = 0u32;
        while slot.state.load(Ordering::Acquire) != SLOT_IDLE {
            spins += 1;
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        // SAFETY: the slot is idle, so the worker is not reading the cell.
        unsafe {
            *slot.job.get() = Some(job);
        }
        slot.state.store(SLOT_READY, Ordering::Release);
    }

    /// Block until thread `tid` has drained its slot.
    pub fn wait(&self, tid: usize) {
        let slot = &self.shared.slots[tid];
        let mut spins = 0u32;
        while slot.state.load(Ordering::Acquire) != SLOT_IDLE {
            spins += 1;
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn wait_all(&self) {
        for tid in 0..self.size() {
            self.wait(tid);
        }
    }

    /// Run borrowed jobs on the pool. Every job pushed inside the closure is
    /// complete before `scope` returns, so jobs may borrow from the caller.
    pub fn scope<'env, F, R>(&self, f: F) -> R
    where
        F: FnOnce(&PoolScope<'_, 'env>) -> R,
    {
        let scope = PoolScope {
            pool: self,
            _env: PhantomData,
        };
        let _guard = WaitGuard { pool: self };
        f(&scope)
    }
}

impl Drop for AliveThreadPool {
    fn drop(&mut self) {
        self.wait_all();
        self.shared.running.store(false, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Waits for every slot on drop, including during unwinding, so borrowed
/// jobs cannot outlive their scope.
struct WaitGuard<'a> {
    pool: &'a AliveThreadPool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.pool.wait_all();
    }
}

/// Handle for pushing borrowed jobs inside [`AliveThreadPool::scope`].
pub struct PoolScope<'pool, 'env> {
    pool: &'pool AliveThreadPool,
    _env: PhantomData<&'env mut &'env ()>,
}

impl<'pool, 'env> PoolScope<'pool, 'env> {
    pub fn push<F>(&self, tid: usize, f: F)
    where
        F: FnOnce() + Send + 'env,
    {
        let job: Box<dyn FnOnce() + Send + 'env> = Box::new(f);
        // SAFETY: the scope (and its panic guard) waits for every slot
        // before 'env ends, so erasing the lifetime cannot let the job
        // observe freed borrows.
        let job: Job = unsafe { std::mem::transmute(job) };
        self.pool.push_job(tid, job);
    }

    pub fn wait(&self, tid: usize) {
        self.pool.wait(tid);
    }

    pub fn size(&self) -> usize {
        self.pool.size()
    }
}

fn worker_loop(shared: Arc<Shared>, tid: usize) {
    let slot = &shared.slots[tid];
    let mut spins = 0u32;
    loop {
        if slot.state.load(Ordering::Acquire) == SLOT_READY {
            // SAFETY: SLOT_READY hands the cell to this thread.
            let job = unsafe { (*slot.job.get()).take() };
            if let Some(job) = job {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    log::error!("pool thread {} job panicked", tid);
                }
            }
            slot.state.store(SLOT_IDLE, Ordering::Release);
            spins = 0;
        } else {
            if !shared.running.load(Ordering::Relaxed) {
                break;
            }
            spins += 1;
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}
