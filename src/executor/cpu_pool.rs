use super::task::Task;
use super::worker::{self, Worker};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::telemetry::Metrics;
use crossbeam_deque::{Injector, Stealer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};

static POOL_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

#[cfg(target_os = "linux")]
fn pin_thread_to_core(core_id: usize) {
    // SAFETY: `cpuset` is a plain bitmask initialised by `CPU_SET`, and
    // `sched_setaffinity(0, ..)` only affects the calling thread.
    let result = unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset)
    };
    if result != 0 {
        tracing::warn!(
            thread = std::thread::current().name().unwrap_or("unknown"),
            core = core_id,
            "failed to pin worker to core"
        );
    }
}

/// Queues and wakeup handles shared by the pool's workers and by every task
/// that schedules more work.
pub(crate) struct PoolInner {
    id: usize,
    pub(crate) injector: Injector<Task>,
    pub(crate) stealers: Vec<Stealer<Task>>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) metrics: Arc<Metrics>,
    threads: OnceLock<Vec<Thread>>,
    next_wake: AtomicUsize,
}

impl PoolInner {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue `task`. From one of this pool's workers it goes to that
    /// worker's local queue, from anywhere else to the global injector.
    pub fn submit(&self, task: Task) {
        if let Err(task) = worker::push_local(self.id, task) {
            self.injector.push(task);
        }
        self.wake_one();
    }

    fn wake_one(&self) {
        if let Some(threads) = self.threads.get() {
            if !threads.is_empty() {
                let i = self.next_wake.fetch_add(1, Ordering::Relaxed) % threads.len();
                threads[i].unpark();
            }
        }
    }

    fn wake_all(&self) {
        if let Some(threads) = self.threads.get() {
            for t in threads {
                t.unpark();
            }
        }
    }
}

pub struct CpuPool {
    inner: Arc<PoolInner>,
    handles: Vec<JoinHandle<()>>,
    num_threads: usize,
}

impl CpuPool {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let num_threads = config.worker_threads();
        if num_threads == 0 {
            return Err(Error::config("need at least 1 thread"));
        }

        let workers: Vec<Worker> = (0..num_threads).map(Worker::new).collect();
        let stealers = workers.iter().map(Worker::stealer).collect();

        let inner = Arc::new(PoolInner {
            id: POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            metrics,
            threads: OnceLock::new(),
            next_wake: AtomicUsize::new(0),
        });

        let mut pool = Self {
            inner: inner.clone(),
            handles: Vec::with_capacity(num_threads),
            num_threads,
        };
        let cores = num_cpus::get().max(1);

        for worker in workers {
            let id = worker.id;
            let name = format!("{}-{}", config.thread_name_prefix, id);
            let mut builder = thread::Builder::new().name(name);

            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let pin_workers = config.pin_workers;
            let pool_ref = inner.clone();
            let handle = builder
                .spawn(move || {
                    #[cfg(target_os = "linux")]
                    if pin_workers {
                        pin_thread_to_core(id % cores);
                    }
                    #[cfg(not(target_os = "linux"))]
                    let _ = (pin_workers, cores);

                    worker.run(pool_ref);
                })
                .map_err(|e| Error::executor(format!("spawn failed: {}", e)));

            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    // dropping `pool` joins the workers spawned so far
                    return Err(e);
                }
            }
        }

        let threads = pool.handles.iter().map(|h| h.thread().clone()).collect();
        let _ = inner.threads.set(threads);

        Ok(pool)
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit(Task::new(f));
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn shutdown(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);

        // wake everyone up to check shutdown flag; workers that have not
        // published their handles yet still poll it
        self.inner.wake_all();
        for handle in &self.handles {
            handle.thread().unpark();
        }

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CpuPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuPool")
            .field("id", &self.inner.id)
            .field("num_threads", &self.num_threads)
            .finish()
    }
}
