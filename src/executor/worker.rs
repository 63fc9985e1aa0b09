// worker thread loop
use super::cpu_pool::PoolInner;
use super::task::Task;
use crossbeam_deque::{Steal, Stealer, Worker as WorkerQueue};
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub type WorkerId = usize;

struct LocalQueue {
    pool: usize,
    queue: WorkerQueue<Task>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

/// Push onto the calling thread's own queue when it is a worker of `pool`.
/// Hands the task back otherwise.
pub(crate) fn push_local(pool: usize, task: Task) -> Result<(), Task> {
    LOCAL.with(|slot| match &*slot.borrow() {
        Some(local) if local.pool == pool => {
            local.queue.push(task);
            Ok(())
        }
        _ => Err(task),
    })
}

pub(crate) struct Worker {
    pub id: WorkerId,
    queue: WorkerQueue<Task>,
}

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            queue: WorkerQueue::new_fifo(),
        }
    }

    pub fn stealer(&self) -> Stealer<Task> {
        self.queue.stealer()
    }

    // main loop
    pub fn run(self, pool: Arc<PoolInner>) {
        let id = self.id;
        LOCAL.with(|slot| {
            *slot.borrow_mut() = Some(LocalQueue {
                pool: pool.id(),
                queue: self.queue,
            })
        });
        tracing::trace!(worker = id, "worker started");

        let mut backoff_cnt = 0;
        loop {
            if pool.shutdown.load(Ordering::Acquire) {
                break;
            }

            // local -> global -> steal
            if let Some(task) = find_task(id, &pool) {
                backoff_cnt = 0;
                task.execute();
            } else {
                backoff(&mut backoff_cnt);
            }
        }

        LOCAL.with(|slot| slot.borrow_mut().take());
        tracing::trace!(worker = id, "worker stopped");
    }
}

fn find_task(id: WorkerId, pool: &PoolInner) -> Option<Task> {
    LOCAL.with(|slot| {
        let slot = slot.borrow();
        let local = &slot.as_ref()?.queue;

        if let Some(task) = local.pop() {
            return Some(task);
        }

        loop {
            match pool.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        let task = try_steal_from_workers(id, local, &pool.stealers)?;
        pool.metrics.record_task_stolen();
        Some(task)
    })
}

fn try_steal_from_workers(
    id: WorkerId,
    local: &WorkerQueue<Task>,
    stealers: &[Stealer<Task>],
) -> Option<Task> {
    use rand::seq::SliceRandom;
    use rand::thread_rng;

    if stealers.len() <= 1 {
        return None;
    }

    let mut indices: Vec<usize> = (0..stealers.len()).collect();
    indices.shuffle(&mut thread_rng());

    for &idx in &indices {
        if idx == id {
            continue;
        }

        loop {
            match stealers[idx].steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    None
}

fn backoff(count: &mut u32) {
    const MAX_SPINS: u32 = 10;
    const MAX_YIELDS: u32 = 20;

    *count += 1;

    if *count <= MAX_SPINS {
        let spins = (*count).min(6);
        for _ in 0..(1 << spins) {
            std::hint::spin_loop();
        }
    } else if *count <= MAX_YIELDS {
        thread::yield_now();
    } else {
        thread::park_timeout(Duration::from_micros(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_local_outside_worker_returns_task() {
        let task = Task::new(|| {});
        let id = task.id;
        let back = push_local(0, task).unwrap_err();
        assert_eq!(back.id, id);
    }

    #[test]
    fn test_push_local_matches_pool() {
        LOCAL.with(|slot| {
            *slot.borrow_mut() = Some(LocalQueue {
                pool: 7,
                queue: WorkerQueue::new_fifo(),
            })
        });

        assert!(push_local(8, Task::new(|| {})).is_err());
        assert!(push_local(7, Task::new(|| {})).is_ok());

        let queued = LOCAL.with(|slot| slot.borrow().as_ref().map(|l| l.queue.len()));
        assert_eq!(queued, Some(1));
        LOCAL.with(|slot| slot.borrow_mut().take());
    }
}
