// This file is part of Kiln.
//
// Kiln is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Kiln is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Kiln.  If not, see <http://www.gnu.org/licenses/>.

//! Fixed-pool task system.
//!
//! A small set of OS threads (worker 0 is the calling thread) cooperate
//! through one bounded MPMC queue. Producers post work; consumers gate on a
//! counting semaphore so an idle pool sleeps. Fork/join batches are
//! [Bundle]s, fire-and-forget batches are [Stream]s. Tasks cannot be
//! cancelled; shutdown drains the queue through per-worker exit messages.

mod fifo;

pub use crate::fifo::{BoundedQueue, Semaphore};

use anyhow::Result;
use arena::Arena;
use log::{debug, trace};
use std::{
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

pub const TASK_QUEUE_LEN: usize = 1024;
pub const WORKER_FRAME_BYTES: usize = 1024 * 1024;

type TaskFn = Box<dyn FnOnce(&mut WorkerContext) + Send + 'static>;

pub type WorkerInit = Option<Arc<dyn Fn(u32) + Send + Sync>>;

enum TaskMsg {
    Run(Task),
    Exit,
}

struct Task {
    func: TaskFn,
    batch: Batch,
}

#[derive(Clone)]
enum Batch {
    None,
    Bundle(Arc<BundleState>),
    Stream(Arc<StreamState>),
}

struct BundleState {
    tasks_left: AtomicU32,
    completed: Semaphore,
}

struct StreamState {
    completed: AtomicU32,
}

struct Shared {
    queue: BoundedQueue<TaskMsg>,
    available: Semaphore,
    frame_clear: Vec<AtomicBool>,
}

/// Per-worker state handed to every task body. Worker 0's context is owned
/// by the thread that created the [TaskContext].
pub struct WorkerContext {
    worker_id: u32,
    pub mem_frame: Arena,
    pub rng: fastrand::Rng,
    shared: Arc<Shared>,
}

impl WorkerContext {
    fn new(worker_id: u32, shared: Arc<Shared>) -> Result<Self> {
        Ok(Self {
            worker_id,
            mem_frame: Arena::with_capacity(WORKER_FRAME_BYTES)?,
            rng: fastrand::Rng::with_seed(rng_seed(worker_id)),
            shared,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    fn maybe_clear_frame(&mut self) {
        let flag = &self.shared.frame_clear[self.worker_id as usize];
        if flag.swap(false, Ordering::AcqRel) {
            self.mem_frame.flush();
        }
    }
}

// Weyl-sequence jump so worker streams never overlap.
fn rng_seed(worker_id: u32) -> u64 {
    0x9e37_79b9_7f4a_7c15u64.wrapping_mul(worker_id as u64 + 1)
}

fn run_task(task: Task, w: &mut WorkerContext) {
    w.maybe_clear_frame();
    (task.func)(w);
    match task.batch {
        Batch::None => {}
        Batch::Bundle(bundle) => {
            // The last finisher hands the semaphore to the waiting owner;
            // every write made by member tasks is released by this sub.
            if bundle.tasks_left.fetch_sub(1, Ordering::SeqCst) == 1 {
                bundle.completed.post();
            }
        }
        Batch::Stream(stream) => {
            stream.completed.fetch_add(1, Ordering::Release);
        }
    }
}

pub struct TaskContext {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    worker_count: u32,
}

impl TaskContext {
    /// Spin up `worker_count - 1` threads (worker 0 is the caller) and
    /// return the context plus the caller's own worker state. `worker_init`
    /// runs once on every spawned worker thread before it accepts work.
    pub fn new(worker_count: u32, worker_init: WorkerInit) -> Result<(Self, WorkerContext)> {
        assert!(worker_count >= 1);
        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(TASK_QUEUE_LEN),
            available: Semaphore::new(0),
            frame_clear: (0..worker_count).map(|_| AtomicBool::new(false)).collect(),
        });

        let mut workers = Vec::new();
        for worker_id in 1..worker_count {
            let shared = shared.clone();
            let init = worker_init.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("kiln-worker-{}", worker_id))
                    .spawn(move || {
                        if let Some(init) = init {
                            init(worker_id);
                        }
                        let mut ctx = WorkerContext::new(worker_id, shared.clone())
                            .expect("worker frame arena");
                        trace!("worker {} online", worker_id);
                        worker_main(&mut ctx);
                        trace!("worker {} offline", worker_id);
                    })?,
            );
        }
        debug!("task system online with {} worker(s)", worker_count);

        let main_ctx = WorkerContext::new(0, shared.clone())?;
        Ok((
            Self {
                shared,
                workers,
                worker_count,
            },
            main_ctx,
        ))
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    fn post(&self, msg: TaskMsg) {
        let mut msg = msg;
        loop {
            match self.shared.queue.push(msg) {
                Ok(()) => break,
                Err(back) => {
                    msg = back;
                    std::thread::yield_now();
                }
            }
        }
        self.shared.available.post();
    }

    /// Queue a free-standing task.
    pub fn dispatch(&self, func: impl FnOnce(&mut WorkerContext) + Send + 'static) {
        self.post(TaskMsg::Run(Task {
            func: Box::new(func),
            batch: Batch::None,
        }));
    }

    /// Drain whatever is currently queued on the calling thread (worker 0
    /// steals between frames).
    pub fn run_available(&self, main: &mut WorkerContext) {
        while self.shared.available.try_wait() {
            match self.shared.queue.pop() {
                Some(TaskMsg::Run(task)) => run_task(task, main),
                Some(TaskMsg::Exit) => {
                    // exit messages belong to pool workers
                    self.post(TaskMsg::Exit);
                    break;
                }
                None => break,
            }
        }
    }

    /// Ask every worker to flush its frame arena before its next task.
    pub fn frame_clear(&self) {
        for flag in self.shared.frame_clear.iter() {
            flag.store(true, Ordering::Release);
        }
    }

    /// Fork `inputs` into at most `split_count` contiguous ranges (one
    /// extra element on the first `len % split_count` ranges), run `func`
    /// over each range on the pool, and join. The calling worker helps
    /// drain the queue while waiting, so this completes even on a
    /// single-worker pool.
    pub fn bundle_run_split<T, F>(
        &self,
        main: &mut WorkerContext,
        inputs: &mut [T],
        split_count: u32,
        func: F,
    ) where
        T: Send,
        F: Fn(&mut WorkerContext, &mut [T]) + Sync,
    {
        let per_range = inputs.len() / split_count.max(1) as usize;
        let mut extra = inputs.len() % split_count.max(1) as usize;
        let splits = if per_range > 0 {
            split_count as usize
        } else {
            extra
        };
        if splits == 0 {
            return;
        }

        let bundle = Arc::new(BundleState {
            tasks_left: AtomicU32::new(splits as u32),
            completed: Semaphore::new(0),
        });

        struct RawRange<T> {
            base: *mut T,
            len: usize,
        }
        unsafe impl<T: Send> Send for RawRange<T> {}

        struct FnRef<F>(*const F);
        unsafe impl<F: Sync> Send for FnRef<F> {}

        let mut base = inputs.as_mut_ptr();
        for _ in 0..splits {
            let mut len = per_range;
            if extra > 0 {
                extra -= 1;
                len += 1;
            }
            let range = RawRange { base, len };
            base = unsafe { base.add(len) };
            let func_ref = FnRef(&func as *const F);

            let body = move |w: &mut WorkerContext| {
                let range = range;
                let func_ref = func_ref;
                // The bundle join below outlives every member task, so the
                // borrows behind these pointers are live for the duration.
                unsafe {
                    let slice = std::slice::from_raw_parts_mut(range.base, range.len);
                    (*func_ref.0)(w, slice);
                }
            };
            let boxed: Box<dyn FnOnce(&mut WorkerContext) + Send + '_> = Box::new(body);
            // erase the borrow lifetimes; the join below keeps them live
            // until every member task has finished
            let func: TaskFn = unsafe { mem::transmute(boxed) };
            self.post(TaskMsg::Run(Task {
                func,
                batch: Batch::Bundle(bundle.clone()),
            }));
        }

        // Join: help with queued work until the last finisher posts.
        loop {
            if bundle.completed.try_wait() {
                break;
            }
            if self.shared.available.try_wait() {
                match self.shared.queue.pop() {
                    Some(TaskMsg::Run(task)) => run_task(task, main),
                    Some(TaskMsg::Exit) => self.post(TaskMsg::Exit),
                    None => {}
                }
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn stream(&self) -> Stream {
        Stream {
            state: Arc::new(StreamState {
                completed: AtomicU32::new(0),
            }),
            task_count: 0,
        }
    }

    pub fn stream_dispatch(
        &self,
        stream: &mut Stream,
        func: impl FnOnce(&mut WorkerContext) + Send + 'static,
    ) {
        stream.task_count += 1;
        self.post(TaskMsg::Run(Task {
            func: Box::new(func),
            batch: Batch::Stream(stream.state.clone()),
        }));
    }

    /// Spin until every dispatched stream task has completed, helping with
    /// queued work meanwhile.
    pub fn stream_wait(&self, main: &mut WorkerContext, stream: &Stream) {
        while stream.state.completed.load(Ordering::Acquire) < stream.task_count {
            if self.shared.available.try_wait() {
                match self.shared.queue.pop() {
                    Some(TaskMsg::Run(task)) => run_task(task, main),
                    Some(TaskMsg::Exit) => self.post(TaskMsg::Exit),
                    None => {}
                }
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Post one exit message per worker and join them all.
    pub fn shutdown(mut self) {
        for _ in 1..self.worker_count {
            self.post(TaskMsg::Exit);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("task system offline");
    }
}

fn worker_main(ctx: &mut WorkerContext) {
    loop {
        // Plow through available work without sleeping.
        while ctx.shared.available.try_wait() {
            match ctx.shared.queue.pop() {
                Some(TaskMsg::Run(task)) => run_task(task, ctx),
                Some(TaskMsg::Exit) => return,
                None => break,
            }
        }

        ctx.shared.available.wait();
        match ctx.shared.queue.pop() {
            Some(TaskMsg::Run(task)) => run_task(task, ctx),
            Some(TaskMsg::Exit) => return,
            None => {}
        }
    }
}

/// Dispatch batch with a counter-based wait; tasks are fire-and-forget
/// until the owner calls [TaskContext::stream_wait].
pub struct Stream {
    state: Arc<StreamState>,
    task_count: u32,
}

impl Stream {
    pub fn task_count(&self) -> u32 {
        self.task_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn bundle_join_sees_every_write() -> Result<()> {
        let (ctx, mut main) = TaskContext::new(4, None)?;
        let mut inputs: Vec<u32> = vec![0; 1000];
        ctx.bundle_run_split(&mut main, &mut inputs, 7, |_w, range| {
            for value in range.iter_mut() {
                *value += 1;
            }
        });
        assert!(inputs.iter().all(|&v| v == 1));
        ctx.shutdown();
        Ok(())
    }

    #[test]
    fn split_ranges_cover_input_exactly_once() -> Result<()> {
        let (ctx, mut main) = TaskContext::new(3, None)?;
        // 10 inputs over 4 splits: 3, 3, 2, 2
        let mut inputs: Vec<u32> = (0..10).collect();
        ctx.bundle_run_split(&mut main, &mut inputs, 4, |_w, range| {
            assert!(range.len() == 2 || range.len() == 3);
            for value in range.iter_mut() {
                *value = value.wrapping_mul(2);
            }
        });
        let expect: Vec<u32> = (0..10).map(|v| v * 2).collect();
        assert_eq!(inputs, expect);
        ctx.shutdown();
        Ok(())
    }

    #[test]
    fn bundle_with_fewer_inputs_than_splits() -> Result<()> {
        let (ctx, mut main) = TaskContext::new(2, None)?;
        let mut inputs: Vec<u32> = vec![0; 3];
        ctx.bundle_run_split(&mut main, &mut inputs, 8, |_w, range| {
            assert_eq!(range.len(), 1);
            range[0] = 5;
        });
        assert_eq!(inputs, vec![5, 5, 5]);
        ctx.shutdown();
        Ok(())
    }

    #[test]
    fn single_worker_pool_cannot_deadlock() -> Result<()> {
        let (ctx, mut main) = TaskContext::new(1, None)?;
        let mut inputs: Vec<u32> = vec![0; 64];
        ctx.bundle_run_split(&mut main, &mut inputs, 4, |_w, range| {
            for value in range.iter_mut() {
                *value = 9;
            }
        });
        assert!(inputs.iter().all(|&v| v == 9));
        ctx.shutdown();
        Ok(())
    }

    #[test]
    fn stream_wait_joins_all_dispatches() -> Result<()> {
        let (ctx, mut main) = TaskContext::new(3, None)?;
        let counter = Arc::new(AtomicUsize::new(0));
        let mut stream = ctx.stream();
        for _ in 0..32 {
            let counter = counter.clone();
            ctx.stream_dispatch(&mut stream, move |_w| {
                counter.fetch_add(1, Ordering::AcqRel);
            });
        }
        ctx.stream_wait(&mut main, &stream);
        assert_eq!(counter.load(Ordering::Acquire), 32);
        ctx.shutdown();
        Ok(())
    }

    #[test]
    fn frame_clear_flushes_worker_arenas() -> Result<()> {
        let (ctx, mut main) = TaskContext::new(1, None)?;
        main.mem_frame.push(512).unwrap();
        assert!(main.mem_frame.used() >= 512);

        ctx.frame_clear();
        // worker 0 applies the flag on its next task
        ctx.dispatch(|_w| {});
        ctx.run_available(&mut main);
        assert_eq!(main.mem_frame.used(), 0);
        ctx.shutdown();
        Ok(())
    }

    #[test]
    fn worker_init_runs_on_every_spawned_worker() -> Result<()> {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_init = seen.clone();
        let init: WorkerInit = Some(Arc::new(move |_worker| {
            seen_in_init.fetch_add(1, Ordering::AcqRel);
        }));
        let (ctx, _main) = TaskContext::new(4, init)?;
        // workers 1..4
        while seen.load(Ordering::Acquire) < 3 {
            std::thread::yield_now();
        }
        ctx.shutdown();
        Ok(())
    }
}
