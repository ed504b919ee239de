//! Deterministic single-threaded cooperative runtime.
//!
//! The runtime is the host the synchronization primitives hang off: it
//! owns the task table, the deferred-callback queue, the ready queue and
//! the virtual-time timer heap. Exactly one task polls at a time; tasks
//! yield only at explicit suspension points.
//!
//! # Turns
//!
//! One [`Runtime::step`] executes one scheduler turn, in priority order:
//!
//! 1. run one deferred callback (notification passes land here);
//! 2. fire timers due at the current virtual time;
//! 3. poll one ready task;
//! 4. with nothing else runnable, advance the virtual clock to the
//!    earliest armed timer and fire it.
//!
//! A callback or task that completes a primitive therefore always
//! finishes its turn before any waiter resumes.
//!
//! # Quick start
//!
//! ```ignore
//! use coopsync::runtime::Runtime;
//!
//! let mut rt = Runtime::new();
//! let value = rt.block_on(async { 42 });
//! assert_eq!(value, 42);
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use tracing::trace;

use crate::result::{AsyncResult, OutcomeLink};
use crate::time::{sleep, Sleep, Time};

mod timer;

pub use timer::TimerKey;

use timer::TimerHeap;

type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;
type Deferred = Box<dyn FnOnce()>;

/// Identifier of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Wakes a task by pushing its id back onto the shared ready queue.
struct TaskWaker {
    id: TaskId,
    ready: Arc<Mutex<VecDeque<TaskId>>>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready
            .lock()
            .expect("ready queue lock poisoned")
            .push_back(self.id);
    }
}

struct Tasks {
    table: HashMap<u64, BoxFuture>,
    /// Tasks killed while their future was checked out for polling.
    killed: HashSet<u64>,
    next_id: u64,
}

/// Shared scheduling surface handed to primitives and tasks.
///
/// Cloning is cheap; a `Handle` does not keep the task table alive, so a
/// primitive outliving its runtime degrades to inert (spawns are dropped,
/// deferred callbacks never run).
#[derive(Clone)]
pub struct Handle {
    deferred: Rc<RefCell<VecDeque<Deferred>>>,
    timers: Rc<RefCell<TimerHeap>>,
    clock: Rc<Cell<Time>>,
    ready: Arc<Mutex<VecDeque<TaskId>>>,
    tasks: Weak<RefCell<Tasks>>,
}

impl Handle {
    /// Schedules `callback` to run on a future scheduler turn, after the
    /// current turn completes. Callbacks run one per turn, FIFO.
    pub fn defer(&self, callback: impl FnOnce() + 'static) {
        self.deferred.borrow_mut().push_back(Box::new(callback));
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.get()
    }

    /// Suspends for `duration` of virtual time. See [`sleep`].
    #[must_use = "futures do nothing unless awaited"]
    pub fn sleep(&self, duration: Duration) -> Sleep {
        sleep(self, duration)
    }

    /// Yields the current turn, resuming on a later one.
    #[must_use = "futures do nothing unless awaited"]
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    /// Spawns a task whose completion is fed into an [`AsyncResult`].
    ///
    /// The returned [`TaskHandle`] exposes the completion cell for
    /// joining and for attaching outcome links. If the runtime has been
    /// dropped the future is discarded and the cell stays pending.
    pub fn spawn<F, T, E>(&self, future: F) -> TaskHandle<T, E>
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: Clone + 'static,
        E: Clone + 'static,
    {
        let result = Arc::new(AsyncResult::new(self));
        let cell = Arc::clone(&result);
        let id = self.spawn_raw(async move {
            match future.await {
                Ok(value) => cell.set_value(value),
                Err(error) => cell.set_exception(error),
            }
        });
        TaskHandle {
            id,
            result,
            tasks: self.tasks.clone(),
        }
    }

    /// Spawns a bare unit future. Used by `spawn` and `block_on`.
    pub(crate) fn spawn_raw(&self, future: impl Future<Output = ()> + 'static) -> TaskId {
        let Some(tasks) = self.tasks.upgrade() else {
            trace!("spawn on dropped runtime discarded");
            return TaskId(u64::MAX);
        };
        let id = {
            let mut tasks = tasks.borrow_mut();
            let id = tasks.next_id;
            tasks.next_id += 1;
            tasks.table.insert(id, Box::pin(future));
            TaskId(id)
        };
        self.ready
            .lock()
            .expect("ready queue lock poisoned")
            .push_back(id);
        trace!(task = id.0, "task spawned");
        id
    }

    pub(crate) fn arm_timer(&self, at: Time, waker: Waker) -> TimerKey {
        self.timers.borrow_mut().arm(at, waker)
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        self.timers.borrow_mut().cancel(key);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("now", &self.clock.get())
            .field("deferred", &self.deferred.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Handle to a spawned task.
///
/// The task's outcome is fed into an internal [`AsyncResult`] when it
/// finishes; [`join`](Self::join) and [`link`](Self::link) both observe
/// the task through that cell.
#[derive(Debug)]
pub struct TaskHandle<T, E> {
    id: TaskId,
    result: Arc<AsyncResult<T, E>>,
    tasks: Weak<RefCell<Tasks>>,
}

impl<T: Clone + 'static, E: Clone + 'static> TaskHandle<T, E> {
    /// The task's completion cell.
    #[must_use]
    pub fn result(&self) -> Arc<AsyncResult<T, E>> {
        Arc::clone(&self.result)
    }

    /// Returns true once the task has finished.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.result.ready()
    }

    /// Waits for the task to finish and returns its outcome.
    pub async fn join(&self) -> Result<T, E> {
        self.result.get().await
    }

    /// Registers an outcome link invoked (on a later turn) with the
    /// task's result when it finishes. Accepts any of the adapter
    /// flavors produced by [`AsyncResult::as_link`],
    /// [`AsyncResult::as_value_link`] or
    /// [`AsyncResult::as_exception_link`], or an arbitrary callback.
    pub fn link(&self, link: OutcomeLink<T, E>) {
        let cell = Arc::downgrade(&self.result);
        self.result.rawlink(Arc::new(move || {
            let Some(cell) = cell.upgrade() else { return };
            if let Some(outcome) = cell.outcome() {
                link(&outcome);
            }
        }));
    }

    /// Kills the task: its future is dropped, which unwinds any in-flight
    /// waits through their `Drop` impls (deregistering links and timers).
    /// The completion cell is left pending.
    pub fn kill(&self) {
        let Some(tasks) = self.tasks.upgrade() else {
            return;
        };
        let mut tasks = tasks.borrow_mut();
        if tasks.table.remove(&self.id.0).is_none() {
            // Mid-poll (or already finished): flag for the scheduler.
            tasks.killed.insert(self.id.0);
        }
        trace!(task = self.id.0, "task killed");
    }
}

/// Future returned by [`Handle::yield_now`].
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// The deterministic single-threaded runtime.
pub struct Runtime {
    handle: Handle,
    tasks: Rc<RefCell<Tasks>>,
    steps: u64,
}

impl Runtime {
    /// Creates a new runtime with the virtual clock at [`Time::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        let tasks = Rc::new(RefCell::new(Tasks {
            table: HashMap::new(),
            killed: HashSet::new(),
            next_id: 0,
        }));
        let handle = Handle {
            deferred: Rc::new(RefCell::new(VecDeque::new())),
            timers: Rc::new(RefCell::new(TimerHeap::default())),
            clock: Rc::new(Cell::new(Time::ZERO)),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            tasks: Rc::downgrade(&tasks),
        };
        Self {
            handle,
            tasks,
            steps: 0,
        }
    }

    /// Returns a clone of the scheduling handle.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.handle.now()
    }

    /// Number of turns executed so far.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Executes one turn. Returns false when the runtime is quiescent
    /// (no deferred callbacks, no ready tasks, no armed timers).
    pub fn step(&mut self) -> bool {
        self.steps += 1;

        // 1. Deferred callbacks run first, one per turn.
        let callback = self.handle.deferred.borrow_mut().pop_front();
        if let Some(callback) = callback {
            callback();
            return true;
        }

        // 2. Timers already due at the current time.
        let due = {
            let now = self.handle.now();
            self.handle.timers.borrow_mut().take_due(now)
        };
        if !due.is_empty() {
            for waker in due {
                waker.wake();
            }
            return true;
        }

        // 3. Poll one ready task.
        loop {
            let id = self
                .handle
                .ready
                .lock()
                .expect("ready queue lock poisoned")
                .pop_front();
            let Some(id) = id else { break };
            let Some(mut future) = self.tasks.borrow_mut().table.remove(&id.0) else {
                // Completed or killed while queued; stale wake.
                continue;
            };
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: Arc::clone(&self.handle.ready),
            }));
            let mut cx = Context::from_waker(&waker);
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    trace!(task = id.0, "task completed");
                    self.tasks.borrow_mut().killed.remove(&id.0);
                }
                Poll::Pending => {
                    let mut tasks = self.tasks.borrow_mut();
                    if tasks.killed.remove(&id.0) {
                        drop(tasks);
                        // Killed during its own poll; drop cancels waits.
                        drop(future);
                    } else {
                        tasks.table.insert(id.0, future);
                    }
                }
            }
            return true;
        }

        // 4. Nothing runnable: advance virtual time to the next timer.
        let (target, due) = {
            let mut timers = self.handle.timers.borrow_mut();
            let Some(at) = timers.next_deadline() else {
                return false;
            };
            let target = at.max(self.handle.clock.get());
            (target, timers.take_due(target))
        };
        self.handle.clock.set(target);
        trace!(now = ?target, "virtual clock advanced");
        for waker in due {
            waker.wake();
        }
        true
    }

    /// Runs turns until the runtime is quiescent. Returns the number of
    /// turns executed.
    pub fn run_until_quiescent(&mut self) -> u64 {
        let start = self.steps;
        while self.step() {}
        self.steps - start
    }

    /// Spawns `future` as a task and runs the runtime until it completes,
    /// returning its output.
    ///
    /// # Panics
    ///
    /// Panics if the runtime goes quiescent while the future is still
    /// pending (every task suspended with no timer to wake it).
    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        self.handle.spawn_raw(async move {
            *out.borrow_mut() = Some(future.await);
        });
        loop {
            if slot.borrow().is_some() {
                break;
            }
            assert!(
                self.step(),
                "runtime went quiescent with the block_on future still pending"
            );
        }
        let output = slot.borrow_mut().take();
        output.expect("block_on result missing")
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("now", &self.handle.now())
            .field("steps", &self.steps)
            .field("tasks", &self.tasks.borrow().table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_runtime;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn block_on_returns_output() {
        let mut rt = test_runtime();
        let value = rt.block_on(async { 41 + 1 });
        assert_eq!(value, 42);
    }

    #[test]
    fn deferred_callbacks_run_fifo_on_later_turns() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in [1, 2, 3] {
            let log2 = Rc::clone(&log);
            handle.defer(move || log2.borrow_mut().push(tag));
        }
        assert!(log.borrow().is_empty());
        rt.run_until_quiescent();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn spawned_task_completion_feeds_cell() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        let task = handle.spawn::<_, i32, std::convert::Infallible>(async { Ok(7) });
        rt.run_until_quiescent();
        assert!(task.ready());
        assert_eq!(task.result().value(), Some(7));
    }

    #[test]
    fn tasks_spawned_from_tasks_run() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        let hits = Rc::new(RefCell::new(0));
        let hits2 = Rc::clone(&hits);
        let handle2 = handle.clone();
        rt.block_on(async move {
            let inner = handle2.spawn::<_, (), std::convert::Infallible>(async move {
                *hits2.borrow_mut() += 1;
                Ok(())
            });
            inner.join().await.expect("inner task failed");
        });
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn kill_prevents_further_progress() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        let hits = Rc::new(RefCell::new(0));
        let hits2 = Rc::clone(&hits);
        let handle2 = handle.clone();
        let task = handle.spawn::<_, (), std::convert::Infallible>(async move {
            crate::time::sleep(&handle2, Duration::from_millis(10)).await;
            *hits2.borrow_mut() += 1;
            Ok(())
        });
        task.kill();
        rt.run_until_quiescent();
        assert_eq!(*hits.borrow(), 0);
        assert!(!task.ready());
    }

    #[test]
    fn yield_now_suspends_once() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        rt.block_on(async move {
            handle.yield_now().await;
        });
    }

    #[test]
    fn steps_count_turns() {
        let mut rt = test_runtime();
        assert_eq!(rt.steps(), 0);
        let _ = rt.block_on(async { 1 });
        assert!(rt.steps() > 0);
    }
}
