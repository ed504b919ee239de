//! N-of-M wait aggregation over heterogeneous waitables.
//!
//! [`wait_ready`] waits until `count` of the given primitives are ready,
//! or until a deadline elapses, and returns the ones that made it. It
//! depends only on the [`Waitable`] capability, so events and result
//! cells mix freely in one call.
//!
//! The algorithm is stateless across calls:
//!
//! 1. inputs already ready count immediately, in input order, without
//!    registering anything; if that alone satisfies `count` the call
//!    returns on the first poll;
//! 2. otherwise one link is registered per not-yet-ready input and the
//!    caller suspends until enough links fire or the deadline passes;
//! 3. however the wait ends — satisfied, timed out or cancelled — every
//!    registered link is removed again, so nothing fires into a
//!    finished wait later.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tracing::trace;

use crate::link::{Link, Waitable};
use crate::runtime::{Handle, TimerKey};
use crate::time::Time;

/// Waits for `count` of `objects` to become ready, or for `timeout`.
///
/// `count` defaults to all of them and is clamped to the collection
/// size; `count == 0` returns an empty result immediately. The same
/// object may appear more than once, with each occurrence counted
/// independently.
///
/// Returns the ready objects in discovery order: inputs that were ready
/// at call time first (input order), then the rest in the order they
/// fired. The result never exceeds `count`; it is shorter only if the
/// deadline elapsed first.
#[must_use = "futures do nothing unless awaited"]
pub fn wait_ready(
    handle: &Handle,
    objects: &[Arc<dyn Waitable>],
    count: Option<usize>,
    timeout: Option<Duration>,
) -> WaitReady {
    let target = count.unwrap_or(objects.len()).min(objects.len());
    WaitReady {
        handle: handle.clone(),
        objects: objects.to_vec(),
        target,
        deadline: timeout.map(|t| handle.now() + t),
        ready_first: Vec::new(),
        registered: Vec::new(),
        shared: None,
        timer: None,
        started: false,
    }
}

/// Waits for every object in the collection. Shorthand for
/// [`wait_ready`] with the default count.
#[must_use = "futures do nothing unless awaited"]
pub fn wait_all(
    handle: &Handle,
    objects: &[Arc<dyn Waitable>],
    timeout: Option<Duration>,
) -> WaitReady {
    wait_ready(handle, objects, None, timeout)
}

struct AggShared {
    /// Indices of inputs whose link fired, in firing order.
    fired: Vec<usize>,
    /// Set when the wait has finished; neutralizes links that were
    /// already drained into a scheduled pass and can no longer be
    /// unlinked.
    done: bool,
    waker: Option<Waker>,
}

/// Future returned by [`wait_ready`] and [`wait_all`].
pub struct WaitReady {
    handle: Handle,
    objects: Vec<Arc<dyn Waitable>>,
    target: usize,
    deadline: Option<Time>,
    ready_first: Vec<usize>,
    registered: Vec<(usize, Link)>,
    shared: Option<Arc<Mutex<AggShared>>>,
    timer: Option<TimerKey>,
    started: bool,
}

impl WaitReady {
    fn collect(&self, fired: &[usize]) -> Vec<Arc<dyn Waitable>> {
        self.ready_first
            .iter()
            .chain(fired.iter())
            .take(self.target)
            .map(|&i| Arc::clone(&self.objects[i]))
            .collect()
    }

    fn teardown(&mut self) {
        for (index, link) in self.registered.drain(..) {
            self.objects[index].unlink(&link);
        }
        if let Some(key) = self.timer.take() {
            self.handle.cancel_timer(key);
        }
    }
}

impl Future for WaitReady {
    type Output = Vec<Arc<dyn Waitable>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.started {
            this.started = true;
            if this.target == 0 {
                return Poll::Ready(Vec::new());
            }
            let mut pending = Vec::new();
            for (index, object) in this.objects.iter().enumerate() {
                if object.ready() {
                    this.ready_first.push(index);
                    if this.ready_first.len() == this.target {
                        // Satisfied by inspection alone; nothing was
                        // registered, nothing to tear down.
                        return Poll::Ready(this.collect(&[]));
                    }
                } else {
                    pending.push(index);
                }
            }
            let shared = Arc::new(Mutex::new(AggShared {
                fired: Vec::new(),
                done: false,
                waker: Some(cx.waker().clone()),
            }));
            for index in pending {
                let inner = Arc::clone(&shared);
                let link: Link = Arc::new(move || {
                    let waker = {
                        let mut s = inner.lock().expect("aggregate state lock poisoned");
                        if s.done {
                            return;
                        }
                        s.fired.push(index);
                        s.waker.take()
                    };
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                });
                this.objects[index].rawlink(Arc::clone(&link));
                this.registered.push((index, link));
            }
            trace!(
                ready = this.ready_first.len(),
                links = this.registered.len(),
                target = this.target,
                "aggregate wait registered"
            );
            this.timer = this
                .deadline
                .map(|at| this.handle.arm_timer(at, cx.waker().clone()));
            this.shared = Some(shared);
            return Poll::Pending;
        }

        let Some(shared) = this.shared.as_ref().map(Arc::clone) else {
            return Poll::Ready(Vec::new());
        };
        let finished = {
            let mut s = shared.lock().expect("aggregate state lock poisoned");
            if this.ready_first.len() + s.fired.len() >= this.target {
                s.done = true;
                Some(s.fired.clone())
            } else if this.deadline.is_some_and(|at| this.handle.now() >= at) {
                s.done = true;
                Some(s.fired.clone())
            } else {
                s.waker = Some(cx.waker().clone());
                None
            }
        };
        match finished {
            Some(fired) => {
                this.teardown();
                this.shared = None;
                Poll::Ready(this.collect(&fired))
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for WaitReady {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            // Cancelled mid-wait: silence stragglers, then deregister.
            shared
                .lock()
                .expect("aggregate state lock poisoned")
                .done = true;
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::test_utils::test_runtime;

    fn events(handle: &Handle, n: usize) -> Vec<Arc<Event>> {
        (0..n).map(|_| Arc::new(Event::new(handle))).collect()
    }

    fn as_waitables(events: &[Arc<Event>]) -> Vec<Arc<dyn Waitable>> {
        events
            .iter()
            .map(|e| Arc::clone(e) as Arc<dyn Waitable>)
            .collect()
    }

    #[test]
    fn count_zero_returns_immediately() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        rt.block_on(async move {
            let evs = events(&handle, 3);
            let objs = as_waitables(&evs);
            let got = wait_ready(&handle, &objs, Some(0), None).await;
            assert!(got.is_empty());
            assert!(evs.iter().all(|e| e.linkcount() == 0));
        });
    }

    #[test]
    fn already_ready_inputs_satisfy_without_links() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        rt.block_on(async move {
            let evs = events(&handle, 3);
            evs[0].set();
            evs[1].set();
            evs[2].set();
            let objs = as_waitables(&evs);
            let got = wait_ready(&handle, &objs, Some(2), None).await;
            // Exactly count results, stable over input order.
            assert_eq!(got.len(), 2);
            assert!(Arc::ptr_eq(&got[0], &objs[0]));
            assert!(Arc::ptr_eq(&got[1], &objs[1]));
            assert!(evs.iter().all(|e| e.linkcount() == 0));
        });
    }

    #[test]
    fn empty_collection_returns_empty() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        rt.block_on(async move {
            let got = wait_ready(&handle, &[], None, None).await;
            assert!(got.is_empty());
        });
    }

    #[test]
    fn timeout_returns_partial_result_and_unlinks() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        rt.block_on(async move {
            let evs = events(&handle, 3);
            evs[0].set();
            let objs = as_waitables(&evs);
            let got = wait_ready(&handle, &objs, None, Some(Duration::from_millis(10))).await;
            assert_eq!(got.len(), 1);
            assert!(Arc::ptr_eq(&got[0], &objs[0]));
            assert!(evs.iter().all(|e| e.linkcount() == 0));
        });
    }

    #[test]
    fn duplicate_objects_count_independently() {
        let mut rt = test_runtime();
        let handle = rt.handle();
        let event = Arc::new(Event::new(&handle));
        let objs: Vec<Arc<dyn Waitable>> = vec![
            Arc::clone(&event) as Arc<dyn Waitable>,
            Arc::clone(&event) as Arc<dyn Waitable>,
        ];
        let ev = Arc::clone(&event);
        let handle2 = handle.clone();
        handle.spawn::<_, (), std::convert::Infallible>(async move {
            handle2.yield_now().await;
            ev.set();
            Ok(())
        });
        let handle3 = handle.clone();
        let got = rt.block_on(async move { wait_ready(&handle3, &objs, None, None).await });
        assert_eq!(got.len(), 2);
    }
}
