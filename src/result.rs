//! One-shot result cell.
//!
//! [`AsyncResult`] holds the outcome of a computation that has not
//! necessarily happened yet: it starts pending, transitions exactly once
//! to fulfilled or rejected, and from then on answers every reader with
//! the same outcome. Waiters suspended in [`get`](AsyncResult::get) are
//! woken by a deferred notification pass.
//!
//! A cell can also stand in as the completion target of a spawned task:
//! the adapters [`as_link`](AsyncResult::as_link),
//! [`as_value_link`](AsyncResult::as_value_link) and
//! [`as_exception_link`](AsyncResult::as_exception_link) produce callbacks
//! that feed a task's outcome into the cell through the normal
//! `set_value`/`set_exception` contract.
//!
//! # Cancel safety
//!
//! The blocking futures deregister their link when dropped; a cancelled
//! or timed-out `get` never receives a late notification, and the cell
//! remains usable.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tracing::trace;

use crate::link::{waiter_link, Link, LinkCore, WaitShared, Waitable};
use crate::runtime::{Handle, TimerKey};
use crate::time::{Elapsed, Time};

/// A callback invoked with a finished task's outcome. Produced by the
/// [`AsyncResult`] adapter methods, consumed by
/// [`TaskHandle::link`](crate::runtime::TaskHandle::link).
pub type OutcomeLink<T, E> = Arc<dyn Fn(&Result<T, E>)>;

/// Error returned by the fallible get operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetError<E> {
    /// The cell was rejected; carries the stored error.
    Rejected(E),
    /// The deadline elapsed before the cell completed, or the cell was
    /// still pending for a non-blocking get.
    TimedOut(Elapsed),
}

impl<E: fmt::Display> fmt::Display for GetError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "result cell was rejected: {e}"),
            Self::TimedOut(e) => write!(f, "result cell still pending: {e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for GetError<E> {}

/// A write-once cell for the outcome of a concurrent operation.
///
/// Share between tasks with `Arc`.
pub struct AsyncResult<T, E> {
    core: Arc<LinkCore>,
    outcome: Mutex<Option<Result<T, E>>>,
}

impl<T, E> AsyncResult<T, E> {
    /// Creates a pending cell attached to the given scheduler handle.
    #[must_use]
    pub fn new(handle: &Handle) -> Self {
        Self {
            core: LinkCore::new(handle.clone()),
            outcome: Mutex::new(None),
        }
    }

    /// Returns true once the cell is fulfilled or rejected.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.outcome
            .lock()
            .expect("result cell lock poisoned")
            .is_some()
    }

    /// Returns true if the cell is fulfilled (not pending, not rejected).
    #[must_use]
    pub fn successful(&self) -> bool {
        matches!(
            &*self.outcome.lock().expect("result cell lock poisoned"),
            Some(Ok(_))
        )
    }

    /// Number of currently registered links (diagnostic).
    #[must_use]
    pub fn linkcount(&self) -> usize {
        self.core.len()
    }

    /// Registers a link fired once the cell completes. Linking an
    /// already-terminal cell schedules a pass, so the link still fires on
    /// a later turn. See [`Waitable::rawlink`].
    pub fn rawlink(&self, link: Link) {
        self.core.add(link);
    }

    /// Removes a link by identity; no-op if absent.
    pub fn unlink(&self, link: &Link) {
        self.core.remove(link);
    }
}

impl<T: Clone, E: Clone> AsyncResult<T, E> {
    /// Fulfills the cell. Ignored if the cell is already terminal; the
    /// first outcome is never overwritten.
    pub fn set_value(&self, value: T) {
        self.complete(Ok(value));
    }

    /// Rejects the cell. Ignored if the cell is already terminal.
    pub fn set_exception(&self, error: E) {
        self.complete(Err(error));
    }

    fn complete(&self, outcome: Result<T, E>) {
        {
            let mut slot = self.outcome.lock().expect("result cell lock poisoned");
            if slot.is_some() {
                trace!("completion ignored; cell already terminal");
                return;
            }
            *slot = Some(outcome);
        }
        trace!("result cell completed");
        self.core.set_level(true);
    }

    /// The fulfilled value, if any.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        match &*self.outcome.lock().expect("result cell lock poisoned") {
            Some(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// The rejection error, if any.
    #[must_use]
    pub fn exception(&self) -> Option<E> {
        match &*self.outcome.lock().expect("result cell lock poisoned") {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// The full outcome, if terminal.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<T, E>> {
        self.outcome
            .lock()
            .expect("result cell lock poisoned")
            .clone()
    }

    /// Waits for completion and returns the outcome.
    ///
    /// A terminal cell answers on the first poll, without suspension,
    /// every time it is asked.
    pub async fn get(&self) -> Result<T, E> {
        match self.get_deadline(None).await {
            Ok(value) => Ok(value),
            Err(GetError::Rejected(error)) => Err(error),
            // No deadline was armed; the only failure is the rejection.
            Err(GetError::TimedOut(_)) => unreachable!("unbounded get cannot time out"),
        }
    }

    /// Waits for completion with a deadline. On timeout the link is
    /// removed before the error is returned and the cell is unaffected.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T, GetError<E>> {
        let deadline = self.core.handle().now() + timeout;
        self.get_deadline(Some(deadline)).await
    }

    /// Non-blocking get: the outcome if terminal, otherwise
    /// [`GetError::TimedOut`] immediately.
    pub fn get_nowait(&self) -> Result<T, GetError<E>> {
        match &*self.outcome.lock().expect("result cell lock poisoned") {
            Some(Ok(v)) => Ok(v.clone()),
            Some(Err(e)) => Err(GetError::Rejected(e.clone())),
            None => Err(GetError::TimedOut(Elapsed::new(self.core.handle().now()))),
        }
    }

    /// Waits for completion and returns the fulfilled value, or `None`
    /// if the cell was rejected. Never surfaces the rejection.
    pub async fn wait(&self) -> Option<T> {
        self.get_deadline(None).await.ok()
    }

    /// Like [`wait`](Self::wait) but bounded: also returns `None` if the
    /// deadline elapses first.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = self.core.handle().now() + timeout;
        self.get_deadline(Some(deadline)).await.ok()
    }

    fn get_deadline(&self, deadline: Option<Time>) -> GetFuture<'_, T, E> {
        GetFuture {
            cell: self,
            deadline,
            waiting: None,
        }
    }

    fn read_terminal(&self) -> Option<Result<T, GetError<E>>> {
        match &*self.outcome.lock().expect("result cell lock poisoned") {
            Some(Ok(v)) => Some(Ok(v.clone())),
            Some(Err(e)) => Some(Err(GetError::Rejected(e.clone()))),
            None => None,
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> AsyncResult<T, E> {
    /// Adapter receiving both outcomes: successes fulfill the cell,
    /// failures reject it.
    #[must_use]
    pub fn as_link(self: &Arc<Self>) -> OutcomeLink<T, E> {
        let cell = Arc::downgrade(self);
        Arc::new(move |outcome: &Result<T, E>| {
            let Some(cell) = cell.upgrade() else { return };
            match outcome {
                Ok(value) => cell.set_value(value.clone()),
                Err(error) => cell.set_exception(error.clone()),
            }
        })
    }

    /// Adapter receiving only successes; failures are dropped.
    #[must_use]
    pub fn as_value_link(self: &Arc<Self>) -> OutcomeLink<T, E> {
        let cell = Arc::downgrade(self);
        Arc::new(move |outcome: &Result<T, E>| {
            let Some(cell) = cell.upgrade() else { return };
            if let Ok(value) = outcome {
                cell.set_value(value.clone());
            }
        })
    }

    /// Adapter receiving only failures; successes are dropped.
    #[must_use]
    pub fn as_exception_link(self: &Arc<Self>) -> OutcomeLink<T, E> {
        let cell = Arc::downgrade(self);
        Arc::new(move |outcome: &Result<T, E>| {
            let Some(cell) = cell.upgrade() else { return };
            if let Err(error) = outcome {
                cell.set_exception(error.clone());
            }
        })
    }
}

impl<T: 'static, E: 'static> Waitable for AsyncResult<T, E> {
    fn ready(&self) -> bool {
        self.ready()
    }

    fn rawlink(&self, link: Link) {
        self.core.add(link);
    }

    fn unlink(&self, link: &Link) {
        self.core.remove(link);
    }
}

impl<T, E> fmt::Debug for AsyncResult<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.outcome.lock().expect("result cell lock poisoned") {
            None => "pending",
            Some(Ok(_)) => "fulfilled",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("AsyncResult")
            .field("state", &state)
            .field("links", &self.linkcount())
            .finish()
    }
}

struct Registration {
    shared: Arc<Mutex<WaitShared>>,
    link: Link,
    timer: Option<TimerKey>,
}

/// Future behind the blocking get/wait operations.
struct GetFuture<'a, T, E> {
    cell: &'a AsyncResult<T, E>,
    deadline: Option<Time>,
    waiting: Option<Registration>,
}

impl<T: Clone, E: Clone> Future for GetFuture<'_, T, E> {
    type Output = Result<T, GetError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.cell.read_terminal() {
            if let Some(reg) = this.waiting.take() {
                this.cell.core.remove(&reg.link);
                if let Some(key) = reg.timer {
                    this.cell.core.handle().cancel_timer(key);
                }
            }
            return Poll::Ready(outcome);
        }
        match this.waiting.take() {
            None => {
                let (shared, link) = waiter_link(cx.waker().clone());
                this.cell.core.add(Arc::clone(&link));
                let timer = this
                    .deadline
                    .map(|at| this.cell.core.handle().arm_timer(at, cx.waker().clone()));
                this.waiting = Some(Registration {
                    shared,
                    link,
                    timer,
                });
                Poll::Pending
            }
            Some(reg) => {
                {
                    let mut shared = reg.shared.lock().expect("wait state lock poisoned");
                    shared.waker = Some(cx.waker().clone());
                }
                if let Some(at) = this.deadline {
                    if this.cell.core.handle().now() >= at {
                        this.cell.core.remove(&reg.link);
                        if let Some(key) = reg.timer {
                            this.cell.core.handle().cancel_timer(key);
                        }
                        return Poll::Ready(Err(GetError::TimedOut(Elapsed::new(at))));
                    }
                }
                this.waiting = Some(reg);
                Poll::Pending
            }
        }
    }
}

impl<T, E> Drop for GetFuture<'_, T, E> {
    fn drop(&mut self) {
        if let Some(reg) = self.waiting.take() {
            // Cancelled mid-wait: deregister before unwinding.
            self.cell.core.remove(&reg.link);
            if let Some(key) = reg.timer {
                self.cell.core.handle().cancel_timer(key);
            }
        }
    }
}
