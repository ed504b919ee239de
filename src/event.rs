//! Manual-reset event.
//!
//! [`Event`] is a level-triggered signal: `set` raises it and wakes every
//! registered waiter (on a later turn), `clear` lowers it without waking
//! anyone, and the cycle may repeat indefinitely. Share one between tasks
//! with `Arc`.
//!
//! # Cancel safety
//!
//! The future returned by [`Event::wait`] deregisters its link when
//! dropped, so a cancelled or timed-out waiter never receives a late
//! notification.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tracing::trace;

use crate::link::{waiter_link, Link, LinkCore, WaitShared, Waitable};
use crate::runtime::{Handle, TimerKey};
use crate::time::Time;

/// A manual-reset, level-triggered event.
///
/// # Example
///
/// ```ignore
/// let event = Arc::new(Event::new(&handle));
/// let waiter = Arc::clone(&event);
/// handle.spawn::<_, bool, Infallible>(async move { Ok(waiter.wait().await) });
/// event.set();
/// ```
pub struct Event {
    core: Arc<LinkCore>,
}

impl Event {
    /// Creates an unset event attached to the given scheduler handle.
    #[must_use]
    pub fn new(handle: &Handle) -> Self {
        Self {
            core: LinkCore::new(handle.clone()),
        }
    }

    /// Sets the event, scheduling a notification pass for every waiter
    /// registered so far. Idempotent: setting an already-set event does
    /// nothing.
    pub fn set(&self) {
        trace!("event set");
        self.core.set_level(true);
    }

    /// Clears the event. Never notifies; a no-op when already clear.
    pub fn clear(&self) {
        trace!("event cleared");
        self.core.set_level(false);
    }

    /// Returns true while the event is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.core.is_level()
    }

    /// Alias for [`is_set`](Self::is_set), matching the waitable surface.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.is_set()
    }

    /// Number of currently registered links (diagnostic).
    #[must_use]
    pub fn linkcount(&self) -> usize {
        self.core.len()
    }

    /// Registers a link fired on the next notification pass. See
    /// [`Waitable::rawlink`].
    pub fn rawlink(&self, link: Link) {
        self.core.add(link);
    }

    /// Removes a link by identity; no-op if absent.
    pub fn unlink(&self, link: &Link) {
        self.core.remove(link);
    }

    /// Waits until the event is set. Returns true.
    ///
    /// If the event is already set and no notification pass is in
    /// progress, completes on the first poll without a scheduler
    /// round-trip. A waiter arriving during an active pass is queued like
    /// any other and resumed by a follow-up pass on a later turn.
    #[must_use = "futures do nothing unless awaited"]
    pub fn wait(&self) -> EventWait<'_> {
        self.wait_deadline(None)
    }

    /// Waits until the event is set or `timeout` elapses. Returns true if
    /// the event was set, false on timeout (the link is removed before
    /// returning).
    #[must_use = "futures do nothing unless awaited"]
    pub fn wait_timeout(&self, timeout: Duration) -> EventWait<'_> {
        let deadline = self.core.handle().now() + timeout;
        self.wait_deadline(Some(deadline))
    }

    fn wait_deadline(&self, deadline: Option<Time>) -> EventWait<'_> {
        EventWait {
            event: self,
            deadline,
            waiting: None,
            state: WaitFsm::Init,
        }
    }
}

impl Waitable for Event {
    fn ready(&self) -> bool {
        self.is_set()
    }

    fn rawlink(&self, link: Link) {
        self.core.add(link);
    }

    fn unlink(&self, link: &Link) {
        self.core.remove(link);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("set", &self.is_set())
            .field("links", &self.linkcount())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitFsm {
    Init,
    Waiting,
    Done(bool),
}

struct Registration {
    shared: Arc<Mutex<WaitShared>>,
    link: Link,
    timer: Option<TimerKey>,
}

/// Future returned by [`Event::wait`] and [`Event::wait_timeout`].
pub struct EventWait<'a> {
    event: &'a Event,
    deadline: Option<Time>,
    waiting: Option<Registration>,
    state: WaitFsm,
}

impl Future for EventWait<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        match this.state {
            WaitFsm::Init => {
                let core = &this.event.core;
                if core.is_level() && !core.notify_pending() {
                    this.state = WaitFsm::Done(true);
                    return Poll::Ready(true);
                }
                let (shared, link) = waiter_link(cx.waker().clone());
                core.add(Arc::clone(&link));
                let timer = this
                    .deadline
                    .map(|at| core.handle().arm_timer(at, cx.waker().clone()));
                this.waiting = Some(Registration {
                    shared,
                    link,
                    timer,
                });
                this.state = WaitFsm::Waiting;
                Poll::Pending
            }
            WaitFsm::Waiting => {
                let Some(reg) = this.waiting.take() else {
                    return Poll::Pending;
                };
                let fired = {
                    let mut shared = reg.shared.lock().expect("wait state lock poisoned");
                    if shared.fired {
                        true
                    } else {
                        shared.waker = Some(cx.waker().clone());
                        false
                    }
                };
                let handle = this.event.core.handle();
                if fired {
                    if let Some(key) = reg.timer {
                        handle.cancel_timer(key);
                    }
                    let set = this.event.is_set();
                    this.state = WaitFsm::Done(set);
                    return Poll::Ready(set);
                }
                if let Some(at) = this.deadline {
                    if handle.now() >= at {
                        this.event.core.remove(&reg.link);
                        if let Some(key) = reg.timer {
                            handle.cancel_timer(key);
                        }
                        this.state = WaitFsm::Done(false);
                        return Poll::Ready(false);
                    }
                }
                this.waiting = Some(reg);
                Poll::Pending
            }
            WaitFsm::Done(set) => Poll::Ready(set),
        }
    }
}

impl Drop for EventWait<'_> {
    fn drop(&mut self) {
        if let Some(reg) = self.waiting.take() {
            // Cancelled mid-wait: deregister before unwinding.
            self.event.core.remove(&reg.link);
            if let Some(key) = reg.timer {
                self.event.core.handle().cancel_timer(key);
            }
        }
    }
}
