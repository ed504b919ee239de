//! Link registry and deferred notification passes.
//!
//! A *link* is a callback registered on a primitive, invoked when that
//! primitive becomes ready. Both [`Event`](crate::event::Event) and
//! [`AsyncResult`](crate::result::AsyncResult) are thin shells around a
//! [`LinkCore`], which owns the registry and the notification machinery.
//!
//! # Notification passes
//!
//! Completing a primitive never invokes links inline. Instead a *pass* is
//! scheduled through [`Handle::defer`] and runs on a later scheduler turn.
//! Each registry entry carries a sequence number; the pass captures a
//! cutoff when it is scheduled and drains only entries registered below
//! it. Consequences:
//!
//! - the task that completes a primitive always finishes its current turn
//!   before any waiter resumes;
//! - a link registered from inside a pass callback is never invoked by
//!   that pass — it lands in the next one;
//! - each entry is invoked at most once per pass, in registration order.
//!
//! After draining, a pass that finds the primitive still ready and late
//! entries present schedules a follow-up pass, so late joiners are always
//! woken eventually without a fresh completion.
//!
//! # Cancel safety
//!
//! `remove` is a no-op when the link is absent; cleanup paths may unlink
//! speculatively after a pass has already consumed their entry.

use std::sync::{Arc, Mutex};
use std::task::Waker;

use smallvec::SmallVec;
use tracing::trace;

use crate::runtime::Handle;

/// A registered callback. Identity (for [`unlink`](Waitable::unlink)) is
/// `Arc` pointer identity; cloning a `Link` preserves it.
///
/// Links take no arguments: whatever context the callback needs is
/// captured by the closure.
pub type Link = Arc<dyn Fn()>;

/// The capability the wait aggregator needs from a primitive: observe
/// readiness and attach/detach links. Implemented by
/// [`Event`](crate::event::Event) and
/// [`AsyncResult`](crate::result::AsyncResult).
pub trait Waitable {
    /// Returns true if the primitive is currently ready.
    fn ready(&self) -> bool;

    /// Registers a link to be invoked when the primitive becomes ready.
    ///
    /// Duplicate registrations are permitted; each fires independently.
    /// Linking an already-ready primitive schedules a notification pass,
    /// so the link still fires (on a later turn).
    fn rawlink(&self, link: Link);

    /// Removes the first registration of `link` by identity. No-op if the
    /// link is not registered.
    fn unlink(&self, link: &Link);
}

struct LinkEntry {
    seq: u64,
    link: Link,
}

struct CoreState {
    entries: SmallVec<[LinkEntry; 4]>,
    next_seq: u64,
    /// Level-triggered readiness of the owning primitive.
    level: bool,
    /// True from pass scheduling until a drain finds no follow-up work.
    notify_pending: bool,
}

/// Registry of links plus the level flag of the owning primitive.
///
/// Shared as `Arc` so that scheduled passes can hold a `Weak` reference:
/// a pending pass never extends the primitive's lifetime, and a pass whose
/// primitive was dropped is a no-op.
pub(crate) struct LinkCore {
    handle: Handle,
    state: Mutex<CoreState>,
}

impl LinkCore {
    pub(crate) fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            state: Mutex::new(CoreState {
                entries: SmallVec::new(),
                next_seq: 0,
                level: false,
                notify_pending: false,
            }),
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn add(self: &Arc<Self>, link: Link) {
        let mut state = self.state.lock().expect("link registry lock poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(LinkEntry { seq, link });
        if state.level && !state.notify_pending {
            self.schedule_pass(&mut state);
        }
    }

    pub(crate) fn remove(&self, link: &Link) {
        let mut state = self.state.lock().expect("link registry lock poisoned");
        if let Some(pos) = state
            .entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.link, link))
        {
            state.entries.remove(pos);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .expect("link registry lock poisoned")
            .entries
            .len()
    }

    pub(crate) fn is_level(&self) -> bool {
        self.state.lock().expect("link registry lock poisoned").level
    }

    pub(crate) fn notify_pending(&self) -> bool {
        self.state
            .lock()
            .expect("link registry lock poisoned")
            .notify_pending
    }

    /// Raises or lowers the readiness level. Idempotent. Raising with
    /// links registered schedules a notification pass; lowering never
    /// notifies.
    pub(crate) fn set_level(self: &Arc<Self>, level: bool) {
        let mut state = self.state.lock().expect("link registry lock poisoned");
        if state.level == level {
            return;
        }
        state.level = level;
        if level && !state.entries.is_empty() && !state.notify_pending {
            self.schedule_pass(&mut state);
        }
    }

    /// Schedules a pass draining everything registered so far. Caller
    /// holds the state lock.
    fn schedule_pass(self: &Arc<Self>, state: &mut CoreState) {
        state.notify_pending = true;
        let cutoff = state.next_seq;
        let weak = Arc::downgrade(self);
        self.handle.defer(move || {
            if let Some(core) = weak.upgrade() {
                core.run_pass(cutoff);
            }
        });
    }

    /// One notification pass: drain entries below `cutoff` in registration
    /// order and invoke them with no lock held.
    fn run_pass(self: &Arc<Self>, cutoff: u64) {
        let batch: SmallVec<[Link; 4]> = {
            let mut state = self.state.lock().expect("link registry lock poisoned");
            let entries = std::mem::take(&mut state.entries);
            let (fire, keep): (SmallVec<[LinkEntry; 4]>, SmallVec<[LinkEntry; 4]>) =
                entries.into_iter().partition(|e| e.seq < cutoff);
            state.entries = keep;
            fire.into_iter().map(|e| e.link).collect()
        };
        trace!(links = batch.len(), "notification pass");
        for link in batch {
            link();
        }
        let mut state = self.state.lock().expect("link registry lock poisoned");
        if state.level && !state.entries.is_empty() {
            // Late joiners while the level stayed high: next turn.
            let cutoff = state.next_seq;
            let weak = Arc::downgrade(self);
            self.handle.defer(move || {
                if let Some(core) = weak.upgrade() {
                    core.run_pass(cutoff);
                }
            });
        } else {
            state.notify_pending = false;
        }
    }
}

impl std::fmt::Debug for LinkCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("link registry lock poisoned");
        f.debug_struct("LinkCore")
            .field("links", &state.entries.len())
            .field("level", &state.level)
            .field("notify_pending", &state.notify_pending)
            .finish()
    }
}

/// Shared state between a suspended wait and the link that wakes it.
pub(crate) struct WaitShared {
    pub(crate) fired: bool,
    pub(crate) waker: Option<Waker>,
}

/// Builds a wake-on-fire link for a suspended wait. The returned shared
/// state records whether the link has fired; the waiting future refreshes
/// the stored waker on every poll.
pub(crate) fn waiter_link(waker: Waker) -> (Arc<Mutex<WaitShared>>, Link) {
    let shared = Arc::new(Mutex::new(WaitShared {
        fired: false,
        waker: Some(waker),
    }));
    let inner = Arc::clone(&shared);
    let link: Link = Arc::new(move || {
        let waker = {
            let mut s = inner.lock().expect("wait state lock poisoned");
            s.fired = true;
            s.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    });
    (shared, link)
}
