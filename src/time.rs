//! Virtual time, deadlines and sleeping.
//!
//! The runtime measures time on a virtual monotonic clock that starts at
//! [`Time::ZERO`] and only advances when every task is suspended and every
//! deferred callback has run. This makes deadline behavior fully
//! deterministic: a test that waits 50ms observes exactly 50ms, every run.
//!
//! # Cancel safety
//!
//! [`Sleep`] is cancel-safe: dropping it disarms its timer and has no other
//! side effects.

use std::fmt;
use std::future::Future;
use std::ops::Add;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::runtime::{Handle, TimerKey};

/// An instant on the runtime's virtual monotonic clock, in nanoseconds
/// since the runtime was created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The zero instant (runtime start).
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a time from nanoseconds since runtime start.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since runtime start.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a time from seconds since runtime start.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Returns the time as nanoseconds since runtime start.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as milliseconds since runtime start (truncated).
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Adds a duration in nanoseconds, saturating on overflow.
    #[must_use]
    pub const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Returns the duration between two times in nanoseconds.
    ///
    /// Returns 0 if `self` is before `earlier`.
    #[must_use]
    pub const fn duration_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    #[allow(clippy::cast_possible_truncation)]
    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add_nanos(rhs.as_nanos() as u64)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

/// Error returned when a deadline expires before the awaited operation
/// completes, or when a non-blocking get finds its cell still pending.
///
/// The call that received this error is the only one affected; the
/// primitive itself is unchanged and remains eligible for future waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline elapsed at {deadline:?}")]
pub struct Elapsed {
    deadline: Time,
}

impl Elapsed {
    /// Creates a new `Elapsed` error with the deadline that was exceeded.
    #[must_use]
    pub const fn new(deadline: Time) -> Self {
        Self { deadline }
    }

    /// Returns the deadline that was exceeded.
    #[must_use]
    pub const fn deadline(&self) -> Time {
        self.deadline
    }
}

/// Returns a future that completes once the virtual clock reaches
/// `handle.now() + duration`.
///
/// A zero (or already elapsed) duration still suspends for one scheduler
/// turn, so `sleep(.., Duration::ZERO)` is a fair yield point rather than
/// a no-op.
#[must_use = "futures do nothing unless awaited"]
pub fn sleep(handle: &Handle, duration: Duration) -> Sleep {
    sleep_until(handle, handle.now() + duration)
}

/// Returns a future that completes once the virtual clock reaches
/// `deadline`.
#[must_use = "futures do nothing unless awaited"]
pub fn sleep_until(handle: &Handle, deadline: Time) -> Sleep {
    Sleep {
        handle: handle.clone(),
        deadline,
        state: SleepState::Init,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SleepState {
    Init,
    Waiting(TimerKey),
    Yielded,
    Done,
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[derive(Debug)]
pub struct Sleep {
    handle: Handle,
    deadline: Time,
    state: SleepState,
}

impl Sleep {
    /// Returns the deadline this sleep completes at.
    #[must_use]
    pub const fn deadline(&self) -> Time {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.state {
            SleepState::Init => {
                if self.handle.now() >= self.deadline {
                    // Already due: yield one turn instead of completing
                    // inline, so sleep(0) is a fair suspension point.
                    self.state = SleepState::Yielded;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                let key = self.handle.arm_timer(self.deadline, cx.waker().clone());
                self.state = SleepState::Waiting(key);
                Poll::Pending
            }
            SleepState::Waiting(key) => {
                if self.handle.now() >= self.deadline {
                    self.handle.cancel_timer(key);
                    self.state = SleepState::Done;
                    return Poll::Ready(());
                }
                Poll::Pending
            }
            SleepState::Yielded => {
                self.state = SleepState::Done;
                Poll::Ready(())
            }
            SleepState::Done => Poll::Ready(()),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let SleepState::Waiting(key) = self.state {
            self.handle.cancel_timer(key);
        }
    }
}
