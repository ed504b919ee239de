//! Coopsync: synchronization primitives for a cooperative single-threaded runtime.
//!
//! # Overview
//!
//! Coopsync provides the coordination core that higher-level patterns in a
//! cooperative runtime are built from: a manual-reset [`Event`], a
//! one-shot [`AsyncResult`] cell, and an N-of-M [`wait_ready`] aggregator,
//! all driven by a deterministic single-threaded [`Runtime`] with virtual
//! time. Concurrency comes from logically interleaved tasks, never from
//! parallel memory access.
//!
//! # Core Guarantees
//!
//! - **Deferred notification**: completing a primitive never runs waiter
//!   callbacks inline; the completing task always finishes its turn first
//! - **Pass isolation**: links registered during a notification pass are
//!   delivered by the next pass, never the current one
//! - **FIFO fairness**: links fire in registration order
//! - **Clean cancellation**: a timed-out, killed or dropped wait
//!   deregisters its link before unwinding, so it never receives a late
//!   notification
//! - **Write-once outcomes**: a result cell transitions exactly once and
//!   answers every subsequent reader identically
//! - **Deterministic time**: deadlines run on a virtual clock that only
//!   advances when nothing else is runnable
//!
//! # Module Structure
//!
//! - [`link`]: link registry, notification passes, the [`Waitable`] trait
//! - [`event`]: manual-reset level-triggered event
//! - [`result`]: one-shot result cell and its link-target adapters
//! - [`wait`]: N-of-M aggregation over heterogeneous waitables
//! - [`runtime`]: deterministic scheduler, tasks, deferred callbacks
//! - [`time`]: virtual clock, deadlines, sleeping
//! - [`test_utils`]: logging init and runtime constructors for tests
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use coopsync::{Event, Runtime};
//!
//! let mut rt = Runtime::new();
//! let handle = rt.handle();
//! let event = Arc::new(Event::new(&handle));
//!
//! let waiter = Arc::clone(&event);
//! handle.spawn::<_, bool, std::convert::Infallible>(async move {
//!     Ok(waiter.wait().await)
//! });
//!
//! event.set();
//! rt.run_until_quiescent();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod event;
pub mod link;
pub mod result;
pub mod runtime;
pub mod test_utils;
pub mod time;
pub mod wait;

pub use event::Event;
pub use link::{Link, Waitable};
pub use result::{AsyncResult, GetError, OutcomeLink};
pub use runtime::{Handle, Runtime, TaskHandle};
pub use time::{Elapsed, Time};
pub use wait::{wait_all, wait_ready};
