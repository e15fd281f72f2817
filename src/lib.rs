#![allow(clippy::let_and_return)]
//! User-space M:N fiber scheduling for Rust.
//! This library contains the following building blocks:
//!
//! - [Fibers: spawning, yielding, socket waits, syscall handoff](fiber)
//! - [Channels: rendezvous and bounded message passing](fiber::channel)
//! - [The scheduler: processors, work stealing, thread wake/park](sched)
//! - [Readiness events](poller)
//! - [Error handling](error)
//!
//! Many lightweight cooperative fibers are multiplexed onto a fixed pool of
//! logical processors bound to a smaller, demand-grown set of OS threads.
//! Scheduling is strictly cooperative: a fiber runs until it yields, waits
//! on a socket or a channel, or brackets a blocking syscall with
//! [`fiber::enter_syscall`]/[`fiber::exit_syscall`]. There is no
//! preemption, no per-fiber priorities and no shutdown: once
//! [`sched::start`] is called the scheduler runs until the process exits.
//!
//! ### Getting started
//!
//! ```no_run
//! use filament::{fiber, sched};
//!
//! sched::init(4).unwrap();
//! fiber::spawn(|| {
//!     println!("hello from a fiber");
//!     fiber::yield_now();
//!     println!("hello again");
//! })
//! .unwrap();
//! sched::start(); // never returns
//! ```
//!
//! ### Prerequisites
//!
//! - rustc 1.88 or newer
//! - Linux on x86_64 or aarch64
//!
//! ### Socket wakeups
//!
//! Sockets are integrated through a one-shot edge-triggered poller:
//! [`fiber::wait_io`] parks the calling fiber until the socket is ready and
//! returns the delivered [`poller::Events`] mask. Scheduler threads poll
//! opportunistically while dispatching; a dedicated helper thread calling
//! [`sched::net_poll`] guarantees wakeups even when every scheduler thread
//! is parked.

pub mod error;
pub mod fiber;
pub mod poller;
pub mod sched;

mod arch;
mod stack;

pub use error::Result;
