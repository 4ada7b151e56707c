//! Winaio: the Windows backend of a portable asynchronous I/O
//! submission/completion engine.
//!
//! # Overview
//!
//! The engine accepts batches of operation descriptors, drives them to
//! completion using the native completion-port facility where the kernel
//! can express them, falls back to an elastic worker pool for blocking
//! operations, and delivers completion notifications through a caller
//! handler. Four wakeup sources funnel into one port dequeue:
//!
//! | Source | Mechanism |
//! |--------|-----------|
//! | Overlapped kernel I/O | port completion, slot recovered from the overlapped record |
//! | Timer queue | port-wait bound + expiry pass |
//! | Worker pool | thread-safe finish + `nop` port post |
//! | Event sources | port post addressed to the waiting slot |
//!
//! # Module Structure
//!
//! - [`op`]: operation descriptors, buffers, the batch entry and handler
//! - [`driver`]: the completion-port driver and its public surface
//! - [`port`]: completion-port wrapper and tagged key encoding
//! - [`pool`]: elastic worker pool with ordered acquisition
//! - [`timer`]: monotonic one-shot timer queue
//! - [`event_source`]: user-level semaphore with an async waiter list
//! - [`error`]: the closed operation error taxonomy
//!
//! The operation table, the coordinator, and the per-op context are
//! internal; they are exercised through the driver surface and their own
//! unit suites. Everything except the driver and the blocking executor is
//! portable — on non-Windows targets the driver compiles as a stub whose
//! constructor reports `Unsupported`.
//!
//! # Example
//!
//! ```ignore
//! use winaio::{CompleteMode, IocpDriver, Operation, SubmitEntry};
//!
//! let mut driver = IocpDriver::new(64)?;
//! let entries = [SubmitEntry::new(Operation::Timeout(timeout), 1)];
//! // SAFETY: the descriptors outlive their completions.
//! unsafe { driver.queue(&entries, &mut handler)? };
//! while driver.in_flight() > 0 {
//!     driver.complete(CompleteMode::Blocking, &mut handler);
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(not(windows), allow(dead_code))]

mod context;
pub mod driver;
pub mod error;
pub mod event_source;
#[cfg(windows)]
mod executor;
pub mod op;
pub mod pool;
pub mod port;
mod table;
#[cfg(test)]
mod test_utils;
pub mod timer;
mod uringlator;

pub use driver::{CompleteMode, CompleteResult, DriverOptions, IocpDriver};
pub use error::{OpError, QueueError};
pub use event_source::EventSource;
pub use op::{is_supported, Handler, NoopHandler, Operation, SubmitEntry};
pub use table::OpId;
