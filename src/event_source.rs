//! User-level event source with two wake modes.
//!
//! An [`EventSource`] is a counting semaphore plus a list of asynchronous
//! waiters. `notify` either hands the wakeup to the first registered waiter
//! (by posting its stored key to the driver's completion port) or bumps the
//! semaphore counter — never both. `wait`/`try_wait` are the plain semaphore
//! side, usable for inter-thread synchronization without a driver.
//!
//! # Waiter lifetime
//!
//! Waiter links live inside the waiting operation's per-op scratch; the
//! source holds them by raw pointer. The driver guarantees a link is removed
//! (by `notify`, by cancellation, or by completion) before its slot is
//! released, and slot release asserts the link's `in_list` flag is clear.
//! Destroying a source that still has registered waiters is a fatal
//! invariant violation.

use crate::port::{Key, PortHandle};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// Waiter link stored in an operation's scratch space.
#[derive(Debug)]
pub(crate) struct EventWaiter {
    /// Poster for the driver's completion port.
    pub(crate) port: PortHandle,
    /// Pre-encoded [`Key`] addressed at the waiting operation.
    pub(crate) key: Key,
    /// True while the link is registered in a source's waiter list.
    pub(crate) in_list: AtomicBool,
}

impl EventWaiter {
    pub(crate) fn new(port: PortHandle, key: Key) -> Self {
        Self {
            port,
            key,
            in_list: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.in_list.load(Ordering::Acquire)
    }
}

/// Raw waiter reference kept in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaiterRef(NonNull<EventWaiter>);

// SAFETY: the link outlives its presence in the list (see module docs);
// the list is only mutated under the source lock.
unsafe impl Send for WaiterRef {}

#[derive(Debug)]
struct State {
    counter: usize,
    closed: bool,
    waiters: VecDeque<WaiterRef>,
}

/// User-level semaphore with an asynchronous waiter list.
#[derive(Debug)]
pub struct EventSource {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for EventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource {
    /// Creates a source with a zero counter and no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                counter: 0,
                closed: false,
                waiters: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Wakes one waiter.
    ///
    /// If an asynchronous waiter is registered, its wakeup is delivered as a
    /// completion-port message addressed to the waiting operation. Otherwise
    /// the semaphore counter is bumped so a later `wait` consumes it.
    pub fn notify(&self) {
        let mut state = self.state.lock();
        if let Some(waiter) = state.waiters.pop_front() {
            // SAFETY: the link is alive while registered; we are removing it
            // under the lock, so no other path can release its slot yet.
            let link = unsafe { waiter.0.as_ref() };
            link.in_list.store(false, Ordering::Release);
            let (port, key) = (link.port.clone(), link.key);
            drop(state);
            if let Err(err) = port.post(key, std::ptr::from_ref(self) as usize) {
                tracing::warn!(error = %err, "event source wakeup post failed");
            }
        } else {
            state.counter += 1;
            drop(state);
            self.cond.notify_one();
        }
    }

    /// Blocks until the counter is positive, then decrements it.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.counter == 0 && !state.closed {
            self.cond.wait(&mut state);
        }
        state.counter = state.counter.saturating_sub(1);
    }

    /// Decrements the counter without blocking.
    ///
    /// Returns true if a notification was consumed.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.counter > 0 {
            state.counter -= 1;
            true
        } else {
            false
        }
    }

    /// Registers an asynchronous waiter.
    ///
    /// # Safety
    ///
    /// The link must stay valid until it is removed from the list (by
    /// [`Self::notify`] or [`Self::remove_waiter`]).
    pub(crate) unsafe fn add_waiter(&self, link: NonNull<EventWaiter>) {
        let mut state = self.state.lock();
        assert!(!state.closed, "waiter registered on a closed event source");
        // SAFETY: caller guarantees validity.
        unsafe { link.as_ref() }.in_list.store(true, Ordering::Release);
        state.waiters.push_back(WaiterRef(link));
    }

    /// Removes a previously registered waiter.
    ///
    /// Fails when the link is not in the list, which cancellation uses to
    /// detect a race against a concurrent `notify`.
    pub(crate) fn remove_waiter(&self, link: NonNull<EventWaiter>) -> Result<(), WaiterGone> {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.0 != link);
        if state.waiters.len() == before {
            return Err(WaiterGone);
        }
        // SAFETY: the link was registered and is therefore still alive.
        unsafe { link.as_ref() }.in_list.store(false, Ordering::Release);
        Ok(())
    }

    /// Closes the source, waking blocked `wait` callers.
    ///
    /// # Panics
    ///
    /// Panics if asynchronous waiters are still registered: every waiter must
    /// be consumed or cancelled before the source is destroyed.
    pub fn close(&self) {
        let mut state = self.state.lock();
        assert!(
            state.waiters.is_empty(),
            "event source closed with waiters still registered"
        );
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Number of registered asynchronous waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        assert!(
            state.waiters.is_empty() || std::thread::panicking(),
            "event source dropped with waiters still registered"
        );
    }
}

/// The waiter was not in the list (already consumed by a notify).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterGone;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn notify_then_wait_consumes_counter() {
        let source = EventSource::new();
        assert!(!source.try_wait());

        source.notify();
        assert!(source.try_wait());
        assert!(!source.try_wait());
    }

    #[test]
    fn wait_blocks_until_notified() {
        let source = Arc::new(EventSource::new());
        let waiter = {
            let source = Arc::clone(&source);
            std::thread::spawn(move || source.wait())
        };

        std::thread::sleep(Duration::from_millis(20));
        source.notify();
        waiter.join().expect("waiter thread panicked");
    }

    #[test]
    fn waiter_consumed_by_notify_not_counted() {
        let source = EventSource::new();
        let mut link = EventWaiter::new(PortHandle::dummy(), Key::nop());
        let ptr = NonNull::from(&mut link);

        unsafe { source.add_waiter(ptr) };
        assert!(link.is_registered());
        assert_eq!(source.waiter_count(), 1);

        // Consumes the waiter instead of bumping the counter. The post goes
        // nowhere on a dummy port; only the accounting matters here.
        source.notify();
        assert_eq!(source.waiter_count(), 0);
        assert!(!link.is_registered());
        assert!(!source.try_wait());
    }

    #[test]
    fn remove_waiter_after_notify_reports_gone() {
        let source = EventSource::new();
        let mut link = EventWaiter::new(PortHandle::dummy(), Key::nop());
        let ptr = NonNull::from(&mut link);

        unsafe { source.add_waiter(ptr) };
        source.notify();
        assert_eq!(source.remove_waiter(ptr), Err(WaiterGone));
    }

    #[test]
    fn remove_waiter_clears_registration() {
        let source = EventSource::new();
        let mut link = EventWaiter::new(PortHandle::dummy(), Key::nop());
        let ptr = NonNull::from(&mut link);

        unsafe { source.add_waiter(ptr) };
        assert!(source.remove_waiter(ptr).is_ok());
        assert!(!link.is_registered());
        assert_eq!(source.waiter_count(), 0);
    }

    #[test]
    fn close_wakes_blocked_waiters() {
        let source = Arc::new(EventSource::new());
        let waiter = {
            let source = Arc::clone(&source);
            std::thread::spawn(move || source.wait())
        };

        std::thread::sleep(Duration::from_millis(20));
        source.close();
        waiter.join().expect("waiter thread panicked");
    }

    #[test]
    #[should_panic(expected = "waiters still registered")]
    fn close_with_registered_waiter_is_fatal() {
        let source = EventSource::new();
        let mut link = EventWaiter::new(PortHandle::dummy(), Key::nop());
        unsafe { source.add_waiter(NonNull::from(&mut link)) };
        source.close();
    }
}
