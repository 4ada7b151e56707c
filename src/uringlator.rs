//! Submission/completion coordinator shared by driver backends.
//!
//! The coordinator owns the operation table and the three queues of the
//! operation lifecycle:
//!
//! ```text
//! queue() ──▶ queued ──submit()──▶ backend.start
//!                                      │
//!              finished ◀── finish ────┤ (driver thread)
//!              inbox    ◀── finish ────┘ (worker threads, + nop wakeup)
//!                  │
//!                drain() ──▶ backend.complete ──▶ handler ──▶ release
//! ```
//!
//! `finish` exists in two safeties: the driver thread pushes straight onto
//! the local finished list and sets the signaled flag; worker threads push
//! onto a lock-free inbox and post a `nop` key so a blocked port dequeue
//! wakes up. Either way every operation is finished exactly once and
//! released exactly once, after its completion has been finalized.
//!
//! Link timeouts are coordinated here: whichever side of a linked pair
//! finishes first cancels the other through the backend hook.

use crate::error::{OpError, QueueError};
use crate::op::{Handler, OpTag, SubmitEntry};
use crate::port::{Key, PortHandle};
use crate::table::{OpId, OpTable};
use crossbeam_queue::SegQueue;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

/// Terminal result of one operation.
pub(crate) type OpResult = Result<(), OpError>;

/// Driver hooks invoked by the coordinator.
pub(crate) trait Backend {
    /// Starts a freshly submitted operation.
    fn start(&mut self, ur: &mut Uringlator, id: OpId);

    /// Attempts to terminate an in-flight operation immediately.
    ///
    /// True means the slot was finished with the cancellation error; false
    /// means the natural completion must be awaited.
    fn cancel(&mut self, ur: &mut Uringlator, id: OpId) -> bool;

    /// Finalizes a drained completion: writes caller outputs and releases
    /// per-op resources.
    fn complete(&mut self, ur: &mut Uringlator, id: OpId, result: OpResult);
}

/// Cross-thread completion inbox.
///
/// Workers report through [`FinishInbox::finish`]; the driver thread drains
/// the queue at the top of every loop iteration and after every `nop`
/// wakeup.
pub(crate) struct FinishInbox {
    queue: SegQueue<(OpId, OpResult)>,
    wake: OnceLock<PortHandle>,
}

impl FinishInbox {
    fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            wake: OnceLock::new(),
        }
    }

    /// Installs the port poster used to wake a blocked driver.
    pub(crate) fn set_wake(&self, port: PortHandle) {
        let _ = self.wake.set(port);
    }

    /// Thread-safe finish: enqueue the result and wake the driver.
    pub(crate) fn finish(&self, id: OpId, result: OpResult) {
        self.queue.push((id, result));
        if let Some(port) = self.wake.get() {
            if let Err(err) = port.post(Key::nop(), 0) {
                tracing::warn!(%id, error = %err, "nop wakeup post failed");
            }
        }
    }
}

/// The coordinator.
pub(crate) struct Uringlator {
    /// Operation storage; the driver reaches through this for payloads and
    /// contexts.
    pub(crate) table: OpTable,
    queued: VecDeque<OpId>,
    finished: VecDeque<(OpId, OpResult)>,
    inbox: Arc<FinishInbox>,
    signaled: bool,
}

impl Uringlator {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            table: OpTable::new(capacity),
            queued: VecDeque::new(),
            finished: VecDeque::new(),
            inbox: Arc::new(FinishInbox::new()),
            signaled: false,
        }
    }

    /// The shared inbox handed to worker closures.
    pub(crate) fn inbox(&self) -> Arc<FinishInbox> {
        Arc::clone(&self.inbox)
    }

    /// Allocates slots for a batch. All-or-nothing: a batch larger than the
    /// free capacity is rejected before any slot is claimed.
    pub(crate) fn queue<H: Handler>(
        &mut self,
        entries: &[SubmitEntry],
        handler: &mut H,
    ) -> Result<(), QueueError> {
        if entries.len() > self.table.available() {
            return Err(QueueError::Overflow);
        }
        let mut prev: Option<OpId> = None;
        for entry in entries {
            let id = self
                .table
                .alloc(entry.op.clone(), entry.user_data)
                .expect("capacity was checked for the whole batch");
            if entry.op.tag() == OpTag::LinkTimeout {
                if let Some(target) = prev {
                    self.table.set_companion(id, target);
                    self.table.set_companion(target, id);
                }
            }
            handler.queued(id, entry.user_data);
            self.queued.push_back(id);
            tracing::trace!(%id, user_data = entry.user_data, tag = ?entry.op.tag(), "queued");
            prev = Some(id);
        }
        Ok(())
    }

    /// Starts every queued operation through the backend.
    ///
    /// Returns true if anything was started.
    pub(crate) fn submit<B: Backend>(&mut self, backend: &mut B) -> bool {
        let mut any = false;
        while let Some(id) = self.queued.pop_front() {
            if self.table.lookup(id).is_some() {
                any = true;
                backend.start(self, id);
            }
        }
        any
    }

    /// Thread-unsafe finish from the driver thread.
    pub(crate) fn finish_now(&mut self, id: OpId, result: OpResult) {
        tracing::trace!(%id, ok = result.is_ok(), "finish");
        self.finished.push_back((id, result));
        self.signaled = true;
    }

    /// Moves inbox entries onto the local finished list.
    pub(crate) fn drain_inbox(&mut self) {
        while let Some(entry) = self.inbox.queue.pop() {
            self.finished.push_back(entry);
            self.signaled = true;
        }
    }

    /// Cancels an operation that has not been started yet.
    pub(crate) fn cancel_queued(&mut self, id: OpId) -> bool {
        if let Some(pos) = self.queued.iter().position(|q| *q == id) {
            self.queued.remove(pos);
            self.finish_now(id, Err(OpError::Canceled));
            true
        } else {
            false
        }
    }

    pub(crate) fn signaled(&self) -> bool {
        self.signaled
    }

    pub(crate) fn set_signaled(&mut self) {
        self.signaled = true;
    }

    /// Clears and returns the signaled flag.
    pub(crate) fn take_signaled(&mut self) -> bool {
        std::mem::take(&mut self.signaled)
    }

    /// Drains finished operations: finalize, report, release.
    ///
    /// Returns `(completed, errors)`. A finished entry whose slot is already
    /// gone (second finish of a cancel/completion race) is dropped — the
    /// first finish won.
    pub(crate) fn drain<B: Backend, H: Handler>(
        &mut self,
        backend: &mut B,
        handler: &mut H,
    ) -> (usize, usize) {
        let mut completed = 0;
        let mut errors = 0;
        while let Some((id, result)) = self.finished.pop_front() {
            if self.table.lookup(id).is_none() {
                tracing::trace!(%id, "dropping duplicate finish");
                continue;
            }
            // Link handling: the first side of a pair to drain cancels the
            // other.
            if let Some(companion) = self.table.companion(id) {
                self.table.clear_companion(id);
                if self.table.companion(companion) == Some(id) {
                    self.table.clear_companion(companion);
                    if !backend.cancel(self, companion) {
                        tracing::trace!(%companion, "companion completes naturally");
                    }
                }
            }
            let user_data = self.table.user_data(id);
            backend.complete(self, id, result);
            handler.completed(id, user_data, result);
            self.table.release(id);
            match result {
                Ok(()) => completed += 1,
                Err(_) => errors += 1,
            }
        }
        (completed, errors)
    }

    /// Quiesces for teardown: queued ops finish cancelled, in-flight ops get
    /// a cancel request each.
    pub(crate) fn shutdown<B: Backend>(&mut self, backend: &mut B) {
        while let Some(id) = self.queued.pop_front() {
            self.finish_now(id, Err(OpError::Canceled));
        }
        for id in self.table.ids() {
            let already_finished = self.finished.iter().any(|(fid, _)| *fid == id);
            if !already_finished && !backend.cancel(self, id) {
                tracing::debug!(%id, "waiting for natural completion during shutdown");
            }
        }
    }

    /// True when no operation is live or queued.
    pub(crate) fn is_idle(&self) -> bool {
        self.table.is_empty() && self.queued.is_empty() && self.finished.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{LinkTimeout, Operation, Timeout};
    use crate::test_utils::init_test_logging;
    use std::time::Duration;

    fn timeout_entry(user_data: u64) -> SubmitEntry {
        SubmitEntry::new(
            Operation::Timeout(Timeout {
                duration: Duration::from_millis(1),
            }),
            user_data,
        )
    }

    fn link_timeout_entry(user_data: u64) -> SubmitEntry {
        SubmitEntry::new(
            Operation::LinkTimeout(LinkTimeout {
                duration: Duration::from_millis(1),
            }),
            user_data,
        )
    }

    /// Backend that records hook invocations and finishes per policy.
    #[derive(Default)]
    struct MockBackend {
        started: Vec<OpId>,
        cancel_requests: Vec<OpId>,
        finalized: Vec<(OpId, OpResult)>,
        finish_on_start: bool,
        cancel_succeeds: bool,
    }

    impl Backend for MockBackend {
        fn start(&mut self, ur: &mut Uringlator, id: OpId) {
            self.started.push(id);
            if self.finish_on_start {
                ur.finish_now(id, Ok(()));
            }
        }

        fn cancel(&mut self, ur: &mut Uringlator, id: OpId) -> bool {
            self.cancel_requests.push(id);
            if self.cancel_succeeds {
                ur.finish_now(id, Err(OpError::Canceled));
                true
            } else {
                false
            }
        }

        fn complete(&mut self, ur: &mut Uringlator, id: OpId, result: OpResult) {
            self.finalized.push((id, result));
            ur.table.context_mut(id).release_owned();
        }
    }

    /// Handler capturing completion callbacks.
    #[derive(Default)]
    struct Capture {
        queued: Vec<(OpId, u64)>,
        completed: Vec<(OpId, u64, OpResult)>,
    }

    impl Handler for Capture {
        fn queued(&mut self, id: OpId, user_data: u64) {
            self.queued.push((id, user_data));
        }

        fn completed(&mut self, id: OpId, user_data: u64, result: OpResult) {
            self.completed.push((id, user_data, result));
        }
    }

    #[test]
    fn queue_submit_finish_drain_lifecycle() {
        init_test_logging();
        let mut ur = Uringlator::new(8);
        let mut backend = MockBackend {
            finish_on_start: true,
            ..Default::default()
        };
        let mut handler = Capture::default();

        ur.queue(&[timeout_entry(10), timeout_entry(20)], &mut handler)
            .expect("capacity");
        assert_eq!(handler.queued.len(), 2);

        assert!(ur.submit(&mut backend));
        assert_eq!(backend.started.len(), 2);

        let (completed, errors) = ur.drain(&mut backend, &mut handler);
        assert_eq!((completed, errors), (2, 0));
        assert_eq!(handler.completed.len(), 2);
        assert_eq!(handler.completed[0].1, 10);
        assert_eq!(handler.completed[1].1, 20);
        assert!(ur.is_idle());
    }

    #[test]
    fn overflow_rejects_whole_batch() {
        init_test_logging();
        let mut ur = Uringlator::new(2);
        let mut handler = Capture::default();

        let err = ur
            .queue(
                &[timeout_entry(1), timeout_entry(2), timeout_entry(3)],
                &mut handler,
            )
            .expect_err("over capacity");
        assert_eq!(err, QueueError::Overflow);
        assert!(handler.queued.is_empty());
        assert!(ur.is_idle());
    }

    #[test]
    fn exactly_one_completion_per_operation() {
        init_test_logging();
        let mut ur = Uringlator::new(4);
        let mut backend = MockBackend::default();
        let mut handler = Capture::default();

        ur.queue(&[timeout_entry(1)], &mut handler).expect("capacity");
        ur.submit(&mut backend);
        let id = backend.started[0];

        // A cancel finish and a racing natural completion both land in the
        // finished list; only the first reaches the handler.
        ur.finish_now(id, Err(OpError::Canceled));
        ur.finish_now(id, Ok(()));

        let (completed, errors) = ur.drain(&mut backend, &mut handler);
        assert_eq!((completed, errors), (0, 1));
        assert_eq!(handler.completed.len(), 1);
        assert!(handler.completed[0].2.is_err());
        assert!(ur.is_idle());
    }

    #[test]
    fn link_timeout_cancels_predecessor_when_it_fires_first() {
        init_test_logging();
        let mut ur = Uringlator::new(4);
        let mut backend = MockBackend {
            cancel_succeeds: true,
            ..Default::default()
        };
        let mut handler = Capture::default();

        ur.queue(&[timeout_entry(1), link_timeout_entry(2)], &mut handler)
            .expect("capacity");
        ur.submit(&mut backend);
        let (op, link) = (backend.started[0], backend.started[1]);

        // The timer behind the link fires first.
        ur.finish_now(link, Ok(()));
        let (completed, errors) = ur.drain(&mut backend, &mut handler);

        assert_eq!(backend.cancel_requests, vec![op]);
        assert_eq!((completed, errors), (1, 1));
        let op_result = handler
            .completed
            .iter()
            .find(|(id, _, _)| *id == op)
            .expect("predecessor completed");
        assert_eq!(op_result.2, Err(OpError::Canceled));
        assert!(ur.is_idle());
    }

    #[test]
    fn predecessor_finishing_first_cancels_link_timeout() {
        init_test_logging();
        let mut ur = Uringlator::new(4);
        let mut backend = MockBackend {
            cancel_succeeds: true,
            ..Default::default()
        };
        let mut handler = Capture::default();

        ur.queue(&[timeout_entry(1), link_timeout_entry(2)], &mut handler)
            .expect("capacity");
        ur.submit(&mut backend);
        let (op, link) = (backend.started[0], backend.started[1]);

        ur.finish_now(op, Ok(()));
        let (completed, errors) = ur.drain(&mut backend, &mut handler);

        assert_eq!(backend.cancel_requests, vec![link]);
        assert_eq!((completed, errors), (1, 1));
        assert!(ur.is_idle());
    }

    #[test]
    fn thread_safe_finish_arrives_through_inbox() {
        init_test_logging();
        let mut ur = Uringlator::new(4);
        let mut backend = MockBackend::default();
        let mut handler = Capture::default();

        ur.queue(&[timeout_entry(5)], &mut handler).expect("capacity");
        ur.submit(&mut backend);
        let id = backend.started[0];

        let inbox = ur.inbox();
        let worker = std::thread::spawn(move || inbox.finish(id, Ok(())));
        worker.join().expect("worker panicked");

        assert!(!ur.signaled());
        ur.drain_inbox();
        assert!(ur.take_signaled());

        let (completed, errors) = ur.drain(&mut backend, &mut handler);
        assert_eq!((completed, errors), (1, 0));
        assert!(ur.is_idle());
    }

    #[test]
    fn cancel_before_start_never_reaches_backend() {
        init_test_logging();
        let mut ur = Uringlator::new(4);
        let mut backend = MockBackend::default();
        let mut handler = Capture::default();

        ur.queue(&[timeout_entry(9)], &mut handler).expect("capacity");
        let id = handler.queued[0].0;

        assert!(ur.cancel_queued(id));
        ur.submit(&mut backend);
        assert!(backend.started.is_empty());

        let (completed, errors) = ur.drain(&mut backend, &mut handler);
        assert_eq!((completed, errors), (0, 1));
        assert_eq!(handler.completed[0].2, Err(OpError::Canceled));
        assert!(ur.is_idle());
    }

    #[test]
    fn total_completions_match_submissions_with_mixed_cancels() {
        init_test_logging();
        let total = 256;
        let cancel_at = [0usize, 7, 255];
        let mut ur = Uringlator::new(total);
        let mut backend = MockBackend {
            cancel_succeeds: true,
            ..Default::default()
        };
        let mut handler = Capture::default();

        let entries: Vec<SubmitEntry> = (0..total).map(|i| timeout_entry(i as u64)).collect();
        ur.queue(&entries, &mut handler).expect("capacity");
        ur.submit(&mut backend);

        let ids: Vec<OpId> = backend.started.clone();
        for &index in &cancel_at {
            let id = ids[index];
            assert!(backend.cancel(&mut ur, id));
        }
        for (index, id) in ids.iter().enumerate() {
            if !cancel_at.contains(&index) {
                ur.finish_now(*id, Ok(()));
            }
        }

        let (completed, errors) = ur.drain(&mut backend, &mut handler);
        assert_eq!(completed + errors, total);
        assert_eq!(errors, cancel_at.len());
        for &index in &cancel_at {
            let (_, user_data, result) = handler
                .completed
                .iter()
                .find(|(_, u, _)| *u == index as u64)
                .expect("cancelled op completed");
            assert_eq!(*user_data, index as u64);
            assert_eq!(*result, Err(OpError::Canceled));
        }
        assert!(ur.is_idle());
    }

    #[test]
    fn shutdown_cancels_queued_and_inflight() {
        init_test_logging();
        let mut ur = Uringlator::new(4);
        let mut backend = MockBackend {
            cancel_succeeds: true,
            ..Default::default()
        };
        let mut handler = Capture::default();

        ur.queue(&[timeout_entry(1), timeout_entry(2)], &mut handler)
            .expect("capacity");
        // Start only the first; the second stays queued.
        let first = ur.queued.pop_front().expect("queued");
        backend.start(&mut ur, first);

        ur.shutdown(&mut backend);
        let (completed, errors) = ur.drain(&mut backend, &mut handler);
        assert_eq!(completed, 0);
        assert_eq!(errors, 2);
        assert!(ur.is_idle());
    }
}
