//! Single-slot-per-waiter async mailbox.
//!
//! Inserts are synchronous and hand the value straight to a registered
//! waiter when there is one. Takes are asynchronous unless a backlog exists.
//! Both sides are FIFO: `insert` satisfies the earliest-registered waiter and
//! `next` drains the oldest backlog value.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use droprun_core::RequestStatus;
use thiserror::Error;
use tokio::sync::watch;

/// Why a request ended without a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// The waiter withdrew with the given reason.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// The queue was destroyed while the request was outstanding.
    #[error("queue was destroyed")]
    Destroyed,
}

/// Reason attached to requests settled by [`AsyncHandoffQueue::destroy`].
pub const DESTROYED_REASON: &str = "destroyed";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Outcome<T> {
    value: Option<T>,
    reason: Option<String>,
}

/// Shared state of one request. Settles exactly once.
struct Slot<T> {
    id: u64,
    status: watch::Sender<RequestStatus>,
    outcome: Mutex<Outcome<T>>,
}

impl<T> Slot<T> {
    fn new(id: u64, status: RequestStatus, value: Option<T>) -> Self {
        let (status, _) = watch::channel(status);
        Self {
            id,
            status,
            outcome: Mutex::new(Outcome {
                value,
                reason: None,
            }),
        }
    }

    fn current(&self) -> RequestStatus {
        *self.status.borrow()
    }

    /// Deliver a value; hands it back if the request already settled.
    fn fulfill(&self, value: T) -> Result<(), T> {
        let mut outcome = lock(&self.outcome);
        if self.current().is_settled() {
            return Err(value);
        }
        outcome.value = Some(value);
        self.status.send_replace(RequestStatus::Fulfilled);
        Ok(())
    }

    fn close(&self, status: RequestStatus, reason: String) -> bool {
        let mut outcome = lock(&self.outcome);
        if self.current().is_settled() {
            return false;
        }
        outcome.reason = Some(reason);
        self.status.send_replace(status);
        true
    }
}

struct Waiter<T> {
    id: u64,
    slot: Weak<Slot<T>>,
}

impl<T> Waiter<T> {
    fn is_live(&self) -> bool {
        self.slot.strong_count() > 0
    }
}

struct QueueInner<T> {
    backlog: VecDeque<T>,
    waiters: VecDeque<Waiter<T>>,
    next_id: u64,
}

/// Async mailbox with synchronous inserts and asynchronous takes.
///
/// Cloning yields another handle to the same queue. Requests whose every
/// handle has been dropped are skipped by `insert`, so a value is never
/// delivered to a waiter nobody observes.
pub struct AsyncHandoffQueue<T> {
    inner: Arc<Mutex<QueueInner<T>>>,
}

impl<T> Clone for AsyncHandoffQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for AsyncHandoffQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandoffQueue")
            .field("backlog", &self.backlog_len())
            .field("waiting", &self.waiting_len())
            .finish()
    }
}

impl<T> Default for AsyncHandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncHandoffQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                backlog: VecDeque::new(),
                waiters: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    /// Number of inserted values nobody has claimed yet.
    pub fn backlog_len(&self) -> usize {
        lock(&self.inner).backlog.len()
    }

    /// Number of requests waiting for a value.
    pub fn waiting_len(&self) -> usize {
        lock(&self.inner)
            .waiters
            .iter()
            .filter(|w| w.is_live())
            .count()
    }

    /// Hand `value` to the earliest live waiter, or append it to the backlog.
    ///
    /// Returns the backlog length after the insert.
    pub fn insert(&self, value: T) -> usize {
        let mut inner = lock(&self.inner);
        let mut value = value;
        while let Some(waiter) = inner.waiters.pop_front() {
            let Some(slot) = waiter.slot.upgrade() else {
                continue;
            };
            match slot.fulfill(value) {
                Ok(()) => return inner.backlog.len(),
                Err(returned) => value = returned,
            }
        }
        inner.backlog.push_back(value);
        inner.backlog.len()
    }

    /// Take the next value.
    ///
    /// With a backlog the returned request is already fulfilled with the
    /// oldest backlog value. Otherwise it is pending until an `insert`,
    /// `cancel`, or `destroy` settles it.
    pub fn next(&self) -> HandoffRequest<T> {
        let mut inner = lock(&self.inner);
        inner.waiters.retain(Waiter::is_live);

        let id = inner.next_id;
        inner.next_id += 1;

        if inner.waiters.is_empty() {
            if let Some(value) = inner.backlog.pop_front() {
                return HandoffRequest {
                    slot: Arc::new(Slot::new(id, RequestStatus::Fulfilled, Some(value))),
                    queue: Arc::downgrade(&self.inner),
                };
            }
        }

        let slot = Arc::new(Slot::new(id, RequestStatus::Pending, None));
        inner.waiters.push_back(Waiter {
            id,
            slot: Arc::downgrade(&slot),
        });
        HandoffRequest {
            slot,
            queue: Arc::downgrade(&self.inner),
        }
    }

    /// Drop every backlog value. Outstanding waiters are unaffected.
    pub fn clear(&self) {
        lock(&self.inner).backlog.clear();
    }

    /// Cancel every outstanding waiter with `reason`, as when the producer
    /// side gives up. The backlog is kept.
    ///
    /// Returns how many waiters were cancelled.
    pub fn cancel_waiting(&self, reason: &str) -> usize {
        let mut inner = lock(&self.inner);
        inner
            .waiters
            .drain(..)
            .filter_map(|waiter| waiter.slot.upgrade())
            .filter(|slot| slot.close(RequestStatus::Cancelled, reason.to_string()))
            .count()
    }

    /// Settle every outstanding waiter as destroyed and drop the backlog.
    ///
    /// The queue stays usable afterwards.
    pub fn destroy(&self) {
        let mut inner = lock(&self.inner);
        for waiter in inner.waiters.drain(..) {
            if let Some(slot) = waiter.slot.upgrade() {
                slot.close(RequestStatus::Destroyed, DESTROYED_REASON.to_string());
            }
        }
        inner.backlog.clear();
    }
}

/// Handle to one take from an [`AsyncHandoffQueue`].
///
/// Clones share the same request.
pub struct HandoffRequest<T> {
    slot: Arc<Slot<T>>,
    queue: Weak<Mutex<QueueInner<T>>>,
}

impl<T> Clone for HandoffRequest<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            queue: Weak::clone(&self.queue),
        }
    }
}

impl<T> std::fmt::Debug for HandoffRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffRequest")
            .field("id", &self.slot.id)
            .field("status", &self.status())
            .finish()
    }
}

impl<T> HandoffRequest<T> {
    /// Sequence number within the issuing queue.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn status(&self) -> RequestStatus {
        self.slot.current()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == RequestStatus::Pending
    }

    /// Reason given when the request was cancelled or destroyed.
    pub fn reason(&self) -> Option<String> {
        lock(&self.slot.outcome).reason.clone()
    }

    /// Withdraw from the queue's wait list.
    ///
    /// Returns false if the request had already settled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        match self.queue.upgrade() {
            Some(queue) => {
                let mut inner = lock(&queue);
                inner.waiters.retain(|w| w.id != self.slot.id);
                self.slot.close(RequestStatus::Cancelled, reason.into())
            }
            None => self.slot.close(RequestStatus::Cancelled, reason.into()),
        }
    }
}

impl<T: Clone> HandoffRequest<T> {
    /// The delivered value, once fulfilled.
    pub fn value(&self) -> Option<T> {
        lock(&self.slot.outcome).value.clone()
    }

    /// Wait until the request settles.
    pub async fn wait(&self) -> Result<T, HandoffError> {
        let mut rx = self.slot.status.subscribe();
        let status = *rx
            .wait_for(|status| status.is_settled())
            .await
            .map_err(|_| HandoffError::Destroyed)?;

        let outcome = lock(&self.slot.outcome);
        match status {
            RequestStatus::Fulfilled => outcome.value.clone().ok_or(HandoffError::Destroyed),
            RequestStatus::Cancelled => Err(HandoffError::Cancelled(
                outcome.reason.clone().unwrap_or_default(),
            )),
            RequestStatus::Destroyed | RequestStatus::Pending => Err(HandoffError::Destroyed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_backlog_drains_oldest_first() {
        let queue = AsyncHandoffQueue::new();
        assert_eq!(queue.insert("A"), 1);
        assert_eq!(queue.insert("B"), 2);

        let first = queue.next();
        assert_eq!(first.status(), RequestStatus::Fulfilled);
        assert_eq!(first.value(), Some("A"));

        let second = queue.next();
        assert_eq!(second.value(), Some("B"));
        assert_eq!(queue.backlog_len(), 0);
    }

    #[test]
    fn test_insert_satisfies_earliest_waiter() {
        let queue = AsyncHandoffQueue::new();
        let first = queue.next();
        let second = queue.next();
        assert_eq!(queue.waiting_len(), 2);

        assert_eq!(queue.insert("A"), 0);
        assert_eq!(first.status(), RequestStatus::Fulfilled);
        assert_eq!(first.value(), Some("A"));
        assert!(second.is_pending());

        queue.insert("B");
        assert_eq!(second.value(), Some("B"));
        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(queue.backlog_len(), 0);
    }

    #[test]
    fn test_values_are_never_lost_or_duplicated() {
        let queue = AsyncHandoffQueue::new();
        let waiters: Vec<_> = (0..3).map(|_| queue.next()).collect();
        for value in 0..5 {
            queue.insert(value);
        }

        let mut delivered: Vec<i32> = waiters.iter().filter_map(|w| w.value()).collect();
        assert_eq!(delivered, vec![0, 1, 2]);
        assert_eq!(queue.backlog_len(), 2);

        delivered.extend((0..2).filter_map(|_| queue.next().value()));
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.backlog_len(), 0);
    }

    #[test]
    fn test_cancel_removes_waiter() {
        let queue = AsyncHandoffQueue::new();
        let request = queue.next();
        assert!(request.cancel("timeout"));
        assert_eq!(request.status(), RequestStatus::Cancelled);
        assert_eq!(request.reason().as_deref(), Some("timeout"));
        assert_eq!(queue.waiting_len(), 0);

        // With no waiter left the value goes to the backlog.
        assert_eq!(queue.insert("A"), 1);
        assert_eq!(request.value(), None);
    }

    #[test]
    fn test_cancel_after_fulfil_is_noop() {
        let queue = AsyncHandoffQueue::new();
        let request = queue.next();
        queue.insert("A");
        assert!(!request.cancel("aborted"));
        assert_eq!(request.status(), RequestStatus::Fulfilled);
        assert_eq!(request.reason(), None);
    }

    #[test]
    fn test_destroy_settles_waiters_and_stays_usable() {
        let queue: AsyncHandoffQueue<String> = AsyncHandoffQueue::new();
        let waiter = queue.next();
        queue.destroy();
        assert_eq!(waiter.status(), RequestStatus::Destroyed);
        assert_eq!(waiter.reason().as_deref(), Some(DESTROYED_REASON));

        let fresh = queue.next();
        assert_eq!(fresh.status(), RequestStatus::Pending);
    }

    #[test]
    fn test_cancel_waiting_settles_live_waiters() {
        let queue = AsyncHandoffQueue::new();
        queue.insert("A");
        let fulfilled = queue.next();
        let first = queue.next();
        let second = queue.next();
        drop(queue.next());

        assert_eq!(queue.cancel_waiting("no solver"), 2);
        assert_eq!(first.status(), RequestStatus::Cancelled);
        assert_eq!(second.reason().as_deref(), Some("no solver"));
        assert_eq!(fulfilled.value(), Some("A"));
        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(queue.cancel_waiting("again"), 0);
    }

    #[test]
    fn test_destroy_clears_backlog() {
        let queue = AsyncHandoffQueue::new();
        queue.insert(1);
        queue.insert(2);
        queue.destroy();
        assert_eq!(queue.backlog_len(), 0);
        assert!(queue.next().is_pending());
    }

    #[test]
    fn test_clear_keeps_waiters() {
        let queue: AsyncHandoffQueue<u8> = AsyncHandoffQueue::new();
        let waiter = queue.next();
        queue.clear();
        assert!(waiter.is_pending());
        queue.insert(7);
        assert_eq!(waiter.value(), Some(7));
    }

    #[test]
    fn test_dropped_waiter_is_skipped() {
        let queue = AsyncHandoffQueue::new();
        let abandoned = queue.next();
        let live = queue.next();
        drop(abandoned);

        queue.insert("A");
        assert_eq!(live.value(), Some("A"));
        assert_eq!(queue.backlog_len(), 0);
    }

    #[test]
    fn test_only_dropped_waiters_falls_back_to_backlog() {
        let queue = AsyncHandoffQueue::new();
        drop(queue.next());
        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(queue.insert("A"), 1);
    }

    #[tokio::test]
    async fn test_wait_resolves_on_insert() {
        let queue = AsyncHandoffQueue::new();
        let request = queue.next();

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.insert("tok123".to_string());
        });

        let token = request.wait().await.unwrap();
        assert_eq!(token, "tok123");
    }

    #[tokio::test]
    async fn test_wait_reports_cancel_reason() {
        let queue: AsyncHandoffQueue<String> = AsyncHandoffQueue::new();
        let request = queue.next();
        let canceller = request.clone();

        tokio::spawn(async move {
            canceller.cancel("aborted");
        });

        let err = request.wait().await.unwrap_err();
        assert_eq!(err, HandoffError::Cancelled("aborted".to_string()));
    }

    #[tokio::test]
    async fn test_wait_reports_destroy() {
        let queue: AsyncHandoffQueue<String> = AsyncHandoffQueue::new();
        let request = queue.next();
        queue.destroy();
        assert_eq!(request.wait().await.unwrap_err(), HandoffError::Destroyed);
    }

    #[tokio::test]
    async fn test_wait_on_backlog_request_is_immediate() {
        let queue = AsyncHandoffQueue::new();
        queue.insert(5u32);
        assert_eq!(queue.next().wait().await, Ok(5));
    }
}
