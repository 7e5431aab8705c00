//! Per-in-flight-call state.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use strum::Display;
use tokio::sync::Notify;

use super::bucket::Bucket;
use crate::types::{ClientId, RouteKey};

/// Process-unique request ids
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle status of a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RequestStatus {
    /// Waiting for bucket admission
    Queued,
    /// The HTTP call is in flight
    InProgress,
    /// Resolved with a response or an error
    Completed,
    /// Resolved by cancellation
    Aborted,
}

impl RequestStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::InProgress,
            2 => Self::Completed,
            _ => Self::Aborted,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::InProgress => 1,
            Self::Completed => 2,
            Self::Aborted => 3,
        }
    }

    const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Cooperative cancellation flag with wakeup.
///
/// Aborting is level-triggered: `aborted()` resolves immediately once the
/// flag is set, no matter when the future was created, so an abort can never
/// be lost between a check and a suspension point.
#[derive(Debug, Default)]
struct AbortSignal {
    flagged: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    fn abort(&self) {
        self.flagged.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_aborted(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    async fn aborted(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// State of one submitted request while it travels through the dispatcher.
///
/// Created on submission and destroyed on resolution; the status transitions
/// are compare-and-set so a racing abort and natural completion resolve the
/// caller exactly once.
#[derive(Debug)]
pub struct RequestHandle {
    id: u64,
    client: ClientId,
    route: RouteKey,
    status: AtomicU8,
    owner: Mutex<Weak<Bucket>>,
    abort: AbortSignal,
}

impl RequestHandle {
    pub(crate) fn new(client: ClientId, route: RouteKey) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            client,
            route,
            status: AtomicU8::new(RequestStatus::Queued.as_u8()),
            owner: Mutex::new(Weak::new()),
            abort: AbortSignal::default(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn client(&self) -> ClientId {
        self.client
    }

    pub(crate) fn route(&self) -> &RouteKey {
        &self.route
    }

    /// Current lifecycle status
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Mark the call as started. Fails if the request already resolved.
    pub(crate) fn start(&self) -> bool {
        self.status
            .compare_exchange(
                RequestStatus::Queued.as_u8(),
                RequestStatus::InProgress.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Transition to a terminal status. Returns whether this call performed
    /// the transition — at most one caller ever gets `true`.
    pub(crate) fn finish(&self, status: RequestStatus) -> bool {
        debug_assert!(status.is_terminal());
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if RequestStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                status.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Request cancellation. Safe to race with natural completion.
    pub(crate) fn abort(&self) {
        self.abort.abort();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Resolves once the request has been aborted
    pub(crate) async fn aborted(&self) {
        self.abort.aborted().await;
    }

    /// Replace the owning-bucket reference, returning the previous owner
    pub(crate) fn set_owner(&self, bucket: Weak<Bucket>) -> Weak<Bucket> {
        std::mem::replace(&mut *self.owner.lock().unwrap(), bucket)
    }

    /// The bucket currently owning this request, if it is still alive
    pub(crate) fn owner(&self) -> Option<std::sync::Arc<Bucket>> {
        self.owner.lock().unwrap().upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn handle() -> RequestHandle {
        RequestHandle::new(
            ClientId::new(1),
            RouteKey::new(Method::GET, "channels/1").unwrap(),
        )
    }

    #[test]
    fn test_status_transitions() {
        let handle = handle();
        assert_eq!(handle.status(), RequestStatus::Queued);
        assert!(handle.start());
        assert_eq!(handle.status(), RequestStatus::InProgress);
        assert!(!handle.start());
        assert!(handle.finish(RequestStatus::Completed));
        assert_eq!(handle.status(), RequestStatus::Completed);
    }

    #[test]
    fn test_finish_resolves_exactly_once() {
        let handle = handle();
        assert!(handle.finish(RequestStatus::Aborted));
        // A racing completion must lose
        assert!(!handle.finish(RequestStatus::Completed));
        assert_eq!(handle.status(), RequestStatus::Aborted);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(handle().id(), handle().id());
    }

    #[tokio::test]
    async fn test_abort_wakes_late_waiter() {
        let handle = std::sync::Arc::new(handle());
        handle.abort();
        // Future created after the flag was set must still resolve
        tokio::time::timeout(std::time::Duration::from_millis(50), handle.aborted())
            .await
            .expect("aborted() must resolve immediately once flagged");
    }
}
