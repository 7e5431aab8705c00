//! Adjustable concurrency gate.
//!
//! A bucket's in-flight concurrency is bounded by the server-discovered
//! `limit`, which is not known at creation time and changes as windows are
//! reported. [`tokio::sync::Semaphore`] cannot shrink its permit count once
//! handed out, so the gate is a small wait-and-recheck loop over a
//! [`Notify`]: waiters register before checking, and every release or resize
//! wakes them to re-evaluate.

use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct GateState {
    max: u32,
    in_flight: u32,
    /// Once set, every waiter is admitted unconditionally. Used when a
    /// bucket is superseded by its known counterpart so nothing stays parked
    /// on the dead gate.
    wide_open: bool,
}

/// Concurrency gate with a resizable maximum
#[derive(Debug)]
pub(crate) struct AdjustableGate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl AdjustableGate {
    pub(crate) fn new(max: u32) -> Self {
        Self {
            state: Mutex::new(GateState {
                max: max.max(1),
                in_flight: 0,
                wide_open: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Acquire a slot, suspending while the gate is full
    pub(crate) async fn acquire(&self) -> GatePermit<'_> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if state.wide_open || state.in_flight < state.max {
                    state.in_flight += 1;
                    return GatePermit { gate: self };
                }
            }
            notified.await;
        }
    }

    /// Resize the gate; a shrink takes effect as in-flight slots drain
    pub(crate) fn resize(&self, max: u32) {
        let mut state = self.state.lock().unwrap();
        let max = max.max(1);
        if state.max != max {
            state.max = max;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Let every current and future waiter through
    pub(crate) fn open_wide(&self) {
        self.state.lock().unwrap().wide_open = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn max(&self) -> u32 {
        self.state.lock().unwrap().max
    }

    /// Slots currently free
    pub(crate) fn available(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.max.saturating_sub(state.in_flight)
    }
}

/// RAII slot in an [`AdjustableGate`]; releasing wakes waiters
#[derive(Debug)]
pub(crate) struct GatePermit<'a> {
    gate: &'a AdjustableGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.gate.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_bounds_concurrency() {
        let gate = AdjustableGate::new(2);
        let first = gate.acquire().await;
        let _second = gate.acquire().await;
        assert_eq!(gate.available(), 0);

        // Third acquire must not complete while the gate is full
        let third = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(third.is_err());

        drop(first);
        let _third = tokio::time::timeout(Duration::from_millis(50), gate.acquire())
            .await
            .expect("released slot should admit the waiter");
    }

    #[tokio::test]
    async fn test_resize_grows_capacity() {
        let gate = Arc::new(AdjustableGate::new(1));
        let holder = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
                // Hold the only slot until the test ends
                std::future::pending::<()>().await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(gate.available(), 0);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
            })
        };
        tokio::task::yield_now().await;

        gate.resize(2);
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("resize should admit the waiter")
            .unwrap();
        assert_eq!(gate.max(), 2);
        holder.abort();
    }

    #[tokio::test]
    async fn test_resize_clamps_to_one() {
        let gate = AdjustableGate::new(4);
        gate.resize(0);
        assert_eq!(gate.max(), 1);
    }

    #[tokio::test]
    async fn test_open_wide_admits_everyone() {
        let gate = AdjustableGate::new(1);
        let _held = gate.acquire().await;
        gate.open_wide();

        let _a = tokio::time::timeout(Duration::from_millis(50), gate.acquire())
            .await
            .expect("wide-open gate admits unconditionally");
        let _b = tokio::time::timeout(Duration::from_millis(50), gate.acquire())
            .await
            .expect("wide-open gate admits unconditionally");
    }
}
