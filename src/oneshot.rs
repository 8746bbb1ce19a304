//! A single `{set once, get waits until set, ready-check non-blocking}`
//! primitive shared by `PendingRequest` and the KV futures (§3, §9:
//! "provide a single generic `OneShot<T>` primitive").
//!
//! `tokio::sync::oneshot` is the obvious first reach, but its `Receiver`
//! can only be consumed once; §3 requires that "multiple `Wait()`
//! calls on an already-ready future ... return immediately with the same
//! result", so `T` must stay readable after the first wait. We use
//! `tokio::sync::Notify` plus a `Mutex<Option<T>>` instead, relying on
//! plain `tokio::sync` primitives rather than a bespoke channel type.

use std::sync::Mutex;
use tokio::sync::Notify;

pub struct OneShot<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Self {
        OneShot {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Completes the future. Only the first call has any effect; §3
    /// models completion as happening "exactly once".
    pub fn complete(&self, value: T) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(value);
            self.notify.notify_waiters();
        }
    }

    /// Non-blocking readiness check.
    pub fn is_ready(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Non-blocking read: `Some` if already completed, `None` otherwise.
    /// Used by `pending_req_poll`, which must never suspend the guest.
    pub fn try_get(&self) -> Option<T> {
        self.slot.lock().unwrap().clone()
    }

    /// Blocks (asynchronously) until `complete` has been called, then
    /// returns a clone of the stored value. Safe to call repeatedly.
    pub async fn wait(&self) -> T {
        loop {
            // `notify_waiters` only notifies waiters that were already
            // registered, and a `Notified` future only registers once it is
            // polled (or `enable`d). Call `enable()` before checking the
            // slot, following `Notify`'s documented race-free pattern, so a
            // `complete()` landing between the check and the `.await` below
            // can't be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(v) = self.slot.lock().unwrap().clone() {
                return v;
            }
            notified.await;
            // Re-check after waking: a spurious wakeup could otherwise loop
            // here without ever having the result to return.
            if let Some(v) = self.slot.lock().unwrap().clone() {
                return v;
            }
        }
    }
}

impl<T: Clone> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_returns_immediately_once_ready() {
        let os: Arc<OneShot<u32>> = Arc::new(OneShot::new());
        os.complete(42);
        assert!(os.is_ready());
        assert_eq!(os.wait().await, 42);
        assert_eq!(os.wait().await, 42);
    }

    #[tokio::test]
    async fn wait_blocks_until_complete() {
        let os: Arc<OneShot<u32>> = Arc::new(OneShot::new());
        let os2 = os.clone();
        let handle = tokio::spawn(async move { os2.wait().await });
        tokio::task::yield_now().await;
        os.complete(7);
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[test]
    fn try_get_is_none_before_completion() {
        let os: OneShot<u32> = OneShot::new();
        assert_eq!(os.try_get(), None);
        os.complete(5);
        assert_eq!(os.try_get(), Some(5));
    }

    #[tokio::test]
    async fn second_complete_is_ignored() {
        let os: OneShot<u32> = OneShot::new();
        os.complete(1);
        os.complete(2);
        assert_eq!(os.wait().await, 1);
    }
}
