//! Subscription lifecycle: `Pending` -> `Active(queryId)` -> `Ended`, plus a
//! `LegacyActive` path for the whole-connection `subscribeToAllTables()`
//! call, which predates per-query subscription ids and never receives a
//! distinct `query_id`.

use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active { query_id: u64 },
    LegacyActive,
    Ended,
}

type AppliedListener = Box<dyn FnOnce() + Send>;
type ErrorListener = Box<dyn FnOnce(String) + Send>;
type EndedListener = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Listeners {
    on_applied: Vec<AppliedListener>,
    on_error: Vec<ErrorListener>,
    on_ended: Vec<EndedListener>,
}

struct Inner {
    state: SubscriptionState,
    request_id: u32,
    listeners: Listeners,
}

/// A handle to one subscription's lifecycle, shared between the caller
/// that created it and the dispatcher that drives it forward.
///
/// Each of `on_applied`/`on_error`/`on_ended` fires at most once: a
/// subscription either reaches `Active`, fails with a `SubscriptionError`,
/// or is ended by an explicit `unsubscribe`. Registering a listener after
/// the relevant transition has already happened invokes it immediately,
/// so callers never miss an event by subscribing to it late.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<Mutex<Inner>>,
}

impl SubscriptionHandle {
    pub fn new(request_id: u32) -> Self {
        SubscriptionHandle {
            inner: Arc::new(Mutex::new(Inner {
                state: SubscriptionState::Pending,
                request_id,
                listeners: Listeners::default(),
            })),
        }
    }

    pub fn request_id(&self) -> u32 {
        self.inner.lock().unwrap().request_id
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().state,
            SubscriptionState::Active { .. } | SubscriptionState::LegacyActive
        )
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, SubscriptionState::Ended)
    }

    /// Called by the dispatcher on a matching `SubscribeApplied`.
    pub fn mark_active(&self, query_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.state, SubscriptionState::Pending) {
            log::warn!("subscription reached Active from an unexpected state");
            return;
        }
        inner.state = SubscriptionState::Active { query_id };
        let listeners = std::mem::take(&mut inner.listeners.on_applied);
        drop(inner);
        for listener in listeners {
            listener();
        }
    }

    /// Called by the dispatcher on a legacy whole-connection `InitialSubscription`.
    pub fn mark_legacy_active(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SubscriptionState::LegacyActive;
        let listeners = std::mem::take(&mut inner.listeners.on_applied);
        drop(inner);
        for listener in listeners {
            listener();
        }
    }

    /// Called by the dispatcher on a matching `SubscriptionError`, or on a
    /// transport-level failure local to this subscription.
    pub fn mark_error(&self, message: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SubscriptionState::Ended;
        let listeners = std::mem::take(&mut inner.listeners.on_error);
        drop(inner);
        for listener in listeners {
            listener(message.clone());
        }
    }

    /// Called by the dispatcher on a matching `UnsubscribeApplied`.
    pub fn mark_ended(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SubscriptionState::Ended;
        let listeners = std::mem::take(&mut inner.listeners.on_ended);
        drop(inner);
        for listener in listeners {
            listener();
        }
    }

    pub fn on_applied(&self, listener: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SubscriptionState::Active { .. } | SubscriptionState::LegacyActive => {
                drop(inner);
                listener();
            }
            _ => inner.listeners.on_applied.push(Box::new(listener)),
        }
    }

    pub fn on_error(&self, listener: impl FnOnce(String) + Send + 'static) {
        self.inner.lock().unwrap().listeners.on_error.push(Box::new(listener));
    }

    pub fn on_ended(&self, listener: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, SubscriptionState::Ended) {
            drop(inner);
            listener();
        } else {
            inner.listeners.on_ended.push(Box::new(listener));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn pending_then_active_fires_on_applied_once() {
        let handle = SubscriptionHandle::new(1);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        handle.on_applied(move || fired2.store(true, Ordering::SeqCst));
        assert!(!fired.load(Ordering::SeqCst));
        handle.mark_active(99);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(handle.state(), SubscriptionState::Active { query_id: 99 });
    }

    #[test]
    fn on_applied_registered_after_active_fires_immediately() {
        let handle = SubscriptionHandle::new(1);
        handle.mark_active(5);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        handle.on_applied(move || fired2.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn subscription_error_ends_subscription() {
        let handle = SubscriptionHandle::new(1);
        handle.mark_error("boom".to_string());
        assert!(handle.is_ended());
        assert!(!handle.is_active());
    }
}
