//! In-flight reducer call tracking, keyed by `request_id`.
//!
//! A call is resolved one of two ways: a direct `ReducerResult` naming the
//! same `request_id`, or — for calls that commit — the `TransactionUpdate`
//! whose `reducer_call.request_id` and caller identity/connection match.
//! Either way, the callback-ordering contract holds: row callbacks for the
//! rows the reducer touched fire before this call's own resolution callback.

use crate::callbacks::{ReducerEvent, ReducerStatus};
use crate::identity::{ConnectionId, Identity};
use crate::message::{ReducerOutcome, TransactionUpdate, UpdateStatus};
use std::collections::HashMap;
use std::time::Instant;

pub type ReducerResultListener = Box<dyn FnOnce(Result<Vec<u8>, ReducerCallError>) + Send>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReducerCallError {
    /// The reducer ran and returned an application-level error payload.
    Returned(Vec<u8>),
    /// The reducer did not run to completion (e.g. ran out of energy) or
    /// the host reported an internal failure.
    Failed(String),
}

struct PendingCall {
    reducer_name: String,
    listener: Option<ReducerResultListener>,
    started_at: Instant,
}

/// Tracks reducer calls this connection has made but not yet heard back
/// about, keyed by the `request_id` assigned when the call was sent.
#[derive(Default)]
pub struct ReducerCallTracker {
    pending: HashMap<u32, PendingCall>,
}

impl ReducerCallTracker {
    pub fn new() -> Self {
        ReducerCallTracker::default()
    }

    pub fn register(&mut self, request_id: u32, reducer_name: String, listener: ReducerResultListener) {
        self.pending.insert(
            request_id,
            PendingCall {
                reducer_name,
                listener: Some(listener),
                started_at: Instant::now(),
            },
        );
    }

    /// Reject every call still pending, e.g. because the transport failed or
    /// `disconnect()` was called. Used instead of waiting on a reply that
    /// will never come.
    pub fn fail_all(&mut self, reason: &str) {
        for (_, mut call) in self.pending.drain() {
            if let Some(listener) = call.listener.take() {
                listener(Err(ReducerCallError::Failed(reason.to_string())));
            }
        }
    }

    /// Resolve a call directly from a `ReducerResult` message. Returns the
    /// `ReducerEvent` to hand to reducer-name listeners, if this
    /// `request_id` was one we were tracking.
    pub fn resolve_reducer_result(
        &mut self,
        request_id: u32,
        timestamp: crate::identity::Timestamp,
        outcome: ReducerOutcome,
    ) -> Option<ReducerEvent> {
        let mut call = self.pending.remove(&request_id)?;
        crate::stats::METRICS.reducer_round_trip.observe(call.started_at.elapsed().as_secs_f64());
        let (status, call_result) = match outcome {
            ReducerOutcome::Ok { ret_value, transaction_update } => (
                update_status_to_reducer_status(transaction_update.status.clone()),
                match &transaction_update.status {
                    UpdateStatus::Committed => Ok(ret_value.to_vec()),
                    UpdateStatus::Failed(reason) => Err(ReducerCallError::Failed(reason.to_string())),
                    UpdateStatus::OutOfEnergy => Err(ReducerCallError::Failed("out of energy".to_string())),
                },
            ),
            ReducerOutcome::Err(payload) => (
                ReducerStatus::Failed("reducer returned an error".to_string()),
                Err(ReducerCallError::Returned(payload.to_vec())),
            ),
            ReducerOutcome::InternalError(message) => (
                ReducerStatus::Failed(message.to_string()),
                Err(ReducerCallError::Failed(message.to_string())),
            ),
        };

        if let Some(listener) = call.listener.take() {
            listener(call_result);
        }

        Some(ReducerEvent {
            reducer_name: call.reducer_name,
            status,
            timestamp,
            caller_identity: Identity([0; 32]),
            caller_connection_id: ConnectionId([0; 16]),
            energy_quanta_used: 0,
            host_duration_micros: 0,
        })
    }

    /// Resolve a call via a matching `TransactionUpdate`'s caller attribution,
    /// used when the connection observes its own reducer's effects arrive as
    /// an ordinary transaction update rather than (or in addition to) a
    /// direct `ReducerResult`.
    pub fn resolve_transaction_update(
        &mut self,
        update: &TransactionUpdate,
        our_identity: Identity,
        our_connection_id: ConnectionId,
    ) -> Option<ReducerEvent> {
        if update.caller_identity != our_identity || update.caller_connection_id != our_connection_id {
            return None;
        }
        let request_id = update.reducer_call.request_id;
        let Some(mut call) = self.pending.remove(&request_id) else {
            return None;
        };
        crate::stats::METRICS.reducer_round_trip.observe(call.started_at.elapsed().as_secs_f64());

        let result = match &update.status {
            UpdateStatus::Committed => Ok(Vec::new()),
            UpdateStatus::Failed(reason) => Err(ReducerCallError::Failed(reason.to_string())),
            UpdateStatus::OutOfEnergy => Err(ReducerCallError::Failed("out of energy".to_string())),
        };
        if let Some(listener) = call.listener.take() {
            listener(result);
        }

        Some(ReducerEvent {
            reducer_name: call.reducer_name,
            status: update_status_to_reducer_status(update.status.clone()),
            timestamp: update.timestamp,
            caller_identity: update.caller_identity,
            caller_connection_id: update.caller_connection_id,
            energy_quanta_used: update.energy_quanta_used,
            host_duration_micros: update.host_duration_micros,
        })
    }
}

/// Build the `ReducerEvent` for a `TransactionUpdate` that arrived without
/// (or in addition to) a direct `ReducerResult` reply, e.g. one observed on
/// a connection that did not itself call the reducer.
pub(crate) fn reducer_event_from_transaction_update(update: &TransactionUpdate) -> ReducerEvent {
    ReducerEvent {
        reducer_name: update.reducer_call.reducer_name.to_string(),
        status: update_status_to_reducer_status(update.status.clone()),
        timestamp: update.timestamp,
        caller_identity: update.caller_identity,
        caller_connection_id: update.caller_connection_id,
        energy_quanta_used: update.energy_quanta_used,
        host_duration_micros: update.host_duration_micros,
    }
}

fn update_status_to_reducer_status(status: UpdateStatus) -> ReducerStatus {
    match status {
        UpdateStatus::Committed => ReducerStatus::Committed,
        UpdateStatus::Failed(reason) => ReducerStatus::Failed(reason.to_string()),
        UpdateStatus::OutOfEnergy => ReducerStatus::OutOfEnergy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Timestamp;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn sample_transaction_update(request_id: u32, caller_identity: Identity, caller_connection_id: ConnectionId) -> TransactionUpdate {
        TransactionUpdate {
            status: UpdateStatus::Committed,
            timestamp: Timestamp::from_micros_since_epoch(0),
            caller_identity,
            caller_connection_id,
            reducer_call: crate::message::ReducerCallInfo {
                reducer_name: "say_hello".into(),
                args: Bytes::new(),
                request_id,
            },
            energy_quanta_used: 10,
            host_duration_micros: 5,
            query_sets: Vec::new(),
        }
    }

    #[test]
    fn reducer_result_resolves_pending_call() {
        let mut tracker = ReducerCallTracker::new();
        let resolved = Arc::new(AtomicBool::new(false));
        let resolved2 = resolved.clone();
        tracker.register(
            1,
            "say_hello".to_string(),
            Box::new(move |result| {
                assert!(result.is_ok());
                resolved2.store(true, Ordering::SeqCst);
            }),
        );

        let update = sample_transaction_update(1, Identity([0; 32]), ConnectionId([0; 16]));
        let event = tracker
            .resolve_reducer_result(
                1,
                Timestamp::from_micros_since_epoch(0),
                ReducerOutcome::Ok {
                    ret_value: Bytes::new(),
                    transaction_update: update,
                },
            )
            .unwrap();
        assert!(resolved.load(Ordering::SeqCst));
        assert_eq!(event.reducer_name, "say_hello");
        assert_eq!(event.status, ReducerStatus::Committed);
    }

    #[test]
    fn unrelated_transaction_update_does_not_resolve_call() {
        let mut tracker = ReducerCallTracker::new();
        tracker.register(1, "say_hello".to_string(), Box::new(|_| panic!("should not resolve")));
        let update = sample_transaction_update(1, Identity([9; 32]), ConnectionId([0; 16]));
        let event = tracker.resolve_transaction_update(&update, Identity([0; 32]), ConnectionId([0; 16]));
        assert!(event.is_none());
    }

    #[test]
    fn matching_transaction_update_resolves_call() {
        let mut tracker = ReducerCallTracker::new();
        let resolved = Arc::new(AtomicBool::new(false));
        let resolved2 = resolved.clone();
        tracker.register(1, "say_hello".to_string(), Box::new(move |_| resolved2.store(true, Ordering::SeqCst)));
        let update = sample_transaction_update(1, Identity([0; 32]), ConnectionId([0; 16]));
        let event = tracker
            .resolve_transaction_update(&update, Identity([0; 32]), ConnectionId([0; 16]))
            .unwrap();
        assert!(resolved.load(Ordering::SeqCst));
        assert_eq!(event.energy_quanta_used, 10);
    }
}
