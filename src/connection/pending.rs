//! Pending-call bookkeeping: one-shot slots keyed by request id, raced
//! against a deadline in the receive loop (§4.E).

use crate::error::Error;
use crate::protocol::{OneOffQueryResponse, ProcedureResult, TransactionUpdate};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// The result of an in-flight `CallReducer`, delivered by the matching
/// `TransactionUpdate`.
pub type ReducerReply = Result<TransactionUpdate, Error>;

/// The result of an in-flight `CallProcedure`.
pub type ProcedureReply = Result<ProcedureResult, Error>;

/// The result of an in-flight subscription request: the server's
/// `SubscribeApplied`/`SubscribeMultiApplied`/`InitialSubscription` carries
/// no payload the caller needs beyond "it applied", so completion is a
/// plain unit-or-error.
pub type SubscriptionReply = Result<(), Error>;

/// The result of an in-flight `OneOffQuery`, delivered by the matching
/// `OneOffQueryResponse`.
pub type OneOffReply = Result<OneOffQueryResponse, Error>;

pub enum PendingCall {
    Reducer(oneshot::Sender<ReducerReply>),
    /// Carries the procedure name alongside the slot: unlike `TransactionUpdate`,
    /// `ProcedureResult` has no name field to report on failure (§4.B).
    Procedure(oneshot::Sender<ProcedureReply>, String),
    Subscription(oneshot::Sender<SubscriptionReply>),
}

impl PendingCall {
    /// Complete the slot with a session-level error (reconnect, shutdown,
    /// cancellation). Consumes `self`; dropping the sender would also wake
    /// the receiver with a `RecvError`, but completing explicitly lets us
    /// pick the taxonomic error.
    pub fn fail(self, err: Error) {
        match self {
            PendingCall::Reducer(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingCall::Procedure(tx, _) => {
                let _ = tx.send(Err(err));
            }
            PendingCall::Subscription(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// A registry of in-flight requests keyed by request id, plus the
/// monotonically increasing (wrapping) generators for request ids and
/// query ids (§4.E).
///
/// `OneOffQuery` carries no `request_id` (§4.B) — it is correlated by a
/// caller-chosen `message_id` byte string instead, so its slots live in a
/// separate map keyed by that value.
#[derive(Default)]
pub struct PendingRegistry {
    slots: HashMap<u32, PendingCall>,
    one_off_slots: HashMap<Bytes, oneshot::Sender<OneOffReply>>,
    next_request_id: u32,
    next_query_id: u32,
    next_message_id: u64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strictly increasing until `u32::MAX`, then wraps to 0 and continues
    /// monotonically (§8 property 9).
    pub fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    pub fn next_query_id(&mut self) -> u32 {
        let id = self.next_query_id;
        self.next_query_id = self.next_query_id.wrapping_add(1);
        id
    }

    /// A fresh, session-unique `message_id` for a `OneOffQuery`.
    pub fn next_message_id(&mut self) -> Bytes {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        Bytes::copy_from_slice(&id.to_le_bytes())
    }

    pub fn insert(&mut self, request_id: u32, call: PendingCall) {
        self.slots.insert(request_id, call);
    }

    pub fn remove(&mut self, request_id: u32) -> Option<PendingCall> {
        self.slots.remove(&request_id)
    }

    pub fn insert_one_off(&mut self, message_id: Bytes, tx: oneshot::Sender<OneOffReply>) {
        self.one_off_slots.insert(message_id, tx);
    }

    pub fn remove_one_off(&mut self, message_id: &[u8]) -> Option<oneshot::Sender<OneOffReply>> {
        self.one_off_slots.remove(message_id)
    }

    /// Remove and fail every outstanding slot, e.g. on reconnect or shutdown.
    pub fn fail_all(&mut self, err_for: impl Fn() -> Error) {
        for (_, call) in self.slots.drain() {
            call.fail(err_for());
        }
        for (_, tx) in self.one_off_slots.drain() {
            let _ = tx.send(Err(err_for()));
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_wraps_monotonically() {
        let mut reg = PendingRegistry { next_request_id: u32::MAX, ..PendingRegistry::default() };
        assert_eq!(reg.next_request_id(), u32::MAX);
        assert_eq!(reg.next_request_id(), 0);
        assert_eq!(reg.next_request_id(), 1);
    }

    #[tokio::test]
    async fn fail_all_wakes_every_pending_caller() {
        let mut reg = PendingRegistry::new();
        let (tx, rx) = oneshot::channel();
        reg.insert(1, PendingCall::Reducer(tx));
        reg.fail_all(|| Error::Cancelled);
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(reg.is_empty());
    }
}
