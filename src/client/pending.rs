//! Pending-call table keyed by correlation token.
//!
//! An entry is inserted before its call is published and removed exactly
//! once, by whichever terminal event reaches it first.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Result;
use crate::protocol::{CorrelationId, StructuredValue};

/// Completion slot for one in-flight call
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub name: String,
    pub sender: oneshot::Sender<Result<StructuredValue>>,
    /// `None` when calls are unbounded
    pub deadline: Option<Instant>,
    pub created_at: Instant,
}

impl PendingCall {
    pub fn complete(self, result: Result<StructuredValue>) {
        // The caller may have stopped waiting
        let _ = self.sender.send(result);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: DashMap<CorrelationId, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: CorrelationId, call: PendingCall) {
        self.calls.insert(token, call);
    }

    /// Take the entry for `token`; only the first taker gets it
    pub fn take(&self, token: &CorrelationId) -> Option<PendingCall> {
        self.calls.remove(token).map(|(_, call)| call)
    }

    /// Take every entry whose deadline is at or before `now`
    pub fn take_expired(&self, now: Instant) -> Vec<(CorrelationId, PendingCall)> {
        let expired: Vec<CorrelationId> = self
            .calls
            .iter()
            .filter(|entry| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|token| self.calls.remove(&token))
            .collect()
    }

    /// Take every entry
    pub fn drain(&self) -> Vec<(CorrelationId, PendingCall)> {
        let tokens: Vec<CorrelationId> = self.calls.iter().map(|e| e.key().clone()).collect();
        tokens
            .into_iter()
            .filter_map(|token| self.calls.remove(&token))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Removes a pending entry if the waiting future is dropped before completion
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    token: CorrelationId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingCalls, token: CorrelationId) -> Self {
        Self {
            pending,
            token,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.take(&self.token);
        }
    }
}
